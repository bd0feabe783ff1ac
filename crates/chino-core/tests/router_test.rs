//! Out-of-order completion across lanes always reassembles the reply in order.

use std::sync::Arc;
use std::time::Duration;

use chino_core::llm::ReplySentence;
use chino_core::router::SentenceStatus;
use chino_core::TokenRouter;

fn reply(n: usize) -> Vec<ReplySentence> {
    (0..n).map(|i| ReplySentence::plain(format!("sentence {i}"))).collect()
}

fn texts(sentences: &[ReplySentence]) -> Vec<String> {
    sentences.iter().map(|s| s.text_spoken.clone()).collect()
}

#[test]
fn every_completion_order_yields_the_same_reply() {
    let orders: &[&[usize]] = &[
        &[0, 1, 2, 3, 4],
        &[4, 3, 2, 1, 0],
        &[1, 0, 3, 2, 4],
        &[2, 4, 0, 3, 1],
        &[3, 1, 4, 0, 2],
    ];
    for lanes in 1..=3 {
        for order in orders {
            let router = TokenRouter::new(lanes).unwrap();
            router.route(reply(5), Some("r1".into()));

            let mut prefix_len = 0;
            for (step, &index) in order.iter().enumerate() {
                assert!(router.mark_completed(index));
                let prefix = router.completed_prefix();
                assert!(prefix.len() >= prefix_len, "prefix shrank");
                prefix_len = prefix.len();
                assert_eq!(router.is_all_completed(), step == order.len() - 1);
            }
            assert_eq!(texts(&router.build_ordered_response()), texts(&reply(5)));
            assert_eq!(router.completed_prefix().len(), 5);
        }
    }
}

#[test]
fn partial_completion_reports_only_finished_sentences() {
    let router = TokenRouter::new(2).unwrap();
    router.route(reply(5), None);
    for index in [3, 0, 4] {
        assert!(router.mark_completed(index));
    }
    assert_eq!(
        texts(&router.build_ordered_response()),
        vec!["sentence 0", "sentence 3", "sentence 4"]
    );
    assert_eq!(texts(&router.completed_prefix()), vec!["sentence 0"]);

    for index in [1, 2] {
        assert!(router.mark_completed(index));
    }
    assert!(router.is_all_completed());
    assert_eq!(texts(&router.build_ordered_response()), texts(&reply(5)));
}

#[tokio::test]
async fn concurrent_lane_workers_finish_the_reply() {
    let router = Arc::new(TokenRouter::new(3).unwrap());
    router.route(reply(7), None);

    let mut workers = Vec::new();
    for lane in 0..3 {
        let router = Arc::clone(&router);
        workers.push(tokio::spawn(async move {
            let mut done = Vec::new();
            while let Some(s) = router.next(lane) {
                assert_eq!(s.lane, lane);
                assert_eq!(s.status, SentenceStatus::Processing);
                // later lanes finish faster so completions arrive out of order
                tokio::time::sleep(Duration::from_millis(5 * (3 - lane as u64))).await;
                assert!(router.mark_completed(s.index));
                done.push(s.index);
            }
            done
        }));
    }

    assert!(router.wait_until_done(Some(Duration::from_secs(2))).await);
    let mut all: Vec<usize> = Vec::new();
    for w in workers {
        all.extend(w.await.unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (0..7).collect::<Vec<_>>());
    assert_eq!(texts(&router.build_ordered_response()), texts(&reply(7)));

    let status = router.status();
    assert_eq!(status.completed, 7);
    assert!(status.lanes.iter().all(|l| l.idle));
}

#[tokio::test]
async fn new_reply_replaces_the_previous_one() {
    let router = TokenRouter::new(2).unwrap();
    router.route(reply(4), Some("old".into()));
    assert!(router.mark_completed(0));

    router.route(reply(2), Some("new".into()));
    assert_eq!(router.status().response_id.as_deref(), Some("new"));
    assert!(!router.is_all_completed());
    assert!(!router.mark_completed(3));

    assert_eq!(router.process_all_sequential().len(), 2);
    assert!(router.wait_until_done(Some(Duration::from_millis(100))).await);
}

#[test]
fn stale_completion_racing_route_never_lands_on_new_reply() {
    for _ in 0..2_000 {
        let router = Arc::new(TokenRouter::new(1).unwrap());
        router.route(reply(1), Some("old".into()));
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let worker = {
            let router = Arc::clone(&router);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                router.mark_completed_for("old", 0)
            })
        };
        barrier.wait();
        router.route(reply(1), Some("new".into()));
        let completed_old = worker.join().unwrap();

        let status = router.status();
        assert_eq!(status.response_id.as_deref(), Some("new"));
        assert_eq!(status.completed, 0, "stale completion (old accepted: {completed_old})");
        assert!(!router.is_all_completed());
    }
}
