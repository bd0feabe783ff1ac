//! Token router: fans the sentences of one reply out across K parallel lanes and
//! reassembles them in original order, whatever order the lanes finish in.
//!
//! Sentence `i` always lands in lane `i mod K`. Each lane is consumed by exactly
//! one worker (`next` / `wait_next`), which reports back with `mark_completed`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::llm::ReplySentence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SentenceStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledSentence {
    pub index: usize,
    pub lane: usize,
    pub response_id: String,
    pub status: SentenceStatus,
    pub sentence: ReplySentence,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStatus {
    pub lane: usize,
    pub pending: usize,
    pub idle: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub response_id: Option<String>,
    pub total: usize,
    pub completed: usize,
    pub all_completed: bool,
    pub lanes: Vec<LaneStatus>,
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<usize>,
    current: Option<usize>,
}

#[derive(Default)]
struct RouterState {
    response_id: Option<String>,
    sentences: Vec<LabeledSentence>,
    completed: BTreeSet<usize>,
    lanes: Vec<Lane>,
}

impl RouterState {
    fn all_completed(&self) -> bool {
        !self.sentences.is_empty() && self.completed.len() == self.sentences.len()
    }
}

pub struct TokenRouter {
    lane_count: usize,
    state: Mutex<RouterState>,
    lane_ready: Vec<Notify>,
    done_tx: watch::Sender<bool>,
}

impl TokenRouter {
    pub fn new(lanes: usize) -> CoreResult<Self> {
        if lanes == 0 {
            return Err(CoreError::Config("token router needs at least one lane".into()));
        }
        let (done_tx, _) = watch::channel(false);
        Ok(Self {
            lane_count: lanes,
            state: Mutex::new(RouterState {
                lanes: (0..lanes).map(|_| Lane::default()).collect(),
                ..RouterState::default()
            }),
            lane_ready: (0..lanes).map(|_| Notify::new()).collect(),
            done_tx,
        })
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear(&self, state: &mut RouterState) {
        state.response_id = None;
        state.sentences.clear();
        state.completed.clear();
        for lane in &mut state.lanes {
            lane.queue.clear();
            lane.current = None;
        }
        self.done_tx.send_replace(false);
    }

    /// Replace any in-progress reply with `sentences`, labelled `0..N` and queued on
    /// lane `i mod K`. A missing response id gets a fresh uuid.
    pub fn route(&self, sentences: Vec<ReplySentence>, response_id: Option<String>) -> Vec<LabeledSentence> {
        let response_id = response_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let labeled: Vec<LabeledSentence> = sentences
            .into_iter()
            .enumerate()
            .map(|(index, sentence)| LabeledSentence {
                index,
                lane: index % self.lane_count,
                response_id: response_id.clone(),
                status: SentenceStatus::Pending,
                sentence,
            })
            .collect();

        {
            let mut state = self.lock();
            self.clear(&mut state);
            state.response_id = Some(response_id.clone());
            for s in &labeled {
                state.lanes[s.lane].queue.push_back(s.index);
            }
            state.sentences = labeled.clone();
        }
        for s in &labeled {
            self.lane_ready[s.lane].notify_one();
        }
        info!(target: "chino::router", response_id = %response_id, sentences = labeled.len(), lanes = self.lane_count, "routed reply");
        labeled
    }

    /// Pull the next pending sentence from `lane` without waiting.
    pub fn next(&self, lane: usize) -> Option<LabeledSentence> {
        let mut state = self.lock();
        let index = state.lanes.get_mut(lane)?.queue.pop_front()?;
        state.lanes[lane].current = Some(index);
        let sentence = &mut state.sentences[index];
        sentence.status = SentenceStatus::Processing;
        Some(sentence.clone())
    }

    /// Pull the next sentence from `lane`, waiting until one is routed.
    pub async fn wait_next(&self, lane: usize) -> Option<LabeledSentence> {
        let notify = self.lane_ready.get(lane)?;
        loop {
            if let Some(sentence) = self.next(lane) {
                return Some(sentence);
            }
            notify.notified().await;
        }
    }

    /// Record that sentence `index` is done. Returns `false` for an index outside the
    /// current reply or one already completed.
    pub fn mark_completed(&self, index: usize) -> bool {
        let mut state = self.lock();
        self.complete_locked(&mut state, index)
    }

    /// `mark_completed` guarded by the reply id. Lane workers use this so a
    /// sentence finished after `route` replaced its reply is ignored.
    pub fn mark_completed_for(&self, response_id: &str, index: usize) -> bool {
        let mut state = self.lock();
        if state.response_id.as_deref() != Some(response_id) {
            debug!(target: "chino::router", response_id, index, "completion for a replaced reply ignored");
            return false;
        }
        self.complete_locked(&mut state, index)
    }

    fn complete_locked(&self, state: &mut RouterState, index: usize) -> bool {
        let Some(sentence) = state.sentences.get_mut(index) else {
            warn!(target: "chino::router", index, "completion for unknown sentence");
            return false;
        };
        if sentence.status == SentenceStatus::Completed {
            warn!(target: "chino::router", index, "sentence already completed");
            return false;
        }
        sentence.status = SentenceStatus::Completed;
        let lane = sentence.lane;

        let lane = &mut state.lanes[lane];
        if lane.current == Some(index) {
            lane.current = None;
        } else {
            lane.queue.retain(|i| *i != index);
        }
        state.completed.insert(index);
        debug!(target: "chino::router", index, completed = state.completed.len(), total = state.sentences.len(), "sentence completed");

        if state.all_completed() {
            // send_if_modified keeps the signal to exactly one transition per reply
            self.done_tx.send_if_modified(|done| {
                if *done {
                    false
                } else {
                    *done = true;
                    true
                }
            });
            info!(target: "chino::router", total = state.sentences.len(), "all sentences completed");
        }
        true
    }

    pub fn is_all_completed(&self) -> bool {
        self.lock().all_completed()
    }

    /// Wait for the current reply to finish. `None` waits without limit.
    /// Returns `false` on timeout or if the router is dropped.
    pub async fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.done_tx.subscribe();
        let wait = rx.wait_for(|done| *done);
        match timeout {
            Some(limit) => matches!(tokio::time::timeout(limit, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        }
    }

    /// Every completed sentence in original index order, whatever order the lanes
    /// finished in.
    pub fn build_ordered_response(&self) -> Vec<ReplySentence> {
        self.lock()
            .sentences
            .iter()
            .filter(|s| s.status == SentenceStatus::Completed)
            .map(|s| s.sentence.clone())
            .collect()
    }

    /// The longest run of completed sentences starting at index 0.
    pub fn completed_prefix(&self) -> Vec<ReplySentence> {
        let state = self.lock();
        state
            .sentences
            .iter()
            .take_while(|s| s.status == SentenceStatus::Completed)
            .map(|s| s.sentence.clone())
            .collect()
    }

    /// Drop the current reply and every queued sentence.
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.sentences.len() - state.completed.len();
        self.clear(&mut state);
        debug!(target: "chino::router", dropped, "router reset");
    }

    pub fn status(&self) -> RouterStatus {
        let state = self.lock();
        RouterStatus {
            response_id: state.response_id.clone(),
            total: state.sentences.len(),
            completed: state.completed.len(),
            all_completed: state.all_completed(),
            lanes: state
                .lanes
                .iter()
                .enumerate()
                .map(|(lane, l)| LaneStatus {
                    lane,
                    pending: l.queue.len(),
                    idle: l.current.is_none() && l.queue.is_empty(),
                })
                .collect(),
        }
    }

    /// Complete every lane in round-robin order without a synthesis step and
    /// return the reply in order. Used when no lane workers are attached.
    pub fn process_all_sequential(&self) -> Vec<ReplySentence> {
        loop {
            let mut progressed = false;
            for lane in 0..self.lane_count {
                if let Some(s) = self.next(lane) {
                    self.mark_completed(s.index);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.build_ordered_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(n: usize) -> Vec<ReplySentence> {
        (0..n).map(|i| ReplySentence::plain(format!("s{i}"))).collect()
    }

    #[test]
    fn zero_lanes_is_a_config_error() {
        assert!(matches!(TokenRouter::new(0), Err(CoreError::Config(_))));
    }

    #[test]
    fn round_robin_assignment() {
        let router = TokenRouter::new(2).unwrap();
        let labeled = router.route(sentences(5), Some("r1".into()));
        let lanes: Vec<_> = labeled.iter().map(|s| s.lane).collect();
        assert_eq!(lanes, vec![0, 1, 0, 1, 0]);
        assert_eq!(router.next(0).unwrap().index, 0);
        assert_eq!(router.next(0).unwrap().index, 2);
        assert_eq!(router.next(1).unwrap().index, 1);
        assert!(router.next(7).is_none());
    }

    #[test]
    fn completion_is_rejected_for_unknown_and_repeated_indices() {
        let router = TokenRouter::new(2).unwrap();
        router.route(sentences(3), None);
        assert!(!router.mark_completed(3));
        assert!(router.mark_completed(1));
        assert!(!router.mark_completed(1));
        assert_eq!(router.status().completed, 1);
    }

    #[test]
    fn stale_reply_id_cannot_complete_new_reply() {
        let router = TokenRouter::new(2).unwrap();
        router.route(sentences(2), Some("old".into()));
        router.route(sentences(2), Some("new".into()));
        assert!(!router.mark_completed_for("old", 0));
        assert!(router.mark_completed_for("new", 0));
        assert_eq!(router.status().completed, 1);
    }

    #[test]
    fn completed_prefix_stops_at_first_gap() {
        let router = TokenRouter::new(3).unwrap();
        router.route(sentences(4), None);
        router.mark_completed(0);
        router.mark_completed(2);
        let prefix: Vec<_> = router.completed_prefix().into_iter().map(|s| s.text_spoken).collect();
        assert_eq!(prefix, vec!["s0"]);
        router.mark_completed(1);
        assert_eq!(router.completed_prefix().len(), 3);
        assert!(!router.is_all_completed());
    }

    #[test]
    fn reset_drops_everything() {
        let router = TokenRouter::new(2).unwrap();
        router.route(sentences(4), Some("r".into()));
        router.reset();
        let status = router.status();
        assert_eq!(status.total, 0);
        assert!(status.response_id.is_none());
        assert!(status.lanes.iter().all(|l| l.idle));
        assert!(router.next(0).is_none());
        assert!(!router.mark_completed(0));
    }

    #[test]
    fn sequential_passthrough_returns_reply_in_order() {
        let router = TokenRouter::new(3).unwrap();
        router.route(sentences(7), None);
        let out: Vec<_> = router
            .process_all_sequential()
            .into_iter()
            .map(|s| s.text_spoken)
            .collect();
        assert_eq!(out, (0..7).map(|i| format!("s{i}")).collect::<Vec<_>>());
        assert!(router.is_all_completed());
    }

    #[test]
    fn empty_reply_is_never_all_completed() {
        let router = TokenRouter::new(2).unwrap();
        router.route(Vec::new(), None);
        assert!(!router.is_all_completed());
        assert!(router.process_all_sequential().is_empty());
    }

    #[tokio::test]
    async fn wait_until_done_times_out_then_completes() {
        let router = std::sync::Arc::new(TokenRouter::new(2).unwrap());
        router.route(sentences(2), None);
        assert!(!router.wait_until_done(Some(Duration::from_millis(20))).await);

        let waiter = {
            let router = std::sync::Arc::clone(&router);
            tokio::spawn(async move { router.wait_until_done(Some(Duration::from_secs(5))).await })
        };
        router.mark_completed(1);
        router.mark_completed(0);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_next_wakes_when_sentences_arrive() {
        let router = std::sync::Arc::new(TokenRouter::new(2).unwrap());
        let consumer = {
            let router = std::sync::Arc::clone(&router);
            tokio::spawn(async move { router.wait_next(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        router.route(sentences(2), None);
        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.index, 1);
        assert_eq!(got.status, SentenceStatus::Processing);
    }
}
