//! Dialog turns driven through a fully wired registry with a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chino_core::bus::{handler_fn, EventPayload, Interrupt, SpeechReady, INTERRUPT, MEMORY_FULL, RESPONSE_READY, SPEECH_READY};
use chino_core::config::{CoreConfig, LlmMode};
use chino_core::dialog::{DialogState, AUTO_TRIGGER_INSTRUCTION};
use chino_core::llm::{ReplySentence, ScriptedModel, ScriptedReply};
use chino_core::memory::{InMemorySummaryStore, UserInput};
use chino_core::{CoreRegistry, Priority, TurnOutcome};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn registry_with(model: Arc<ScriptedModel>, config: CoreConfig) -> Arc<CoreRegistry> {
    CoreRegistry::builder(config)
        .with_model(LlmMode::Mock, model)
        .with_summary_store(Arc::new(InMemorySummaryStore::new()))
        .build()
        .expect("build registry")
}

fn reply(texts: &[&str]) -> ScriptedReply {
    ScriptedReply::Sentences(texts.iter().map(|t| ReplySentence::plain(*t)).collect())
}

#[tokio::test]
async fn turns_never_overlap() {
    init_tracing();
    let model = Arc::new(ScriptedModel::echo().with_delay(Duration::from_millis(40)));
    let registry = registry_with(model.clone(), CoreConfig::default());

    let mut handles = Vec::new();
    for i in 0..4 {
        let dialog = Arc::clone(registry.dialog());
        handles.push(tokio::spawn(async move {
            dialog.respond_to(UserInput::text(format!("message {i}"))).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.expect("join").expect("turn");
        assert!(matches!(outcome, TurnOutcome::Published(_)));
    }

    assert_eq!(model.calls(), 4);
    assert_eq!(model.max_in_flight(), 1);
    assert_eq!(registry.dialog().status().turns_completed, 4);
    assert_eq!(registry.dialog().state(), DialogState::Idle);
}

#[tokio::test]
async fn queued_message_follows_the_reply_it_waited_for() {
    init_tracing();
    let model = Arc::new(ScriptedModel::echo().with_delay(Duration::from_millis(50)));
    let registry = registry_with(model.clone(), CoreConfig::default());

    let first = {
        let dialog = Arc::clone(registry.dialog());
        tokio::spawn(async move { dialog.respond_to(UserInput::text("first question")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry
        .dialog()
        .respond_to(UserInput::text("second question"))
        .await
        .expect("second turn");
    first.await.expect("join").expect("first turn");

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    let second: Vec<&str> = prompts[1][1..].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        second,
        vec![
            "[User emotion: normal] first question",
            "You said: first question",
            "second question",
        ]
    );

    let stored: Vec<String> = registry
        .memory()
        .recent_turns(None)
        .await
        .expect("turns")
        .iter()
        .map(|t| t.content().to_string())
        .collect();
    assert_eq!(
        stored,
        vec![
            "first question",
            "You said: first question",
            "second question",
            "You said: second question",
        ]
    );
}

#[tokio::test]
async fn interrupt_suppresses_in_flight_reply() {
    init_tracing();
    let model = Arc::new(ScriptedModel::new([reply(&["too late"])]).with_delay(Duration::from_millis(200)));
    let registry = registry_with(model.clone(), CoreConfig::default());

    let published = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&published);
    registry.bus().subscribe(
        RESPONSE_READY,
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        Priority::Low,
        "test",
    );

    let dialog = Arc::clone(registry.dialog());
    let turn = tokio::spawn(async move { dialog.respond_to(UserInput::text("tell me a story")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.dialog().state(), DialogState::Processing);
    registry
        .bus()
        .publish(INTERRUPT, EventPayload::Interrupt(Interrupt::default()))
        .await;

    let outcome = turn.await.expect("join").expect("turn");
    assert!(matches!(outcome, TurnOutcome::Suppressed { .. }));
    assert_eq!(published.load(Ordering::SeqCst), 0);
    assert_eq!(registry.dialog().status().turns_suppressed, 1);

    // the next turn is unaffected
    let outcome = registry
        .dialog()
        .respond_to(UserInput::text("hello again"))
        .await
        .expect("turn");
    assert!(matches!(outcome, TurnOutcome::Published(_)));
    assert_eq!(published.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_failure_releases_the_turn() {
    init_tracing();
    let model = Arc::new(ScriptedModel::new([ScriptedReply::Fail("upstream 503".into())]));
    let registry = registry_with(model, CoreConfig::default());

    let first = registry.dialog().respond_to(UserInput::text("hi")).await;
    assert!(first.is_err());
    assert_eq!(registry.dialog().state(), DialogState::Idle);

    let second = registry
        .dialog()
        .respond_to(UserInput::text("hi again"))
        .await
        .expect("second turn");
    match second {
        TurnOutcome::Published(r) => assert_eq!(r.sentences[0].text_spoken, "You said: hi again"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let status = registry.dialog().status();
    assert_eq!(status.turns_failed, 1);
    assert!(status.last_error.unwrap_or_default().contains("upstream 503"));
}

#[tokio::test]
async fn speech_ready_runs_a_full_turn() {
    init_tracing();
    let model = Arc::new(ScriptedModel::new([reply(&["Hi there.", "How are you?"])]));
    let registry = registry_with(model, CoreConfig::default());

    registry
        .bus()
        .publish(SPEECH_READY, EventPayload::SpeechReady(SpeechReady::new("hello")))
        .await;

    let turns = registry.memory().recent_turns(None).await.expect("turns");
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[0].content(), "hello");
    assert_eq!(turns[2].content(), "How are you?");

    let router = registry.router();
    assert!(router.is_all_completed());
    let ordered: Vec<String> = router
        .build_ordered_response()
        .into_iter()
        .map(|s| s.text_spoken)
        .collect();
    assert_eq!(ordered, vec!["Hi there.", "How are you?"]);
}

#[tokio::test]
async fn compression_feeds_summaries_into_later_prompts() {
    init_tracing();
    let mut config = CoreConfig::default();
    config.memory.capacity = 8;
    config.memory.compress_threshold = 4;

    let model = Arc::new(ScriptedModel::new([
        reply(&["one"]),
        reply(&["two"]),
        ScriptedReply::Text("The user is practising greetings.".into()),
    ]));
    let registry = registry_with(model.clone(), config);

    let compressed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&compressed);
    registry.bus().subscribe(
        MEMORY_FULL,
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        Priority::Normal,
        "test",
    );

    for text in ["first", "second"] {
        registry
            .dialog()
            .respond_to(UserInput::text(text))
            .await
            .expect("turn");
    }

    let mut waited = 0;
    while compressed.load(Ordering::SeqCst) == 0 && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert_eq!(compressed.load(Ordering::SeqCst), 1);
    assert!(registry.memory().recent_turns(None).await.expect("turns").is_empty());

    let stats = registry.memory().stats().await.expect("stats");
    assert_eq!(stats.long_term_summaries, 1);
    assert_eq!(stats.compressions, 1);

    registry
        .dialog()
        .respond_to(UserInput::text("third"))
        .await
        .expect("turn");
    let prompts = model.prompts();
    let last = prompts.last().expect("prompt");
    assert_eq!(
        last[1].content,
        "Recent conversation summaries:\n- The user is practising greetings."
    );
}

#[tokio::test]
async fn watchdog_auto_triggers_when_idle() {
    init_tracing();
    let mut config = CoreConfig::default();
    config.dialog.idle_timeout_secs = 0;
    config.dialog.watchdog_interval_ms = 30;

    let model = Arc::new(ScriptedModel::echo());
    let registry = registry_with(model.clone(), config);

    let auto = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&auto);
    registry.bus().subscribe(
        RESPONSE_READY,
        handler_fn(move |event| {
            let counter = Arc::clone(&counter);
            async move {
                if event.response_ready().is_some_and(|r| r.auto_triggered) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }),
        Priority::Low,
        "test",
    );

    registry.dialog().start_watchdog();
    assert!(registry.dialog().watchdog_active());
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.dialog().stop_watchdog();
    assert!(!registry.dialog().watchdog_active());

    assert!(auto.load(Ordering::SeqCst) >= 1);
    let prompts = model.prompts();
    assert_eq!(
        prompts[0].last().expect("message").content,
        AUTO_TRIGGER_INSTRUCTION
    );
}

#[tokio::test]
async fn auto_trigger_yields_to_a_user_turn_holding_the_lock() {
    init_tracing();
    let model = Arc::new(ScriptedModel::echo().with_delay(Duration::from_millis(100)));
    let registry = registry_with(model.clone(), CoreConfig::default());
    let idle_timeout = Duration::from_millis(50);

    let user = {
        let dialog = Arc::clone(registry.dialog());
        tokio::spawn(async move { dialog.respond_to(UserInput::text("hello")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let skipped = registry
        .dialog()
        .auto_trigger_if_idle(idle_timeout)
        .await
        .expect("auto-trigger");
    assert!(skipped.is_none());
    user.await.expect("join").expect("user turn");
    assert_eq!(model.calls(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let fired = registry
        .dialog()
        .auto_trigger_if_idle(idle_timeout)
        .await
        .expect("auto-trigger");
    assert!(matches!(fired, Some(TurnOutcome::Published(ref r)) if r.auto_triggered));
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn watchdog_stays_off_when_disabled() {
    let mut config = CoreConfig::default();
    config.dialog.auto_trigger_enabled = false;
    let registry = registry_with(Arc::new(ScriptedModel::echo()), config);
    registry.dialog().start_watchdog();
    assert!(!registry.dialog().watchdog_active());
}

#[tokio::test]
async fn shutdown_clears_subscriptions() {
    let registry = registry_with(Arc::new(ScriptedModel::echo()), CoreConfig::default());
    assert!(registry.bus().subscriber_count(None) > 0);
    registry.shutdown().await;
    assert_eq!(registry.bus().subscriber_count(None), 0);
}
