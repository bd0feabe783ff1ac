//! Synthetic audio pushed through the capture bridge, detection thread and
//! transcription into a wired core registry. No audio hardware needed.

use std::sync::Arc;
use std::time::Duration;

use chino_core::bus::{handler_fn, EventBus, EventPayload, Interrupt, INTERRUPT, SPEECH_READY};
use chino_core::config::{CoreConfig, LlmMode};
use chino_core::llm::{ReplySentence, ScriptedModel, ScriptedReply};
use chino_core::memory::InMemorySummaryStore;
use chino_core::{CoreRegistry, Priority};
use chino_voice::{
    capture_bridge, AudioChunk, CaptureBridge, LaneWorkers, PlaceholderTranscriber, RealtimePipeline,
    SilentSynthesizer, SpeechSegment, Transcriber, VadKind, VoiceConfig, VoiceResult,
};
use tokio::sync::mpsc;

const CHUNK: usize = 480;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn voice_config() -> VoiceConfig {
    VoiceConfig {
        vad: VadKind::Energy,
        energy_threshold: 0.1,
        silence_chunks: 3,
        min_speech_ms: 60,
        ..VoiceConfig::default()
    }
}

/// Five voiced chunks followed by enough silence to close the segment.
fn speak(bridge: &CaptureBridge) {
    for _ in 0..5 {
        assert!(bridge.offer(AudioChunk::new(vec![0.5; CHUNK])));
    }
    for _ in 0..3 {
        assert!(bridge.offer(AudioChunk::new(vec![0.0; CHUNK])));
    }
}

fn transcripts(bus: &EventBus) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        SPEECH_READY,
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                if let Some(speech) = event.speech_ready() {
                    let _ = tx.send(format!("{}|{}", speech.source, speech.text));
                }
                Ok(())
            }
        }),
        Priority::Low,
        "test",
    );
    rx
}

struct SlowTranscriber(Duration);

impl Transcriber for SlowTranscriber {
    fn transcribe(&self, _segment: &SpeechSegment) -> VoiceResult<Option<String>> {
        std::thread::sleep(self.0);
        Ok(Some("stale words".to_string()))
    }
}

#[tokio::test]
async fn spoken_segment_becomes_speech_ready() {
    init_tracing();
    let bus = Arc::new(EventBus::new());
    let mut heard = transcripts(&bus);
    let pipeline = RealtimePipeline::new(
        Arc::clone(&bus),
        voice_config(),
        Arc::new(PlaceholderTranscriber::with_response("hola")),
    );
    pipeline.register();

    let (bridge, rx) = capture_bridge(64);
    pipeline.start(rx).unwrap();
    speak(&bridge);

    let text = tokio::time::timeout(Duration::from_secs(5), heard.recv())
        .await
        .expect("transcript in time")
        .expect("channel open");
    assert_eq!(text, "mic|hola");

    pipeline.stop().await;
    let status = pipeline.status();
    assert_eq!(status.segments, 1);
    assert_eq!(status.transcripts, 1);
    assert_eq!(status.chunks, 8);
}

#[tokio::test]
async fn interrupt_discards_transcription_in_flight() {
    init_tracing();
    let bus = Arc::new(EventBus::new());
    let mut heard = transcripts(&bus);
    let pipeline = RealtimePipeline::new(
        Arc::clone(&bus),
        voice_config(),
        Arc::new(SlowTranscriber(Duration::from_millis(300))),
    );
    pipeline.register();

    let (bridge, rx) = capture_bridge(64);
    pipeline.start(rx).unwrap();
    speak(&bridge);

    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.status().segments == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("segment committed");
    bus.publish(INTERRUPT, EventPayload::Interrupt(Interrupt::default())).await;

    assert!(tokio::time::timeout(Duration::from_millis(700), heard.recv()).await.is_err());
    let status = pipeline.status();
    assert_eq!(status.stale_dropped, 1);
    assert_eq!(status.transcripts, 0);
    assert_eq!(status.interrupts, 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn voice_turn_is_answered_and_voiced_in_order() {
    init_tracing();
    let mut config = CoreConfig::default();
    config.router.passthrough = false;
    config.router.lanes = 3;
    let registry = CoreRegistry::builder(config)
        .with_model(
            LlmMode::Mock,
            Arc::new(ScriptedModel::new([ScriptedReply::Sentences(
                ["It is", "almost", "noon."].into_iter().map(ReplySentence::plain).collect(),
            )])),
        )
        .with_summary_store(Arc::new(InMemorySummaryStore::new()))
        .build()
        .unwrap();
    let workers = LaneWorkers::start(Arc::clone(registry.router()), Arc::new(SilentSynthesizer), "nova");

    let pipeline = RealtimePipeline::new(
        Arc::clone(registry.bus()),
        voice_config(),
        Arc::new(PlaceholderTranscriber::with_response("what time is it")),
    );
    pipeline.register();
    let (bridge, rx) = capture_bridge(64);
    pipeline.start(rx).unwrap();
    speak(&bridge);

    let router = Arc::clone(registry.router());
    tokio::time::timeout(Duration::from_secs(5), async {
        while !router.is_all_completed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reply voiced");

    let reply: Vec<_> = router.build_ordered_response().into_iter().map(|s| s.text_spoken).collect();
    assert_eq!(reply, vec!["It is", "almost", "noon."]);
    assert_eq!(workers.stats().synthesized, 3);
    let history = registry.memory().recent_turns(None).await.unwrap();
    assert!(!history.is_empty());

    pipeline.stop().await;
    workers.stop().await;
    registry.shutdown().await;
}
