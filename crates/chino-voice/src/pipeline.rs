//! Realtime acoustic pipeline: capture queue → detection thread → transcription →
//! `speech_ready` on the bus.
//!
//! Detection runs on a dedicated thread with its own current-thread runtime so
//! the capture queue is drained at audio rate regardless of what the async side is
//! doing. Committed segments are tagged with the interrupt generation they were
//! cut in; an `interrupt` bumps the generation, which drops queued audio, resets the
//! segmenter and detector, and discards any transcription still in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chino_core::bus::{handler_fn, EventBus, EventPayload, Priority, SpeechReady, INTERRUPT, SPEECH_READY};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::AudioChunk;
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::{SpeechSegment, SpeechSegmenter};
use crate::stt::Transcriber;
use crate::vad::build_detector;

const OWNER: &str = "voice_pipeline";
/// How long the detection thread waits for a chunk before re-checking its flags.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct Counters {
    chunks: AtomicU64,
    segments: AtomicU64,
    transcripts: AtomicU64,
    empty_transcripts: AtomicU64,
    stale_dropped: AtomicU64,
    failures: AtomicU64,
    interrupts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub generation: u64,
    pub chunks: u64,
    pub segments: u64,
    pub transcripts: u64,
    pub empty_transcripts: u64,
    pub stale_dropped: u64,
    pub failures: u64,
    pub interrupts: u64,
}

/// Flags shared between the pipeline handle, the detection thread and the
/// transcription task.
#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    flush: AtomicBool,
    generation: AtomicU64,
    counters: Counters,
}

pub struct RealtimePipeline {
    bus: Arc<EventBus>,
    config: VoiceConfig,
    transcriber: Arc<dyn Transcriber>,
    shared: Arc<Shared>,
    detector_thread: Mutex<Option<thread::JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimePipeline {
    pub fn new(bus: Arc<EventBus>, config: VoiceConfig, transcriber: Arc<dyn Transcriber>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            transcriber,
            shared: Arc::new(Shared::default()),
            detector_thread: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    /// Subscribe the interrupt handler at high priority, ahead of the dialog
    /// orchestrator and the router.
    pub fn register(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus.subscribe(
            INTERRUPT,
            handler_fn(move |event| {
                let this = Arc::clone(&this);
                async move {
                    let reason = event.interrupt().map(|i| i.reason.clone()).unwrap_or_default();
                    this.interrupt(&reason);
                    Ok(())
                }
            }),
            Priority::High,
            OWNER,
        );
        debug!(target: "chino::voice", "pipeline subscribed to interrupts");
    }

    /// Drop queued audio and any segment or transcription not yet published.
    pub fn interrupt(&self, reason: &str) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.flush.store(true, Ordering::Release);
        self.shared.counters.interrupts.fetch_add(1, Ordering::Relaxed);
        info!(target: "chino::voice", reason, generation, "⛔ pipeline flushed");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start consuming `chunks`. Must be called from within a tokio runtime; the
    /// transcription side runs on it.
    pub fn start(self: &Arc<Self>, chunks: mpsc::Receiver<AudioChunk>) -> VoiceResult<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(VoiceError::Pipeline("pipeline already running".into()));
        }
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("chino-vad".into())
            .spawn(move || detection_loop(shared, config, chunks, segment_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        *self.detector_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let consumer = tokio::spawn(transcription_loop(
            Arc::clone(&self.bus),
            Arc::clone(&self.transcriber),
            Arc::clone(&self.shared),
            self.config.lang.clone(),
            segment_rx,
        ));
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);

        info!(target: "chino::voice", sample_rate = self.config.sample_rate, vad = ?self.config.vad, "🎧 realtime pipeline started");
        Ok(())
    }

    /// Stop the detection thread and wait for pending transcriptions to settle.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let thread = self.detector_thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!(target: "chino::voice", "detection thread panicked"),
                Err(e) => warn!(target: "chino::voice", error = %e, "join on detection thread failed"),
            }
        }
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                warn!(target: "chino::voice", error = %e, "transcription task ended abnormally");
            }
        }
        self.bus.unsubscribe_all(OWNER);
        info!(target: "chino::voice", "realtime pipeline stopped");
    }

    pub fn status(&self) -> PipelineStatus {
        let c = &self.shared.counters;
        PipelineStatus {
            running: self.is_running(),
            generation: self.shared.generation.load(Ordering::Acquire),
            chunks: c.chunks.load(Ordering::Relaxed),
            segments: c.segments.load(Ordering::Relaxed),
            transcripts: c.transcripts.load(Ordering::Relaxed),
            empty_transcripts: c.empty_transcripts.load(Ordering::Relaxed),
            stale_dropped: c.stale_dropped.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            interrupts: c.interrupts.load(Ordering::Relaxed),
        }
    }
}

fn detection_loop(
    shared: Arc<Shared>,
    config: VoiceConfig,
    mut chunks: mpsc::Receiver<AudioChunk>,
    segments: mpsc::UnboundedSender<(u64, SpeechSegment)>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: "chino::voice", error = %e, "detection runtime failed to start");
            shared.running.store(false, Ordering::Release);
            return;
        }
    };
    // WebRTC VAD state is not Send, so the detector is created here.
    let mut detector = match build_detector(&config) {
        Ok(d) => d,
        Err(e) => {
            error!(target: "chino::voice", error = %e, "speech detector failed to start");
            shared.running.store(false, Ordering::Release);
            return;
        }
    };
    let mut segmenter = SpeechSegmenter::new(&config);

    while shared.running.load(Ordering::Acquire) {
        if shared.flush.swap(false, Ordering::AcqRel) {
            let mut drained = 0usize;
            while chunks.try_recv().is_ok() {
                drained += 1;
            }
            segmenter.reset();
            if let Err(e) = detector.reset() {
                warn!(target: "chino::voice", error = %e, "detector reset failed");
            }
            debug!(target: "chino::voice", drained, "capture queue drained");
        }

        let chunk = match rt.block_on(tokio::time::timeout(POLL_INTERVAL, chunks.recv())) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                info!(target: "chino::voice", "capture source closed");
                break;
            }
            Err(_) => continue,
        };
        shared.counters.chunks.fetch_add(1, Ordering::Relaxed);
        if shared.flush.load(Ordering::Acquire) {
            continue;
        }

        let speech = detector.is_speech(&chunk.samples).unwrap_or_else(|e| {
            warn!(target: "chino::voice", error = %e, "detection failed, chunk treated as silence");
            false
        });
        if let Some(segment) = segmenter.push(&chunk.samples, speech) {
            shared.counters.segments.fetch_add(1, Ordering::Relaxed);
            let generation = shared.generation.load(Ordering::Acquire);
            debug!(target: "chino::voice", generation, secs = segment.duration().as_secs_f32(), "segment committed");
            if segments.send((generation, segment)).is_err() {
                break;
            }
        }
    }
    shared.running.store(false, Ordering::Release);
    debug!(target: "chino::voice", "detection thread exiting");
}

async fn transcription_loop(
    bus: Arc<EventBus>,
    transcriber: Arc<dyn Transcriber>,
    shared: Arc<Shared>,
    lang: String,
    mut segments: mpsc::UnboundedReceiver<(u64, SpeechSegment)>,
) {
    let counters = &shared.counters;
    let is_stale = |generation: u64| generation != shared.generation.load(Ordering::Acquire);

    while let Some((generation, segment)) = segments.recv().await {
        if is_stale(generation) {
            counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let stt = Arc::clone(&transcriber);
        let text = match tokio::task::spawn_blocking(move || stt.transcribe(&segment)).await {
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => {
                counters.empty_transcripts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Ok(Err(e)) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(target: "chino::voice", error = %e, "transcription failed");
                continue;
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(target: "chino::voice", error = %e, "transcription task failed");
                continue;
            }
        };
        if is_stale(generation) {
            counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(target: "chino::voice", "transcript dropped after interrupt");
            continue;
        }

        counters.transcripts.fetch_add(1, Ordering::Relaxed);
        info!(target: "chino::voice", chars = text.len(), "📝 transcript ready");
        let payload = EventPayload::SpeechReady(SpeechReady::new(text).with_lang(lang.as_str()).with_source("mic"));
        // the dialog turn runs inside the publish; keep transcribing meanwhile
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            bus.publish(SPEECH_READY, payload).await;
        });
    }
}
