//! Lane workers: one task per router lane, synthesizing sentences as they are
//! routed and reporting each one back to the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chino_core::router::LabeledSentence;
use chino_core::TokenRouter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tts::{SynthesizedAudio, VoiceParams, VoiceSynthesizer};

#[derive(Debug, Default)]
struct Counters {
    synthesized: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LaneStats {
    pub lanes: usize,
    pub synthesized: u64,
    pub failed: u64,
}

pub struct LaneWorkers {
    lanes: usize,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl LaneWorkers {
    /// Spawn one worker per router lane on the current runtime.
    pub fn start(router: Arc<TokenRouter>, synthesizer: Arc<dyn VoiceSynthesizer>, voice: impl Into<String>) -> Self {
        let voice = voice.into();
        let lanes = router.lane_count();
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let handles = (0..lanes)
            .map(|lane| {
                tokio::spawn(lane_loop(
                    lane,
                    Arc::clone(&router),
                    Arc::clone(&synthesizer),
                    voice.clone(),
                    stop_rx.clone(),
                    Arc::clone(&counters),
                ))
            })
            .collect();
        info!(target: "chino::voice", lanes, voice = %voice, "🔀 lane workers started");
        Self {
            lanes,
            stop_tx,
            handles: Mutex::new(handles),
            counters,
        }
    }

    /// Signal every worker and wait for them. A sentence being synthesized is
    /// finished first.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(target: "chino::voice", error = %e, "lane worker ended abnormally");
            }
        }
        info!(target: "chino::voice", "lane workers stopped");
    }

    pub fn stats(&self) -> LaneStats {
        LaneStats {
            lanes: self.lanes,
            synthesized: self.counters.synthesized.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn lane_loop(
    lane: usize,
    router: Arc<TokenRouter>,
    synthesizer: Arc<dyn VoiceSynthesizer>,
    voice: String,
    mut stop: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        let labeled = tokio::select! {
            _ = stop.changed() => break,
            next = router.wait_next(lane) => match next {
                Some(s) => s,
                None => break,
            },
        };
        let LabeledSentence { index, response_id, sentence, .. } = labeled;
        let params = VoiceParams::for_sentence(&sentence, &voice);
        let synth = Arc::clone(&synthesizer);
        let text = sentence.text_spoken;
        let result = tokio::task::spawn_blocking(move || synth.synthesize(&text, &params)).await;

        match result {
            Ok(Ok(SynthesizedAudio { path, bytes })) => {
                counters.synthesized.fetch_add(1, Ordering::Relaxed);
                debug!(target: "chino::voice", lane, index, bytes, path = ?path, "sentence voiced");
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "chino::voice", lane, index, error = %e, "synthesis failed, sentence skipped");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "chino::voice", lane, index, error = %e, "synthesis task failed, sentence skipped");
            }
        }
        // a failed sentence still completes so the reply is never stuck
        router.mark_completed_for(&response_id, index);
    }
    debug!(target: "chino::voice", lane, "lane worker exiting");
}
