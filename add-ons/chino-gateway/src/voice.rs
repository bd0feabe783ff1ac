//! Voice runtime: lane synthesis workers and, with the `microphone` feature, the
//! live capture pipeline.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chino_core::CoreRegistry;
use chino_voice::{create_synthesizer, LaneWorkers, RealtimePipeline, VoiceConfig, VoiceResult};
use serde_json::json;
use tracing::{info, warn};

/// `CHINO_VOICE_ENABLED=false` turns the voice runtime off in a voice build.
pub fn enabled() -> bool {
    std::env::var("CHINO_VOICE_ENABLED")
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"))
        .unwrap_or(true)
}

pub struct VoiceRuntime {
    config: VoiceConfig,
    workers: LaneWorkers,
    pipeline: Option<Arc<RealtimePipeline>>,
    #[cfg(feature = "microphone")]
    capture_stop: Option<std::sync::mpsc::Sender<()>>,
}

impl VoiceRuntime {
    /// Start lane workers on the registry's router and, when a microphone is
    /// compiled in, the capture pipeline.
    pub async fn start(registry: &Arc<CoreRegistry>, config: VoiceConfig) -> VoiceResult<Self> {
        // blocking HTTP clients are built off the async workers
        let synth_config = config.clone();
        let synthesizer = tokio::task::spawn_blocking(move || create_synthesizer(&synth_config))
            .await
            .map_err(|e| chino_voice::VoiceError::Pipeline(e.to_string()))??;
        let workers = LaneWorkers::start(Arc::clone(registry.router()), synthesizer, config.tts_voice.clone());

        #[cfg(feature = "microphone")]
        let (pipeline, capture_stop) = {
            let (pipeline, stop) = start_microphone(registry, &config).await?;
            (Some(pipeline), Some(stop))
        };
        #[cfg(not(feature = "microphone"))]
        let pipeline = {
            info!(target: "chino::gateway", "built without microphone support; voice input comes from /api/v1/dialog/submit");
            None
        };

        info!(target: "chino::gateway", lanes = workers.stats().lanes, capture = pipeline.is_some(), "🎙️ voice runtime started");
        Ok(Self {
            config,
            workers,
            pipeline,
            #[cfg(feature = "microphone")]
            capture_stop,
        })
    }

    pub async fn stop(&self) {
        #[cfg(feature = "microphone")]
        if let Some(stop) = &self.capture_stop {
            let _ = stop.send(());
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop().await;
        }
        self.workers.stop().await;
    }
}

#[cfg(feature = "microphone")]
async fn start_microphone(
    registry: &Arc<CoreRegistry>,
    config: &VoiceConfig,
) -> VoiceResult<(Arc<RealtimePipeline>, std::sync::mpsc::Sender<()>)> {
    use chino_voice::{capture_bridge, create_transcriber, AudioCapture, VoiceError};

    let stt_config = config.clone();
    let transcriber = tokio::task::spawn_blocking(move || create_transcriber(&stt_config))
        .await
        .map_err(|e| VoiceError::Pipeline(e.to_string()))??;
    let pipeline = RealtimePipeline::new(Arc::clone(registry.bus()), config.clone(), transcriber);
    pipeline.register();

    let (bridge, chunks) = capture_bridge(config.queue_capacity);
    pipeline.start(chunks)?;

    // the cpal stream is not Send; it lives on its own thread until told to stop
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<VoiceResult<()>>();
    let capture_config = config.clone();
    std::thread::Builder::new()
        .name("chino-mic".into())
        .spawn(move || {
            let stream = AudioCapture::new(&capture_config).and_then(|capture| capture.start(bridge));
            match stream {
                Ok(_stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })?;
    ready_rx
        .await
        .map_err(|_| VoiceError::AudioDevice("capture thread exited".into()))??;
    Ok((pipeline, stop_tx))
}

async fn voice_status(State(runtime): State<Arc<VoiceRuntime>>) -> impl IntoResponse {
    Json(json!({
        "lanes": runtime.workers.stats(),
        "pipeline": runtime.pipeline.as_ref().map(|p| p.status()),
        "config": runtime.config,
    }))
}

pub fn routes(runtime: Arc<VoiceRuntime>) -> Router {
    Router::new()
        .route("/api/v1/voice/status", get(voice_status))
        .with_state(runtime)
}

/// Load voice settings, logging instead of failing when they are unusable.
pub fn load_config() -> Option<VoiceConfig> {
    match VoiceConfig::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(target: "chino::gateway", error = %e, "voice config invalid; voice disabled");
            None
        }
    }
}
