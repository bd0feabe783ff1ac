//! Microphone capture and the hand-off from the device callback thread.
//!
//! The device callback runs on a foreign thread that must never block, so chunks
//! go through [`CaptureBridge::offer`]: a bounded, non-blocking enqueue that drops
//! the chunk when the queue is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Log every Nth dropped chunk.
const DROP_LOG_EVERY: u64 = 50;

#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct BridgeCounters {
    offered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BridgeStats {
    pub offered: u64,
    pub dropped: u64,
}

/// Producer side of the capture queue. Cheap to clone; safe to call from any thread.
#[derive(Debug, Clone)]
pub struct CaptureBridge {
    tx: mpsc::Sender<AudioChunk>,
    counters: Arc<BridgeCounters>,
}

/// Create a capture queue holding at most `capacity` chunks.
pub fn capture_bridge(capacity: usize) -> (CaptureBridge, mpsc::Receiver<AudioChunk>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        CaptureBridge {
            tx,
            counters: Arc::new(BridgeCounters::default()),
        },
        rx,
    )
}

impl CaptureBridge {
    /// Enqueue without waiting. Returns `false` if the chunk was dropped because the
    /// queue is full or the consumer is gone.
    pub fn offer(&self, chunk: AudioChunk) -> bool {
        self.counters.offered.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(e) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "consumer gone",
                    };
                    debug!(target: "chino::voice", dropped, reason, "capture chunk dropped");
                }
                false
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            offered: self.counters.offered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "microphone")]
pub use microphone::AudioCapture;

#[cfg(feature = "microphone")]
mod microphone {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig};
    use tracing::{info, warn};

    use super::{AudioChunk, CaptureBridge};
    use crate::config::VoiceConfig;
    use crate::error::{VoiceError, VoiceResult};

    /// Default input device, mono, fixed-size chunks.
    pub struct AudioCapture {
        device: Device,
        stream_config: StreamConfig,
        chunk_size: usize,
    }

    impl AudioCapture {
        pub fn new(config: &VoiceConfig) -> VoiceResult<Self> {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
            info!(
                target: "chino::voice",
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                sample_rate = config.sample_rate,
                "🎤 input device selected"
            );
            let default_config = device.default_input_config()?;
            tracing::debug!(target: "chino::voice", ?default_config, "device default config");

            Ok(Self {
                device,
                stream_config: StreamConfig {
                    channels: 1,
                    sample_rate: cpal::SampleRate(config.sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                },
                chunk_size: config.chunk_size,
            })
        }

        /// Start the stream. Keep the returned `Stream` alive for as long as capture
        /// should run.
        pub fn start(self, bridge: CaptureBridge) -> VoiceResult<Stream> {
            let chunk_size = self.chunk_size;
            let mut pending: Vec<f32> = Vec::with_capacity(chunk_size);
            let stream = self.device.build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        pending.push(sample);
                        if pending.len() >= chunk_size {
                            let full = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                            bridge.offer(AudioChunk::new(full));
                        }
                    }
                },
                move |err| {
                    warn!(target: "chino::voice", error = %err, "audio stream error");
                },
                None,
            )?;
            stream.play()?;
            info!(target: "chino::voice", "✅ audio capture started");
            Ok(stream)
        }

        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let devices = cpal::default_host().input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }
}
