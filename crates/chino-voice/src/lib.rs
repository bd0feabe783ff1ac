//! # Chino Voice - acoustic front end and synthesis lanes
//!
//! Turns microphone audio into `speech_ready` events and routed reply sentences
//! into audio files.
//!
//! ```text
//! ┌───────────┐  try_send  ┌──────────────────────────┐  spawn_blocking  ┌─────────────┐
//! │ cpal      │──────────→ │ chino-vad thread         │────────────────→ │ Transcriber │
//! │ callback  │  (drops    │  VAD → SpeechSegmenter   │                  └──────┬──────┘
//! └───────────┘  when full)└──────────────────────────┘                         │ speech_ready
//!                                                                               ↓
//!                        ┌─────────────┐  wait_next   ┌───────────────────────────┐
//!                        │ TokenRouter │────────────→ │ LaneWorkers (one per lane)│→ VoiceSynthesizer
//!                        └─────────────┘ ←────────────└───────────────────────────┘
//!                                        mark_completed
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod segmenter;
pub mod stt;
pub mod synthesis;
pub mod tts;
pub mod vad;

pub use audio::{capture_bridge, AudioChunk, BridgeStats, CaptureBridge};
#[cfg(feature = "microphone")]
pub use audio::AudioCapture;
pub use config::{VadKind, VoiceConfig};
pub use error::{VoiceError, VoiceResult};
pub use pipeline::{PipelineStatus, RealtimePipeline};
pub use segmenter::{SpeechSegment, SpeechSegmenter};
pub use stt::{create_transcriber, OpenAiTranscriber, PlaceholderTranscriber, Transcriber};
pub use synthesis::{LaneStats, LaneWorkers};
pub use tts::{create_synthesizer, OpenAiSynthesizer, SilentSynthesizer, SynthesizedAudio, VoiceParams, VoiceSynthesizer};
pub use vad::{build_detector, EnergyVad, SpeechDetector, WebRtcVad};
