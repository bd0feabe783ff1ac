//! Voice front-end settings, read from `CHINO_VOICE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{VoiceError, VoiceResult};

/// Which speech detector the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VadKind {
    #[default]
    WebRtc,
    Energy,
}

impl FromStr for VadKind {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Ok(VadKind::WebRtc),
            "energy" => Ok(VadKind::Energy),
            other => Err(VoiceError::Config(format!("unknown VAD kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    /// Hz. WebRTC VAD accepts 8000, 16000, 32000 or 48000.
    pub sample_rate: u32,
    /// Samples per capture chunk (480 = 30ms at 16kHz).
    pub chunk_size: usize,
    /// Chunks the capture bridge holds before it starts dropping.
    pub queue_capacity: usize,
    /// Consecutive silent chunks that end a speech segment.
    pub silence_chunks: usize,
    pub min_speech_ms: u64,
    pub max_segment_secs: u64,
    pub vad: VadKind,
    /// WebRTC aggressiveness, 0-3.
    pub vad_mode: u8,
    /// RMS level treated as speech by the energy detector.
    pub energy_threshold: f32,
    /// Language tag attached to published transcripts.
    pub lang: String,
    pub stt_api_url: String,
    #[serde(skip_serializing)]
    pub stt_api_key: Option<String>,
    pub stt_model: String,
    pub tts_api_url: String,
    #[serde(skip_serializing)]
    pub tts_api_key: Option<String>,
    pub tts_model: String,
    pub tts_voice: String,
    /// Where synthesized audio files are written.
    pub output_dir: PathBuf,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_size: 480,
            queue_capacity: 300,
            silence_chunks: 5,
            min_speech_ms: 200,
            max_segment_secs: 30,
            vad: VadKind::WebRtc,
            vad_mode: 2,
            energy_threshold: 0.02,
            lang: "en".to_string(),
            stt_api_url: "https://api.openai.com/v1".to_string(),
            stt_api_key: None,
            stt_model: "whisper-1".to_string(),
            tts_api_url: "https://api.openai.com/v1".to_string(),
            tts_api_key: None,
            tts_model: "tts-1".to_string(),
            tts_voice: "nova".to_string(),
            output_dir: PathBuf::from("./data/tts"),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: String) -> VoiceResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| VoiceError::Config(format!("{key}: cannot parse {raw:?}")))
}

impl VoiceConfig {
    /// Defaults overlaid with `CHINO_VOICE_*` variables. API keys fall back to
    /// `OPENAI_API_KEY`.
    pub fn from_env() -> VoiceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> VoiceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("CHINO_VOICE_{name}")).filter(|v| !v.trim().is_empty())
        };
        let mut cfg = Self::default();

        if let Some(v) = var("SAMPLE_RATE") {
            cfg.sample_rate = parse("CHINO_VOICE_SAMPLE_RATE", v)?;
        }
        if let Some(v) = var("CHUNK_SIZE") {
            cfg.chunk_size = parse("CHINO_VOICE_CHUNK_SIZE", v)?;
        }
        if let Some(v) = var("QUEUE_CAPACITY") {
            cfg.queue_capacity = parse("CHINO_VOICE_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = var("SILENCE_CHUNKS") {
            cfg.silence_chunks = parse("CHINO_VOICE_SILENCE_CHUNKS", v)?;
        }
        if let Some(v) = var("MIN_SPEECH_MS") {
            cfg.min_speech_ms = parse("CHINO_VOICE_MIN_SPEECH_MS", v)?;
        }
        if let Some(v) = var("MAX_SEGMENT_SECS") {
            cfg.max_segment_secs = parse("CHINO_VOICE_MAX_SEGMENT_SECS", v)?;
        }
        if let Some(v) = var("VAD") {
            cfg.vad = v.parse()?;
        }
        if let Some(v) = var("VAD_MODE") {
            cfg.vad_mode = parse("CHINO_VOICE_VAD_MODE", v)?;
        }
        if let Some(v) = var("ENERGY_THRESHOLD") {
            cfg.energy_threshold = parse("CHINO_VOICE_ENERGY_THRESHOLD", v)?;
        }
        if let Some(v) = var("LANG") {
            cfg.lang = v;
        }
        if let Some(v) = var("STT_API_URL") {
            cfg.stt_api_url = v;
        }
        if let Some(v) = var("STT_MODEL") {
            cfg.stt_model = v;
        }
        if let Some(v) = var("TTS_API_URL") {
            cfg.tts_api_url = v;
        }
        if let Some(v) = var("TTS_MODEL") {
            cfg.tts_model = v;
        }
        if let Some(v) = var("TTS_VOICE") {
            cfg.tts_voice = v;
        }
        if let Some(v) = var("OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }

        let shared_key = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty());
        cfg.stt_api_key = var("STT_API_KEY").or_else(|| shared_key.clone());
        cfg.tts_api_key = var("TTS_API_KEY").or(shared_key);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.chunk_size == 0 {
            return Err(VoiceError::Config("chunk_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(VoiceError::Config("queue_capacity must be at least 1".into()));
        }
        if self.silence_chunks == 0 {
            return Err(VoiceError::Config("silence_chunks must be at least 1".into()));
        }
        if self.vad == VadKind::WebRtc {
            if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    self.sample_rate
                )));
            }
            if self.vad_mode > 3 {
                return Err(VoiceError::Config(format!(
                    "VAD mode must be 0-3, got {}",
                    self.vad_mode
                )));
            }
        }
        Ok(())
    }

    pub fn samples_for(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_millis() / 1000) as usize
    }

    pub fn min_speech_samples(&self) -> usize {
        self.samples_for(Duration::from_millis(self.min_speech_ms))
    }

    pub fn max_segment_samples(&self) -> usize {
        self.samples_for(Duration::from_secs(self.max_segment_secs))
    }
}
