//! Text-to-speech for routed reply sentences.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chino_core::ReplySentence;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};

/// Delivery settings for one sentence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
    pub emotion: String,
    pub intensity: f32,
}

impl VoiceParams {
    /// Map the sentence's emotion tag to a speaking rate.
    pub fn for_sentence(sentence: &ReplySentence, voice: &str) -> Self {
        let speed = match sentence.emotion.to_ascii_lowercase().as_str() {
            "happy" | "excited" => 1.1,
            "sad" => 0.9,
            _ => 1.0,
        };
        Self {
            voice: voice.to_string(),
            speed,
            emotion: sentence.emotion.clone(),
            intensity: sentence.intensity.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesizedAudio {
    /// Written audio file. `None` when nothing was produced.
    pub path: Option<PathBuf>,
    pub bytes: usize,
}

impl SynthesizedAudio {
    pub fn empty() -> Self {
        Self { path: None, bytes: 0 }
    }
}

/// Blocking synthesizer; lane workers call it from `spawn_blocking`.
pub trait VoiceSynthesizer: Send + Sync {
    fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<SynthesizedAudio>;
}

/// Produces nothing. Used when no TTS service is configured.
#[derive(Debug, Default, Clone)]
pub struct SilentSynthesizer;

impl VoiceSynthesizer for SilentSynthesizer {
    fn synthesize(&self, text: &str, _params: &VoiceParams) -> VoiceResult<SynthesizedAudio> {
        debug!(target: "chino::voice", chars = text.len(), "silent synthesis");
        Ok(SynthesizedAudio::empty())
    }
}

/// OpenAI-compatible `/audio/speech` client. Each sentence is written to
/// `output_dir/<uuid>.mp3`.
#[derive(Debug, Clone)]
pub struct OpenAiSynthesizer {
    base_url: String,
    api_key: String,
    model: String,
    output_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl OpenAiSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> VoiceResult<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            output_dir,
            client,
        })
    }
}

impl VoiceSynthesizer for OpenAiSynthesizer {
    fn synthesize(&self, text: &str, params: &VoiceParams) -> VoiceResult<SynthesizedAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SynthesizedAudio::empty());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": params.voice,
            "speed": params.speed,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {status}: {body}")));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        let path = self
            .output_dir
            .join(format!("{}.mp3", uuid::Uuid::new_v4()));
        std::fs::write(&path, &bytes)?;
        debug!(target: "chino::voice", path = %path.display(), bytes = bytes.len(), "sentence synthesized");
        Ok(SynthesizedAudio {
            path: Some(path),
            bytes: bytes.len(),
        })
    }
}

pub fn create_synthesizer(config: &VoiceConfig) -> VoiceResult<Arc<dyn VoiceSynthesizer>> {
    match config.tts_api_key.as_deref() {
        Some(key) => {
            info!(target: "chino::voice", url = %config.tts_api_url, model = %config.tts_model, voice = %config.tts_voice, "🔊 TTS: OpenAI-compatible");
            Ok(Arc::new(OpenAiSynthesizer::new(
                &config.tts_api_url,
                key,
                &config.tts_model,
                &config.output_dir,
            )?))
        }
        None => {
            warn!(target: "chino::voice", "no TTS API key set; replies will not be voiced");
            Ok(Arc::new(SilentSynthesizer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(emotion: &str, intensity: f32) -> ReplySentence {
        ReplySentence {
            emotion: emotion.to_string(),
            intensity,
            ..ReplySentence::plain("hi")
        }
    }

    #[test]
    fn emotion_sets_speed() {
        assert_eq!(VoiceParams::for_sentence(&sentence("happy", 0.5), "nova").speed, 1.1);
        assert_eq!(VoiceParams::for_sentence(&sentence("Excited", 0.5), "nova").speed, 1.1);
        assert_eq!(VoiceParams::for_sentence(&sentence("sad", 0.5), "nova").speed, 0.9);
        let params = VoiceParams::for_sentence(&sentence("normal", 3.0), "alloy");
        assert_eq!(params.speed, 1.0);
        assert_eq!(params.voice, "alloy");
        assert_eq!(params.intensity, 1.0);
    }

    #[test]
    fn silent_synthesizer_writes_nothing() {
        let params = VoiceParams::for_sentence(&sentence("normal", 0.5), "nova");
        assert_eq!(SilentSynthesizer.synthesize("hello", &params).unwrap(), SynthesizedAudio::empty());
    }

    #[test]
    fn blank_text_skips_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let synth = OpenAiSynthesizer::new("http://127.0.0.1:9", "key", "tts-1", dir.path().join("out")).unwrap();
        let params = VoiceParams::for_sentence(&sentence("normal", 0.5), "nova");
        assert_eq!(synth.synthesize("   ", &params).unwrap(), SynthesizedAudio::empty());
        assert!(dir.path().join("out").is_dir());
    }
}
