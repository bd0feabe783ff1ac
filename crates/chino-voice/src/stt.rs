//! Speech-to-text over committed segments.
//!
//! Transcribers are blocking; the pipeline calls them from `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::SpeechSegment;

pub trait Transcriber: Send + Sync {
    /// Transcribe one segment. `None` when nothing intelligible was heard.
    fn transcribe(&self, segment: &SpeechSegment) -> VoiceResult<Option<String>>;
}

/// Encode mono f32 PCM as a 16-bit WAV file.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Fixed output, for tests and for running without an STT service.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderTranscriber {
    response: Option<String>,
}

impl PlaceholderTranscriber {
    /// Hears nothing.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
        }
    }
}

impl Transcriber for PlaceholderTranscriber {
    fn transcribe(&self, segment: &SpeechSegment) -> VoiceResult<Option<String>> {
        debug!(target: "chino::voice", samples = segment.samples.len(), "placeholder transcription");
        Ok(self.response.clone())
    }
}

/// OpenAI-compatible `/audio/transcriptions` client.
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    base_url: String,
    api_key: String,
    model: String,
    lang: String,
    client: reqwest::blocking::Client,
}

impl OpenAiTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        lang: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            lang: lang.into(),
            client,
        })
    }
}

impl Transcriber for OpenAiTranscriber {
    fn transcribe(&self, segment: &SpeechSegment) -> VoiceResult<Option<String>> {
        if segment.samples.is_empty() {
            return Ok(None);
        }
        let wav = pcm_f32_to_wav(&segment.samples, segment.sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.lang.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {status}: {body}")));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(target: "chino::voice", chars = text.len(), secs = segment.duration().as_secs_f32(), "transcribed");
        Ok(if text.is_empty() { None } else { Some(text) })
    }
}

/// The HTTP transcriber when an API key is configured, otherwise a silent placeholder.
pub fn create_transcriber(config: &VoiceConfig) -> VoiceResult<Arc<dyn Transcriber>> {
    match config.stt_api_key.as_deref() {
        Some(key) => {
            info!(target: "chino::voice", url = %config.stt_api_url, model = %config.stt_model, "🗣️ STT: OpenAI-compatible");
            Ok(Arc::new(OpenAiTranscriber::new(
                &config.stt_api_url,
                key,
                &config.stt_model,
                &config.lang,
            )?))
        }
        None => {
            warn!(target: "chino::voice", "no STT API key set; transcripts will be empty");
            Ok(Arc::new(PlaceholderTranscriber::silent()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn segment(samples: Vec<f32>) -> SpeechSegment {
        SpeechSegment {
            samples,
            sample_rate: 16000,
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn wav_header_describes_the_samples() {
        let wav = pcm_f32_to_wav(&[0.0, 1.0, -1.0, 2.0], 16000);
        assert_eq!(wav.len(), 44 + 8);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 36 + 8);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 8);
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), 32767);
        assert_eq!(i16::from_le_bytes([wav[48], wav[49]]), -32767);
        // out-of-range samples are clamped
        assert_eq!(i16::from_le_bytes([wav[50], wav[51]]), 32767);
    }

    #[test]
    fn placeholder_returns_its_response() {
        let seg = segment(vec![0.1; 10]);
        assert_eq!(
            PlaceholderTranscriber::with_response("hola").transcribe(&seg).unwrap().as_deref(),
            Some("hola")
        );
        assert!(PlaceholderTranscriber::silent().transcribe(&seg).unwrap().is_none());
    }

    #[test]
    fn no_key_falls_back_to_placeholder() {
        let transcriber = create_transcriber(&VoiceConfig::default()).unwrap();
        assert!(transcriber.transcribe(&segment(vec![0.2; 4])).unwrap().is_none());
    }
}
