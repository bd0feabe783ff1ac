//! Speech detection on capture chunks.

use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::config::{VadKind, VoiceConfig};
use crate::error::{VoiceError, VoiceResult};

/// Decides whether one chunk contains speech. Detectors keep per-stream state and
/// live on the detection thread, so they need not be `Send`.
pub trait SpeechDetector {
    fn is_speech(&mut self, chunk: &[f32]) -> VoiceResult<bool>;

    /// Forget any state carried across chunks.
    fn reset(&mut self) -> VoiceResult<()>;
}

/// Build the configured detector.
pub fn build_detector(config: &VoiceConfig) -> VoiceResult<Box<dyn SpeechDetector>> {
    Ok(match config.vad {
        VadKind::WebRtc => Box::new(WebRtcVad::new(config.sample_rate, config.vad_mode)?),
        VadKind::Energy => Box::new(EnergyVad::new(config.energy_threshold)),
    })
}

/// WebRTC VAD. Chunks are split into 30ms frames; a chunk is speech if any frame is.
pub struct WebRtcVad {
    vad: Vad,
    sample_rate: u32,
    mode: u8,
    frame_size: usize,
}

fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::VadInit(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {other}"
        ))),
    }
}

fn new_vad(sample_rate: u32, mode: u8) -> VoiceResult<Vad> {
    let rate = vad_rate(sample_rate)?;
    let mut vad = Vad::new();
    vad.set_mode(vad_mode(mode));
    vad.set_sample_rate(rate);
    Ok(vad)
}

impl WebRtcVad {
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        if mode > 3 {
            return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {mode}")));
        }
        let vad = new_vad(sample_rate, mode)?;
        let frame_size = (sample_rate as usize * 30) / 1000;
        info!(target: "chino::voice", sample_rate, mode, frame_size, "🎙️ WebRTC VAD ready");
        Ok(Self {
            vad,
            sample_rate,
            mode,
            frame_size,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl SpeechDetector for WebRtcVad {
    fn is_speech(&mut self, chunk: &[f32]) -> VoiceResult<bool> {
        let mut speech = false;
        // a trailing partial frame is ignored
        for frame in chunk.chunks_exact(self.frame_size) {
            let pcm: Vec<i16> = frame
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect();
            let voiced = self
                .vad
                .is_voice_segment(&pcm)
                .map_err(|_| VoiceError::VadProcessing("invalid frame length".to_string()))?;
            speech |= voiced;
        }
        debug!(target: "chino::voice", speech, samples = chunk.len(), "vad");
        Ok(speech)
    }

    fn reset(&mut self) -> VoiceResult<()> {
        self.vad = new_vad(self.sample_rate, self.mode)?;
        Ok(())
    }
}

/// RMS threshold detector. Stateless and device-independent.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

impl SpeechDetector for EnergyVad {
    fn is_speech(&mut self, chunk: &[f32]) -> VoiceResult<bool> {
        Ok(rms(chunk) >= self.threshold)
    }

    fn reset(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}
