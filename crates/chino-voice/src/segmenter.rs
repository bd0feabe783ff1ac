//! Groups voiced chunks into utterances.
//!
//! A segment opens on the first voiced chunk and closes after `silence_chunks`
//! consecutive silent ones. Segments shorter than the minimum are discarded; a
//! segment that reaches the maximum length is committed immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::VoiceConfig;

#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub ended_at: DateTime<Utc>,
}

impl SpeechSegment {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug)]
pub struct SpeechSegmenter {
    sample_rate: u32,
    silence_chunks: usize,
    min_samples: usize,
    max_samples: usize,
    buffer: Vec<f32>,
    speaking: bool,
    silent_run: usize,
}

impl SpeechSegmenter {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            silence_chunks: config.silence_chunks.max(1),
            min_samples: config.min_speech_samples(),
            max_samples: config.max_segment_samples().max(1),
            buffer: Vec::new(),
            speaking: false,
            silent_run: 0,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one chunk with its detection result. Returns a segment when one closes.
    pub fn push(&mut self, chunk: &[f32], is_speech: bool) -> Option<SpeechSegment> {
        if is_speech {
            if !self.speaking {
                debug!(target: "chino::voice", "speech started");
            }
            self.speaking = true;
            self.silent_run = 0;
            self.buffer.extend_from_slice(chunk);
            if self.buffer.len() >= self.max_samples {
                info!(target: "chino::voice", samples = self.buffer.len(), "max segment length reached, committing");
                return self.commit();
            }
            return None;
        }

        if !self.speaking {
            return None;
        }
        self.silent_run += 1;
        if self.silent_run < self.silence_chunks {
            return None;
        }
        debug!(target: "chino::voice", silent_chunks = self.silent_run, "end of speech");
        self.commit()
    }

    fn commit(&mut self) -> Option<SpeechSegment> {
        let samples = std::mem::take(&mut self.buffer);
        self.speaking = false;
        self.silent_run = 0;
        if samples.len() < self.min_samples {
            debug!(target: "chino::voice", samples = samples.len(), min = self.min_samples, "segment too short, discarded");
            return None;
        }
        Some(SpeechSegment {
            samples,
            sample_rate: self.sample_rate,
            ended_at: Utc::now(),
        })
    }

    /// Drop any partial segment.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.speaking = false;
        self.silent_run = 0;
    }
}
