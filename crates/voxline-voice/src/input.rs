use crate::error::VoiceError;
use crate::pcm::{decode_pcm16le, downmix};
use crate::resample::StreamResampler;
use crate::vad::{TurnDetector, TurnEvent, VadConfig};
use crate::STT_SAMPLE_RATE;
use tracing::info;

/// Turns raw caller audio into turn events.
///
/// Receives s16le interleaved chunks at the caller's format, mixes them to
/// mono, resamples to 16 kHz and runs the turn detector.
#[derive(Debug)]
pub struct AudioInputProcessor {
    source_sample_rate: u32,
    source_channels: u16,
    resampler: StreamResampler,
    detector: TurnDetector,
    carry: Vec<u8>,
    bytes_received: u64,
}

impl AudioInputProcessor {
    pub fn new(
        source_sample_rate: u32,
        source_channels: u16,
        vad: VadConfig,
    ) -> Result<Self, VoiceError> {
        if source_channels == 0 {
            return Err(VoiceError::Config(
                "number of channels must be greater than 0".to_string(),
            ));
        }
        let resampler = StreamResampler::new(source_sample_rate, STT_SAMPLE_RATE)?;
        info!(
            source_sample_rate,
            source_channels,
            target_sample_rate = STT_SAMPLE_RATE,
            "audio input configured"
        );
        Ok(Self {
            source_sample_rate,
            source_channels,
            resampler,
            detector: TurnDetector::new(vad, STT_SAMPLE_RATE),
            carry: Vec::new(),
            bytes_received: 0,
        })
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn source_channels(&self) -> u16 {
        self.source_channels
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Feeds one network chunk and returns the turn events it produced.
    ///
    /// A chunk that ends in the middle of a frame keeps the dangling bytes
    /// for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<TurnEvent>, VoiceError> {
        self.bytes_received += chunk.len() as u64;

        self.carry.extend_from_slice(chunk);
        let frame_bytes = self.source_channels as usize * 2;
        let usable = self.carry.len() - self.carry.len() % frame_bytes;
        let bytes: Vec<u8> = self.carry.drain(..usable).collect();

        let samples = decode_pcm16le(&bytes);
        let mono = downmix(&samples, self.source_channels);
        let resampled = self.resampler.process(&mono)?;
        Ok(self.detector.feed(&resampled))
    }

    /// Drops buffered audio and returns the detector to idle.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.resampler.reset();
        self.detector.reset();
    }
}
