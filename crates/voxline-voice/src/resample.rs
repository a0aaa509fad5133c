use crate::error::VoiceError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Input frames per resampler call. 20 ms at 48 kHz, so a typical browser
/// frame is converted without waiting for more audio.
const CHUNK_FRAMES: usize = 960;

/// Streaming mono resampler.
///
/// Incoming samples are buffered until a full chunk is available, so callers
/// can push arbitrarily sized network frames. Equal rates pass through.
pub struct StreamResampler {
    // rubato's interpolator is Send but not Sync. Only reached through
    // `get_mut`, so the lock is never taken.
    inner: Option<Mutex<SincFixedIn<f32>>>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, VoiceError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(VoiceError::Config(
                "sample rates must be greater than 0".to_string(),
            ));
        }

        let inner = if input_rate == output_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(
                output_rate as f64 / input_rate as f64,
                1.0,
                params,
                CHUNK_FRAMES,
                1,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to create resampler: {}", e)))?;
            debug!(input_rate, output_rate, "created resampler");
            Some(Mutex::new(resampler))
        };

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            pending: Vec::new(),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Pushes samples and returns whatever output complete chunks produced.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, VoiceError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };
        let resampler = resampler.get_mut().unwrap_or_else(|e| e.into_inner());

        self.pending
            .extend(samples.iter().map(|&s| s as f32 / 32768.0));

        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let waves_in = vec![self.pending.drain(..needed).collect::<Vec<f32>>()];
            let planar = resampler
                .process(&waves_in, None)
                .map_err(|e| VoiceError::Audio(format!("resampling failed: {}", e)))?;
            out.extend(planar[0].iter().map(|&v| to_i16(v)));
        }
        Ok(out)
    }

    /// Drains buffered input, zero-padding the final chunk. Output is cut to
    /// the length proportional to the real input.
    pub fn flush(&mut self) -> Result<Vec<i16>, VoiceError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        let resampler = resampler.get_mut().unwrap_or_else(|e| e.into_inner());
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let real = self.pending.len();
        let needed = resampler.input_frames_next();
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(needed, 0.0);
        let waves_in = vec![chunk];

        let planar = resampler
            .process(&waves_in, None)
            .map_err(|e| VoiceError::Audio(format!("resampling failed: {}", e)))?;

        let keep = ((real as f64) * self.output_rate as f64 / self.input_rate as f64).ceil() as usize;
        Ok(planar[0].iter().take(keep).map(|&v| to_i16(v)).collect())
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(r) = self.inner.as_mut() {
            r.get_mut().unwrap_or_else(|e| e.into_inner()).reset();
        }
    }
}

impl fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResampler")
            .field("input_rate", &self.input_rate())
            .field("output_rate", &self.output_rate())
            .finish()
    }
}

fn to_i16(v: f32) -> i16 {
    (v * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>(_: &T) {}

    #[test]
    fn resampler_can_be_shared_across_tasks() {
        let r = StreamResampler::new(48_000, 16_000).unwrap();
        assert_send_sync(&r);
    }

    #[test]
    fn rejects_zero_rate() {
        assert!(matches!(
            StreamResampler::new(0, 16_000),
            Err(VoiceError::Config(_))
        ));
    }

    #[test]
    fn equal_rates_pass_through() {
        let mut r = StreamResampler::new(16_000, 16_000).unwrap();
        assert_eq!(r.process(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert!(r.flush().unwrap().is_empty());
    }

    #[test]
    fn downsampling_produces_proportional_output() {
        let mut r = StreamResampler::new(48_000, 16_000).unwrap();
        // One second of a 440 Hz tone, pushed in 20 ms frames.
        let tone: Vec<i16> = (0..48_000)
            .map(|i| ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48_000.0).sin() * 8000.0) as i16)
            .collect();
        let mut out = Vec::new();
        for frame in tone.chunks(960) {
            out.extend(r.process(frame).unwrap());
        }
        out.extend(r.flush().unwrap());
        let expected = 16_000i64;
        assert!(
            (out.len() as i64 - expected).abs() < 200,
            "got {} samples",
            out.len()
        );
    }

    #[test]
    fn small_frames_are_buffered() {
        let mut r = StreamResampler::new(48_000, 16_000).unwrap();
        assert!(r.process(&[0; 100]).unwrap().is_empty());
        let flushed = r.flush().unwrap();
        assert!(flushed.len() <= 34);
    }
}
