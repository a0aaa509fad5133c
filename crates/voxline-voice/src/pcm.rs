//! 16-bit little-endian PCM helpers and WAV framing.

/// Size of the canonical RIFF/WAVE header written by [`wav_header`].
pub const WAV_HEADER_LEN: usize = 44;

/// Decodes s16le bytes into samples. A trailing odd byte is ignored.
pub fn decode_pcm16le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encodes samples as s16le bytes.
pub fn encode_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Mixes interleaved multi-channel audio down to mono by averaging each frame.
///
/// An incomplete trailing frame is dropped.
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels as usize;
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Root-mean-square level of `samples`, normalized to `[0, 1]`.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Builds a 44-byte PCM WAV header for `data_len` bytes of s16le audio.
pub fn wav_header(data_len: u32, sample_rate: u32, channels: u16) -> [u8; WAV_HEADER_LEN] {
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut h = [0u8; WAV_HEADER_LEN];
    h[0..4].copy_from_slice(b"RIFF");
    h[4..8].copy_from_slice(&(36 + data_len).to_le_bytes());
    h[8..12].copy_from_slice(b"WAVE");
    h[12..16].copy_from_slice(b"fmt ");
    h[16..20].copy_from_slice(&16u32.to_le_bytes());
    h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    h[22..24].copy_from_slice(&channels.to_le_bytes());
    h[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    h[32..34].copy_from_slice(&block_align.to_le_bytes());
    h[34..36].copy_from_slice(&16u16.to_le_bytes());
    h[36..40].copy_from_slice(b"data");
    h[40..44].copy_from_slice(&data_len.to_le_bytes());
    h
}

/// Wraps mono samples in a WAV container.
pub fn wrap_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data = encode_pcm16le(samples);
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data.len());
    out.extend_from_slice(&wav_header(data.len() as u32, sample_rate, 1));
    out.extend_from_slice(&data);
    out
}

/// Returns the PCM payload of a WAV buffer, or the input untouched when it
/// has no RIFF header.
pub fn strip_wav_header(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= WAV_HEADER_LEN && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        &bytes[WAV_HEADER_LEN..]
    } else {
        bytes
    }
}
