//! Audio plumbing for the Voxline voice agent.
//!
//! Converts caller audio into utterances and utterances into text, and
//! agent text back into audio:
//!
//! - [`pcm`]: s16le codec, downmixing and WAV framing.
//! - [`resample`]: streaming sample-rate conversion to the 16 kHz the
//!   recognizer expects.
//! - [`vad`]: energy-based voice activity and end-of-turn detection.
//! - [`input`]: the per-caller pipeline tying the three together.
//! - [`stt`]: speech-to-text through the whisper.cpp CLI.
//! - [`tts`]: text-to-speech through piper or `espeak-ng`.
//! - [`segmenter`]: splits streamed LLM tokens into speakable sentences.

pub mod error;
pub mod input;
pub mod pcm;
pub mod resample;
pub mod segmenter;
pub mod stt;
pub mod tts;
pub mod vad;

pub use error::VoiceError;
pub use input::AudioInputProcessor;
pub use resample::StreamResampler;
pub use segmenter::{sanitize_for_speech, SpeechSegmenter};
pub use stt::{SttService, SttStats};
pub use tts::{SynthesizedAudio, TtsService, TtsStats};
pub use vad::{TurnDetector, TurnEvent, VadConfig};

/// Sample rate the recognizer and turn detector operate at.
pub const STT_SAMPLE_RATE: u32 = 16_000;
