//! Energy-based voice activity and end-of-turn detection.
//!
//! Audio is classified in fixed frames by RMS level. A caller turn moves
//! through idle → speaking → trailing silence. Once the trailing silence
//! reaches `early_trigger_ratio` of the configured window the detector goes
//! "hot" and hands the utterance out for transcription, so the transcript
//! is usually ready by the time the turn is really over. Voice returning
//! while hot cancels that speculation.

use crate::pcm::rms;
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::{debug, trace};

fn default_frame_ms() -> u32 {
    20
}
fn default_energy_threshold() -> f32 {
    0.015
}
fn default_speech_start_frames() -> u32 {
    2
}
fn default_post_speech_silence_ms() -> u32 {
    400
}
fn default_min_recording_ms() -> u32 {
    300
}
fn default_early_trigger_ratio() -> f32 {
    0.7
}
fn default_max_utterance_ms() -> u32 {
    30_000
}
fn default_pre_roll_ms() -> u32 {
    200
}
fn default_partial_interval_ms() -> u32 {
    1000
}

/// Tuning for [`TurnDetector`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VadConfig {
    /// Analysis frame length.
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Normalized RMS level at or above which a frame counts as voiced.
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
    /// Consecutive voiced frames needed to open a turn.
    #[serde(default = "default_speech_start_frames")]
    pub speech_start_frames: u32,
    /// Trailing silence that ends a turn.
    #[serde(default = "default_post_speech_silence_ms")]
    pub post_speech_silence_ms: u32,
    /// Utterances with less speech than this are dropped as noise.
    #[serde(default = "default_min_recording_ms")]
    pub min_recording_ms: u32,
    /// Fraction of `post_speech_silence_ms` after which transcription starts.
    #[serde(default = "default_early_trigger_ratio")]
    pub early_trigger_ratio: f32,
    /// Utterances are cut at this length; the turn itself carries on.
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u32,
    /// Audio kept from before the turn opened.
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u32,
    /// Turn audio between interim transcripts. 0 disables them.
    #[serde(default = "default_partial_interval_ms")]
    pub partial_interval_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            frame_ms: default_frame_ms(),
            energy_threshold: default_energy_threshold(),
            speech_start_frames: default_speech_start_frames(),
            post_speech_silence_ms: default_post_speech_silence_ms(),
            min_recording_ms: default_min_recording_ms(),
            early_trigger_ratio: default_early_trigger_ratio(),
            max_utterance_ms: default_max_utterance_ms(),
            pre_roll_ms: default_pre_roll_ms(),
            partial_interval_ms: default_partial_interval_ms(),
        }
    }
}

/// What the detector observed in the audio fed to it.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The caller started talking.
    SpeechStarted,
    /// The caller went quiet long enough to transcribe. `samples` is the
    /// whole utterance so far, mono at the detector's sample rate.
    UtteranceReady { samples: Vec<i16> },
    /// The caller is still talking; `samples` is the utterance so far, for
    /// an interim transcript.
    UtterancePartial { samples: Vec<i16> },
    /// The utterance hit `max_utterance_ms` while the caller kept talking.
    /// The turn stays open and the next `UtteranceReady` carries only the
    /// audio after the cut.
    UtteranceCut { samples: Vec<i16> },
    /// The caller started talking again after `UtteranceReady`; the previous
    /// utterance is superseded by a longer one.
    SpeechResumed,
    /// The turn is over.
    UtteranceEnded,
}

/// Frame-based turn detector. Feed it mono samples at `sample_rate`.
#[derive(Debug)]
pub struct TurnDetector {
    config: VadConfig,
    sample_rate: u32,
    frame_len: usize,
    early_frames: u32,
    end_frames: u32,
    partial_frames: u32,
    pre_roll_cap: usize,
    pending: Vec<i16>,
    pre_roll: VecDeque<i16>,
    utterance: Vec<i16>,
    in_turn: bool,
    voiced_run: u32,
    silent_frames: u32,
    hot: bool,
    /// Cut at max length; the rest is handed out whatever its length.
    continued: bool,
    frames_since_partial: u32,
}

impl TurnDetector {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        let frame_ms = config.frame_ms.max(1);
        let frame_len = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        let end_frames = config.post_speech_silence_ms.div_ceil(frame_ms).max(1);
        let early_ms = (config.post_speech_silence_ms as f32 * config.early_trigger_ratio).ceil() as u32;
        let early_frames = early_ms.div_ceil(frame_ms).clamp(1, end_frames);
        let partial_frames = config.partial_interval_ms.div_ceil(frame_ms);
        let pre_roll_cap = (sample_rate as u64 * config.pre_roll_ms as u64 / 1000) as usize
            + frame_len * config.speech_start_frames as usize;

        Self {
            config,
            sample_rate,
            frame_len,
            early_frames,
            end_frames,
            partial_frames,
            pre_roll_cap,
            pending: Vec::new(),
            pre_roll: VecDeque::with_capacity(pre_roll_cap),
            utterance: Vec::new(),
            in_turn: false,
            voiced_run: 0,
            silent_frames: 0,
            hot: false,
            continued: false,
            frames_since_partial: 0,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Whether a turn is currently open.
    pub fn in_turn(&self) -> bool {
        self.in_turn
    }

    /// Whether the current utterance has already been handed out.
    pub fn is_hot(&self) -> bool {
        self.hot
    }

    /// Consumes samples and returns the events they produced, in order.
    pub fn feed(&mut self, samples: &[i16]) -> Vec<TurnEvent> {
        self.pending.extend_from_slice(samples);
        let mut events = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.frame_len {
            let frame: Vec<i16> = self.pending[offset..offset + self.frame_len].to_vec();
            offset += self.frame_len;
            self.process_frame(&frame, &mut events);
        }
        self.pending.drain(..offset);
        events
    }

    /// Returns to idle, dropping any buffered audio.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pre_roll.clear();
        self.end_turn();
    }

    fn process_frame(&mut self, frame: &[i16], events: &mut Vec<TurnEvent>) {
        let level = rms(frame);
        let voiced = level >= self.config.energy_threshold;
        trace!(level, voiced, "vad frame");

        if !self.in_turn {
            self.voiced_run = if voiced { self.voiced_run + 1 } else { 0 };
            self.pre_roll.extend(frame.iter().copied());
            while self.pre_roll.len() > self.pre_roll_cap {
                self.pre_roll.pop_front();
            }
            if self.voiced_run >= self.config.speech_start_frames.max(1) {
                self.in_turn = true;
                self.silent_frames = 0;
                self.hot = false;
                self.frames_since_partial = 0;
                self.utterance = self.pre_roll.drain(..).collect();
                debug!("speech started");
                events.push(TurnEvent::SpeechStarted);
            }
            return;
        }

        self.utterance.extend_from_slice(frame);

        if voiced {
            self.silent_frames = 0;
            if self.hot {
                self.hot = false;
                debug!("speech resumed after early trigger");
                events.push(TurnEvent::SpeechResumed);
            }
        } else {
            self.silent_frames += 1;
        }

        if self.ms(self.utterance.len()) >= self.config.max_utterance_ms as u64 {
            if self.hot {
                // Already handed out; only silence was added since.
                debug!("utterance hit maximum length while hot");
                events.push(TurnEvent::UtteranceEnded);
                self.end_turn();
            } else {
                debug!("utterance hit maximum length, cutting");
                events.push(TurnEvent::UtteranceCut {
                    samples: std::mem::take(&mut self.utterance),
                });
                self.continued = true;
                self.frames_since_partial = 0;
            }
            return;
        }

        if !self.hot && self.silent_frames >= self.early_frames {
            let speech_samples = self
                .utterance
                .len()
                .saturating_sub(self.silent_frames as usize * self.frame_len);
            if self.continued || self.ms(speech_samples) >= self.config.min_recording_ms as u64 {
                self.hot = true;
                debug!(
                    silence_ms = self.silent_frames * self.config.frame_ms,
                    "early transcription trigger"
                );
                events.push(TurnEvent::UtteranceReady {
                    samples: self.utterance.clone(),
                });
            }
        }

        self.frames_since_partial += 1;
        if self.partial_frames > 0 && !self.hot && self.frames_since_partial >= self.partial_frames {
            self.frames_since_partial = 0;
            events.push(TurnEvent::UtterancePartial {
                samples: self.utterance.clone(),
            });
        }

        if self.silent_frames >= self.end_frames {
            if self.hot {
                events.push(TurnEvent::UtteranceEnded);
            } else {
                debug!("utterance too short, discarded");
            }
            self.end_turn();
        }
    }

    fn end_turn(&mut self) {
        self.in_turn = false;
        self.hot = false;
        self.voiced_run = 0;
        self.silent_frames = 0;
        self.continued = false;
        self.frames_since_partial = 0;
        self.utterance.clear();
    }

    fn ms(&self, samples: usize) -> u64 {
        samples as u64 * 1000 / self.sample_rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;
    const FRAME: usize = 320; // 20 ms

    fn voiced(ms: usize) -> Vec<i16> {
        // Square wave well above the threshold.
        (0..ms * 16)
            .map(|i| if (i / 20) % 2 == 0 { 6000 } else { -6000 })
            .collect()
    }

    fn silence(ms: usize) -> Vec<i16> {
        vec![0; ms * 16]
    }

    fn config() -> VadConfig {
        VadConfig {
            partial_interval_ms: 0,
            ..VadConfig::default()
        }
    }

    fn detector() -> TurnDetector {
        TurnDetector::new(config(), RATE)
    }

    #[test]
    fn silence_produces_no_events() {
        let mut d = detector();
        assert!(d.feed(&silence(2000)).is_empty());
        assert!(!d.in_turn());
    }

    #[test]
    fn full_turn_emits_start_ready_end() {
        let mut d = detector();
        let mut events = d.feed(&voiced(600));
        events.extend(d.feed(&silence(500)));

        assert_eq!(events.first(), Some(&TurnEvent::SpeechStarted));
        let ready = events
            .iter()
            .position(|e| matches!(e, TurnEvent::UtteranceReady { .. }))
            .expect("utterance ready");
        let ended = events
            .iter()
            .position(|e| *e == TurnEvent::UtteranceEnded)
            .expect("utterance ended");
        assert!(ready < ended);
        assert!(!d.in_turn());
    }

    #[test]
    fn early_trigger_fires_before_full_silence() {
        let mut d = detector();
        d.feed(&voiced(600));
        // 280 ms of silence is 70% of the 400 ms window.
        let events = d.feed(&silence(300));
        assert!(matches!(events.as_slice(), [TurnEvent::UtteranceReady { .. }]));
        assert!(d.is_hot());
        assert!(d.in_turn());
    }

    #[test]
    fn resumed_speech_extends_the_utterance() {
        let mut d = detector();
        d.feed(&voiced(600));
        let first = d.feed(&silence(300));
        let first_len = match &first[0] {
            TurnEvent::UtteranceReady { samples } => samples.len(),
            other => panic!("unexpected {:?}", other),
        };

        let events = d.feed(&voiced(400));
        assert_eq!(events, vec![TurnEvent::SpeechResumed]);

        let events = d.feed(&silence(500));
        let second_len = events
            .iter()
            .find_map(|e| match e {
                TurnEvent::UtteranceReady { samples } => Some(samples.len()),
                _ => None,
            })
            .expect("second utterance");
        assert!(second_len > first_len);
        assert_eq!(events.last(), Some(&TurnEvent::UtteranceEnded));
    }

    #[test]
    fn short_blips_are_discarded() {
        let mut d = detector();
        let mut events = d.feed(&voiced(100));
        events.extend(d.feed(&silence(600)));
        assert_eq!(events, vec![TurnEvent::SpeechStarted]);
        assert!(!d.in_turn());
    }

    #[test]
    fn single_voiced_frame_does_not_open_turn() {
        let mut d = detector();
        let mut audio = voiced(20);
        audio.extend(silence(100));
        assert!(d.feed(&audio).is_empty());
    }

    #[test]
    fn utterance_includes_pre_roll() {
        let mut d = detector();
        d.feed(&silence(500));
        d.feed(&voiced(600));
        let events = d.feed(&silence(300));
        match &events[0] {
            TurnEvent::UtteranceReady { samples } => {
                // 200 ms pre-roll + 600 ms speech + 280 ms silence at least.
                assert!(samples.len() >= (600 + 280) * 16 + 200 * 16 - FRAME);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn long_utterances_are_cut_without_ending_the_turn() {
        let config = VadConfig {
            max_utterance_ms: 1000,
            ..config()
        };
        let mut d = TurnDetector::new(config, RATE);
        let events = d.feed(&voiced(1500));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TurnEvent::SpeechStarted);
        let cut_len = match &events[1] {
            TurnEvent::UtteranceCut { samples } => samples.len(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(cut_len, 1000 * 16);
        assert!(d.in_turn());

        let events = d.feed(&silence(500));
        let rest_len = match &events[0] {
            TurnEvent::UtteranceReady { samples } => samples.len(),
            other => panic!("unexpected {:?}", other),
        };
        assert!(rest_len < cut_len);
        assert_eq!(events.last(), Some(&TurnEvent::UtteranceEnded));
        assert!(!events.contains(&TurnEvent::SpeechStarted));
    }

    #[test]
    fn short_remainder_after_cut_is_still_handed_out() {
        let config = VadConfig {
            max_utterance_ms: 1000,
            ..config()
        };
        let mut d = TurnDetector::new(config, RATE);
        // 100 ms of speech after the cut, under min_recording_ms.
        d.feed(&voiced(1100));
        let events = d.feed(&silence(500));
        assert!(matches!(events[0], TurnEvent::UtteranceReady { .. }));
        assert_eq!(events.last(), Some(&TurnEvent::UtteranceEnded));
    }

    #[test]
    fn max_length_while_hot_only_ends_the_turn() {
        let config = VadConfig {
            max_utterance_ms: 920,
            ..config()
        };
        let mut d = TurnDetector::new(config, RATE);
        d.feed(&voiced(600));
        // Hot at ~280 ms of silence, max length two or so frames later.
        let events = d.feed(&silence(400));
        let ready = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::UtteranceReady { .. }))
            .count();
        assert_eq!(ready, 1);
        assert_eq!(events.last(), Some(&TurnEvent::UtteranceEnded));
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::UtteranceCut { .. })));
        assert!(!d.in_turn());
    }

    #[test]
    fn partials_stop_once_the_utterance_is_handed_out() {
        let config = VadConfig {
            partial_interval_ms: 100,
            ..VadConfig::default()
        };
        let mut d = TurnDetector::new(config, RATE);
        let mut events = d.feed(&voiced(1000));
        let partials: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::UtterancePartial { samples } => Some(samples.len()),
                _ => None,
            })
            .collect();
        assert!(partials.len() >= 9);
        assert!(partials.windows(2).all(|w| w[0] < w[1]));

        events.extend(d.feed(&silence(500)));
        let ready = events
            .iter()
            .position(|e| matches!(e, TurnEvent::UtteranceReady { .. }))
            .expect("utterance ready");
        assert!(!events[ready..]
            .iter()
            .any(|e| matches!(e, TurnEvent::UtterancePartial { .. })));
    }

    #[test]
    fn partial_frames_are_carried_over() {
        let mut d = detector();
        let audio = voiced(100);
        let mut events = Vec::new();
        for piece in audio.chunks(97) {
            events.extend(d.feed(piece));
        }
        assert_eq!(events, vec![TurnEvent::SpeechStarted]);
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut d = detector();
        d.feed(&voiced(600));
        assert!(d.in_turn());
        d.reset();
        assert!(!d.in_turn());
        assert!(d.feed(&silence(500)).is_empty());
    }
}
