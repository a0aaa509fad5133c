//! Splits streamed LLM output into speakable segments.
//!
//! Tokens arrive a few characters at a time. Synthesizing each token would
//! sound choppy and synthesizing the whole answer would delay the first
//! audio, so text is cut at sentence boundaries and handed to TTS as soon as
//! a sentence is complete.

const DEFAULT_SOFT_LIMIT: usize = 120;
const DEFAULT_HARD_LIMIT: usize = 240;

/// Streaming sentence splitter.
#[derive(Debug, Clone)]
pub struct SpeechSegmenter {
    buffer: String,
    soft_limit: usize,
    hard_limit: usize,
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_SOFT_LIMIT, DEFAULT_HARD_LIMIT)
    }
}

impl SpeechSegmenter {
    /// `soft_limit`: above this many characters a comma also ends a segment.
    /// `hard_limit`: segments never grow past this many characters.
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            buffer: String::new(),
            soft_limit,
            hard_limit: hard_limit.max(soft_limit).max(1),
        }
    }

    /// Appends a token and returns the segments it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut out = Vec::new();
        while let Some(cut) = self.next_cut() {
            let rest = self.buffer.split_off(cut);
            let segment = std::mem::replace(&mut self.buffer, rest.trim_start().to_string());
            let spoken = sanitize_for_speech(&segment);
            if !spoken.is_empty() {
                out.push(spoken);
            }
        }
        out
    }

    /// Returns whatever is left once the stream is over.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let spoken = sanitize_for_speech(&rest);
        (!spoken.is_empty()).then_some(spoken)
    }

    /// Drops buffered text.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn next_cut(&self) -> Option<usize> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        for (k, &(i, c)) in chars.iter().enumerate() {
            match c {
                '\n' => return Some(i + c.len_utf8()),
                '.' | '!' | '?' | ';' | ':' => {
                    // Closing quotes and emphasis belong to the sentence.
                    let mut j = k + 1;
                    while j < chars.len() && is_closer(chars[j].1) {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].1.is_whitespace() {
                        return Some(chars[j].0);
                    }
                }
                _ => {}
            }
        }

        let len = self.buffer.chars().count();
        if len > self.soft_limit {
            if let Some(pos) = self.buffer.rfind(", ") {
                return Some(pos + 1);
            }
        }
        if len > self.hard_limit {
            let limit = self
                .buffer
                .char_indices()
                .nth(self.hard_limit)
                .map(|(i, _)| i)
                .unwrap_or(self.buffer.len());
            return Some(match self.buffer[..limit].rfind(char::is_whitespace) {
                Some(ws) if ws > 0 => ws,
                _ => limit,
            });
        }
        None
    }
}

/// Strips markup and pictographs that a speech engine would read aloud or
/// choke on, and collapses whitespace.
pub fn sanitize_for_speech(text: &str) -> String {
    let filtered: String = text
        .chars()
        .filter(|&c| !matches!(c, '*' | '#' | '_' | '`' | '>' | '~' | '|'))
        .filter(|&c| !is_pictographic(c))
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_closer(c: char) -> bool {
    matches!(c, '*' | '_' | '"' | '\'' | ')' | ']' | '\u{201D}' | '\u{2019}')
}

fn is_pictographic(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE00..=0xFE0F | 0x200D
    )
}
