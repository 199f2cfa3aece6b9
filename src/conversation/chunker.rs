//! Sentence-sized pieces of a streamed reply
//!
//! Deltas are buffered until a sentence ends, the buffer grows past
//! `max_chars`, or nothing has been flushed for `max_wait`.

use std::time::{Duration, Instant};

const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];

/// Splits streamed text into chunks worth synthesizing on their own
#[derive(Debug)]
pub struct SentenceChunker {
    max_chars: usize,
    max_wait: Duration,
    buffer: String,
    last_flush: Instant,
}

impl SentenceChunker {
    #[must_use]
    pub fn new(max_chars: usize, max_wait: Duration, now: Instant) -> Self {
        Self {
            max_chars: max_chars.max(1),
            max_wait,
            buffer: String::new(),
            last_flush: now,
        }
    }

    /// Append a delta and return every chunk now ready to speak
    ///
    /// An empty delta only checks the size and wait limits.
    pub fn push(&mut self, delta: &str, now: Instant) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut ready = Vec::new();
        while let Some(start) = self.buffer.find(SENTENCE_ENDINGS) {
            let end = start + self.buffer[start..].chars().next().map_or(1, char::len_utf8);
            let sentence: String = self.buffer.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                ready.push(sentence.to_string());
                self.last_flush = now;
            }
        }

        if self.should_force(now) {
            let forced = self.take();
            if !forced.is_empty() {
                ready.push(forced);
                self.last_flush = now;
            }
        }
        ready
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        let tail = self.take();
        (!tail.is_empty()).then_some(tail)
    }

    /// When a pending partial chunk will be forced out, if there is one
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.buffer.trim().is_empty() {
            return None;
        }
        Some(self.last_flush + self.max_wait)
    }

    fn should_force(&self, now: Instant) -> bool {
        let pending = self.buffer.trim();
        if pending.is_empty() {
            return false;
        }
        pending.chars().count() >= self.max_chars
            || now.saturating_duration_since(self.last_flush) >= self.max_wait
    }

    fn take(&mut self) -> String {
        let chunk = self.buffer.trim().to_string();
        self.buffer.clear();
        chunk
    }
}
