//! Local keyword spotting
//!
//! Transcribes wake-phase clips with an offline recognizer and fuzzy-matches
//! the transcript against the configured keyword list.

use std::path::Path;
use std::time::Duration;

use super::clip::{AudioClip, SAMPLE_RATE};
use super::recognizer::{SpeechRecognizer, load_recognizer};
use crate::Result;

/// Default fraction of a keyword's length that may be edited and still match
pub const DEFAULT_MAX_EDIT_RATIO: f64 = 0.25;

/// Casefold and strip punctuation, collapsing whitespace to single spaces
#[must_use]
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized text with word boundaries removed ("Hey, Pi!" -> "heypi")
fn compact(text: &str) -> String {
    normalize(text).replace(' ', "")
}

/// One configured keyword
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    /// Keyword as written in configuration
    pub display: String,
    compact: String,
}

/// Ordered, de-duplicated keyword list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordSet {
    keywords: Vec<Keyword>,
}

impl KeywordSet {
    /// Build from raw keywords, dropping blanks and normalized duplicates
    #[must_use]
    pub fn new<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keywords: Vec<Keyword> = Vec::new();
        for item in raw {
            let display = item.as_ref().trim();
            let key = compact(display);
            if key.is_empty() || keywords.iter().any(|k| k.compact == key) {
                continue;
            }
            keywords.push(Keyword {
                display: display.to_string(),
                compact: key,
            });
        }
        Self { keywords }
    }

    /// Keywords in configured order
    #[must_use]
    pub fn keywords(&self) -> &[Keyword] {
        &self.keywords
    }

    /// Number of keywords
    #[must_use]
    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    /// Whether no keywords are configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

/// A keyword found in a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    /// The configured keyword that matched
    pub keyword: String,
    /// Edit distance of the best matching span (0 = exact)
    pub distance: usize,
}

/// Fuzzy matcher over a [`KeywordSet`]
///
/// A keyword matches when some contiguous span of the compacted transcript
/// (normalized, spaces removed) is within `floor(len * max_edit_ratio)`
/// edits of the compacted keyword. Exact substrings always match.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: KeywordSet,
    max_edit_ratio: f64,
}

impl KeywordMatcher {
    /// Create a matcher
    #[must_use]
    pub fn new(keywords: KeywordSet, max_edit_ratio: f64) -> Self {
        Self {
            keywords,
            max_edit_ratio: max_edit_ratio.clamp(0.0, 1.0),
        }
    }

    /// The keyword list
    #[must_use]
    pub const fn keywords(&self) -> &KeywordSet {
        &self.keywords
    }

    /// Edits tolerated for a keyword of `len` characters
    #[must_use]
    pub fn tolerance(&self, len: usize) -> usize {
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let edits = (len as f64 * self.max_edit_ratio).floor() as usize;
        edits
    }

    /// Find the first configured keyword present in `text`
    #[must_use]
    pub fn find(&self, text: &str) -> Option<KeywordMatch> {
        let haystack: Vec<char> = compact(text).chars().collect();
        if haystack.is_empty() {
            return None;
        }

        self.keywords.keywords.iter().find_map(|kw| {
            let distance = self.best_distance(&haystack, &kw.compact)?;
            Some(KeywordMatch {
                keyword: kw.display.clone(),
                distance,
            })
        })
    }

    fn best_distance(&self, haystack: &[char], keyword: &str) -> Option<usize> {
        let haystack_str: String = haystack.iter().collect();
        if haystack_str.contains(keyword) {
            return Some(0);
        }

        let klen = keyword.chars().count();
        let tolerance = self.tolerance(klen);
        if tolerance == 0 {
            return None;
        }

        let shortest = klen.saturating_sub(tolerance).max(1);
        let longest = (klen + tolerance).min(haystack.len());

        let mut best: Option<usize> = None;
        for len in shortest..=longest {
            for window in haystack.windows(len) {
                let span: String = window.iter().collect();
                let distance = strsim::levenshtein(&span, keyword);
                if distance <= tolerance && best.is_none_or(|b| distance < b) {
                    best = Some(distance);
                }
            }
        }
        best
    }
}

/// Offline transcription plus keyword matching
pub struct LocalKeywordSpotter {
    recognizer: Box<dyn SpeechRecognizer>,
    matcher: KeywordMatcher,
}

impl LocalKeywordSpotter {
    /// Create a spotter around an already-loaded recognizer
    #[must_use]
    pub fn new(recognizer: Box<dyn SpeechRecognizer>, matcher: KeywordMatcher) -> Self {
        Self {
            recognizer,
            matcher,
        }
    }

    /// Load the offline model and warm it up
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ModelMissing`] if the model cannot be loaded;
    /// the listener cannot run without it
    pub fn load(model_path: &Path, matcher: KeywordMatcher) -> Result<Self> {
        let recognizer = load_recognizer(model_path)?;
        let spotter = Self::new(recognizer, matcher);
        spotter.warm_up();
        Ok(spotter)
    }

    /// Run one throwaway recognition so the first real clip is not slow
    pub fn warm_up(&self) {
        let silence = AudioClip::silence(Duration::from_millis(100), SAMPLE_RATE);
        if let Err(e) = self.recognizer.transcribe(&silence) {
            tracing::debug!(error = %e, "keyword model warm-up failed");
        }
    }

    /// Transcribe a wake-phase clip
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transcription`] if recognition fails
    pub fn transcribe(&self, clip: &AudioClip) -> Result<String> {
        self.recognizer.transcribe(clip).map(|t| t.trim().to_string())
    }

    /// Match a transcript against the keyword list
    #[must_use]
    pub fn find_match(&self, text: &str) -> Option<KeywordMatch> {
        self.matcher.find(text)
    }

    /// The keyword list
    #[must_use]
    pub const fn keywords(&self) -> &KeywordSet {
        self.matcher.keywords()
    }
}
