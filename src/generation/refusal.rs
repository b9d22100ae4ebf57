//! Heuristic refusal detection
//!
//! Some backends decline in prose instead of through an explicit signal.
//! Output containing any configured phrase (case-insensitive substring) is
//! treated exactly like an explicit refusal.

use anyhow::{Context, Result};
use regex::RegexSet;

/// Phrases used when the configuration does not supply its own list.
pub const DEFAULT_REFUSAL_PHRASES: &[&str] = &[
    "I cannot",
    "I can't",
    "I can not",
    "I'm unable",
    "I am unable",
    "I won't",
    "I will not",
    "I'm not able to",
    "I apologize",
    "I'm sorry",
    "against my guidelines",
    "not comfortable",
];

pub struct RefusalDetector {
    phrases: Vec<String>,
    set: RegexSet,
}

impl RefusalDetector {
    pub fn new<I, S>(phrases: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases: Vec<String> = phrases
            .into_iter()
            .map(|p| p.as_ref().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let patterns = phrases.iter().map(|p| format!("(?i){}", regex::escape(p)));
        let set = RegexSet::new(patterns).context("Failed to compile refusal phrases")?;
        Ok(Self { phrases, set })
    }

    /// First configured phrase found in `text`.
    pub fn detect(&self, text: &str) -> Option<&str> {
        self.set
            .matches(text)
            .iter()
            .next()
            .map(|idx| self.phrases[idx].as_str())
    }

    pub fn is_refusal(&self, text: &str) -> bool {
        self.set.is_match(text)
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl Default for RefusalDetector {
    fn default() -> Self {
        let phrases: Vec<String> = DEFAULT_REFUSAL_PHRASES.iter().map(|p| p.to_string()).collect();
        // Escaped literals always compile.
        let patterns = phrases.iter().map(|p| format!("(?i){}", regex::escape(p)));
        let set = RegexSet::new(patterns).unwrap_or_else(|_| RegexSet::empty());
        Self { phrases, set }
    }
}
