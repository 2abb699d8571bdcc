//! Content classifier seam
//!
//! Reflection text can be screened by an external quality model before a
//! reflection bonus is paid. The ledger only sees the verdict.

use crate::error::LedgerError;

/// Verdict from a content classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub approved: bool,
    pub reason: Option<String>,
}

impl Classification {
    pub fn approved() -> Self {
        Self { approved: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// Screens submitted text. Implementations must be safe to call from many threads.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Classification, LedgerError>;
}

/// Approves everything; used when no quality model is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveAll;

impl ContentClassifier for ApproveAll {
    fn classify(&self, _text: &str) -> Result<Classification, LedgerError> {
        Ok(Classification::approved())
    }
}

/// Offline stand-in for a quality model: requires a minimum number of
/// distinct words
#[derive(Debug, Clone, Copy)]
pub struct MinimumWordsClassifier {
    pub min_distinct_words: usize,
}

impl ContentClassifier for MinimumWordsClassifier {
    fn classify(&self, text: &str) -> Result<Classification, LedgerError> {
        let mut words: Vec<String> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        words.sort();
        words.dedup();

        if words.len() >= self.min_distinct_words {
            Ok(Classification::approved())
        } else {
            Ok(Classification::rejected(format!(
                "needs at least {} distinct words, found {}",
                self.min_distinct_words,
                words.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approve_all() {
        assert!(ApproveAll.classify("").unwrap().approved);
    }

    #[test]
    fn test_minimum_words_counts_distinct_words() {
        let classifier = MinimumWordsClassifier { min_distinct_words: 4 };
        let repeated = classifier.classify("good good good good good").unwrap();
        assert!(!repeated.approved);
        assert!(repeated.reason.unwrap().contains("found 1"));

        let varied = classifier
            .classify("I helped my neighbour carry groceries.")
            .unwrap();
        assert!(varied.approved);
    }
}
