use crate::config::ClassifierConfig;
use fleet_core::{FleetError, FleetResult};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static YEAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b20[2-9][0-9]\b").ok());

static RECENCY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(latest|recent|recently|current|currently|today|now|news|this (week|month|year)|who is|who was|president|ceo|founder|elected|released)\b",
    )
    .ok()
});

/// Fast-path gate in front of the full engine.
///
/// Pure and deterministic: a message either gets a single direct agent call
/// (`true`) or goes through routing and the workflow graph (`false`).
#[derive(Debug, Clone)]
pub struct Classifier {
    max_length: usize,
    acknowledgments: HashSet<String>,
    complexity: Vec<Regex>,
}

impl Classifier {
    /// Compile the configured patterns. A bad regex is a configuration error.
    pub fn new(config: &ClassifierConfig) -> FleetResult<Self> {
        let complexity = config
            .complexity_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    FleetError::Configuration(format!("Invalid complexity pattern '{p}': {e}"))
                })
            })
            .collect::<FleetResult<Vec<_>>>()?;
        Ok(Self {
            max_length: config.max_length,
            acknowledgments: config
                .acknowledgments
                .iter()
                .map(|a| normalize(a))
                .collect(),
            complexity,
        })
    }

    /// Whether `message` can be answered on the fast path.
    pub fn classify(&self, message: &str) -> bool {
        if self.acknowledgments.contains(&normalize(message)) {
            return true;
        }
        if message.chars().count() > self.max_length || self.is_complex(message) {
            return false;
        }
        terminator_count(message) <= 1
    }

    fn is_complex(&self, text: &str) -> bool {
        self.complexity.iter().any(|re| re.is_match(text)) || is_time_sensitive(text)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        let config = ClassifierConfig::default();
        Self::new(&config).unwrap_or_else(|_| Self {
            max_length: config.max_length,
            acknowledgments: HashSet::new(),
            complexity: Vec::new(),
        })
    }
}

/// A year from 2020–2099 alongside recency, news, or person-identity wording.
///
/// Such questions need fresh information and never qualify as simple.
pub fn is_time_sensitive(text: &str) -> bool {
    let matches = |re: &Option<Regex>| re.as_ref().is_some_and(|re| re.is_match(text));
    matches(&YEAR) && matches(&RECENCY)
}

/// Trim, lower-case, drop punctuation, and collapse whitespace.
pub fn normalize(message: &str) -> String {
    message
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn terminator_count(message: &str) -> usize {
    message
        .chars()
        .filter(|c| matches!(c, '.' | '!' | '?'))
        .count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledgments_take_fast_path() {
        let c = Classifier::default();
        for msg in ["ok", "  OK!! ", "Thanks.", "thank   you", "continue..."] {
            assert!(c.classify(msg), "{msg:?} should be fast path");
        }
    }

    #[test]
    fn test_long_messages_are_not_fast_path() {
        let c = Classifier::default();
        let long = "a".repeat(101);
        assert!(!c.classify(&long));
        assert!(c.classify(&"a".repeat(100)));
    }

    #[test]
    fn test_complexity_patterns() {
        let c = Classifier::default();
        assert!(!c.classify("Debug my parser"));
        assert!(!c.classify("First fetch the data, then plot it"));
        assert!(!c.classify("Analyze this log"));
        assert!(c.classify("What is Rust?"));
    }

    #[test]
    fn test_sentence_count() {
        let c = Classifier::default();
        assert!(c.classify("Hello there. How are you"));
        assert!(!c.classify("Hello. How are you? Fine!"));
    }

    #[test]
    fn test_time_sensitive_questions() {
        assert!(is_time_sensitive("Who is the CEO of Acme in 2025?"));
        assert!(!is_time_sensitive("Who is the CEO of Acme?"));
        assert!(!is_time_sensitive("In 1999 what happened"));
        let c = Classifier::default();
        assert!(!c.classify("latest news 2024"));
        assert!(!c.classify("What happened today in 2031"));
        assert!(c.classify("Name a color"));
    }

    #[test]
    fn test_arbitrary_unicode_is_safe() {
        let c = Classifier::default();
        assert!(c.classify("¿Qué tal? 👍"));
        assert!(c.classify("ありがとう"));
        assert_eq!(normalize("  Ça   VA?! "), "ça va");
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let config = ClassifierConfig {
            complexity_patterns: vec!["[".into()],
            ..ClassifierConfig::default()
        };
        assert!(matches!(
            Classifier::new(&config),
            Err(FleetError::Configuration(_))
        ));
    }
}
