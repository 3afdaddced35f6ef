//! Clarification detection over raw model output.
//!
//! Detection is a pluggable strategy: [`PatternClarificationDetector`] is a
//! phrase heuristic and will misfire on legitimate text that happens to end
//! with a question. Swap in another [`ClarificationDetector`] to tune it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Result of a positive detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    /// Questions to surface to the user, in the order they appeared.
    pub questions: Vec<String>,
    /// Which signals fired (phrase text or `trailing_question`).
    pub signals: Vec<String>,
}

/// Decides whether raw model output is asking for more information.
pub trait ClarificationDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<Clarification>;
}

static CLARIFICATION_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:need (?:some )?more (?:information|info|details|context)|could you (?:please )?(?:clarify|provide|specify|confirm|share)|before i can proceed|(?:is|are|remains?) unclear|it'?s unclear|please (?:clarify|specify|confirm))\b",
    )
    .expect("clarification phrase regex is valid")
});

static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*\u{2022}]|\d+[.)])\s*").expect("list marker regex is valid")
});

/// Phrase and trailing-question-mark heuristic.
#[derive(Debug, Clone, Default)]
pub struct PatternClarificationDetector;

impl PatternClarificationDetector {
    pub fn new() -> Self {
        Self
    }

    /// Question lines, with list markers stripped. Falls back to
    /// `?`-terminated sentences, then to the whole text.
    fn extract_questions(text: &str) -> Vec<String> {
        let lines: Vec<String> = text
            .lines()
            .map(|l| LIST_MARKER.replace(l, "").trim().to_string())
            .filter(|l| l.ends_with('?'))
            .collect();
        if !lines.is_empty() {
            return lines;
        }

        let mut sentences = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            current.push(ch);
            if matches!(ch, '.' | '!' | '?') {
                let sentence = current.trim().to_string();
                if ch == '?' && !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
        if !sentences.is_empty() {
            return sentences;
        }

        vec![text.trim().to_string()]
    }
}

impl ClarificationDetector for PatternClarificationDetector {
    fn detect(&self, text: &str) -> Option<Clarification> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        let mut signals: Vec<String> = CLARIFICATION_PHRASES
            .find_iter(trimmed)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        if trimmed.ends_with('?') {
            signals.push("trailing_question".to_string());
        }
        if signals.is_empty() {
            return None;
        }

        Some(Clarification {
            questions: Self::extract_questions(trimmed),
            signals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(text: &str) -> Option<Clarification> {
        PatternClarificationDetector::new().detect(text)
    }

    #[test]
    fn detects_need_more_information() {
        let c = detect("I need more information about the target users.").unwrap();
        assert_eq!(c.signals, vec!["need more information"]);
        assert_eq!(c.questions, vec!["I need more information about the target users."]);
    }

    #[test]
    fn detects_trailing_question_and_extracts_lines() {
        let text = "A few things first:\n1. Who is the primary persona?\n- What is the launch date?";
        let c = detect(text).unwrap();
        assert!(c.signals.contains(&"trailing_question".to_string()));
        assert_eq!(
            c.questions,
            vec!["Who is the primary persona?", "What is the launch date?"]
        );
    }

    #[test]
    fn detects_phrases_case_insensitively() {
        for text in [
            "Could you clarify the scope of the MVP.",
            "Before I can proceed, I must know the budget.",
            "The pricing model is unclear to me.",
            "Please confirm the target platform.",
        ] {
            assert!(detect(text).is_some(), "expected detection for: {text}");
        }
    }

    #[test]
    fn extracts_inline_question_sentences() {
        let c = detect("Could you provide details. Which region? Also the currency.").unwrap();
        assert_eq!(c.questions, vec!["Which region?"]);
    }

    #[test]
    fn plain_json_is_not_a_clarification() {
        assert!(detect(r#"{"title": "PRD", "goals": ["ship"]}"#).is_none());
        assert!(detect("").is_none());
        assert!(detect("The document is complete.").is_none());
    }
}
