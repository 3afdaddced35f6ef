//! Model output parsing and validation.

use serde::Serialize;

use super::clarification::{Clarification, ClarificationDetector, PatternClarificationDetector};

/// What the parsed output must satisfy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseSpec<'a> {
    pub schema: Option<&'a serde_json::Value>,
    pub required_fields: &'a [String],
    /// Run clarification detection before parsing.
    pub check_clarification: bool,
}

/// Parse, validation and clarification results for one raw response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
}

impl ParseOutcome {
    pub fn is_valid(&self) -> bool {
        self.clarification.is_none()
            && self.parsed.is_some()
            && self.parse_error.is_none()
            && self.validation_errors.is_empty()
    }

    /// Parse and validation messages, parse error first.
    pub fn errors(&self) -> Vec<String> {
        self.parse_error
            .iter()
            .cloned()
            .chain(self.validation_errors.iter().cloned())
            .collect()
    }

    /// Report persisted to the ledger; omits the parsed payload.
    pub fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "valid": self.is_valid(),
            "parse_error": self.parse_error,
            "validation_errors": self.validation_errors,
            "clarification": self.clarification,
        })
    }
}

/// Turns raw model text into a validated JSON value.
pub trait OutputParser: Send + Sync {
    fn parse(&self, raw: &str, spec: &ParseSpec<'_>) -> ParseOutcome;
}

/// JSON parser with fenced-block extraction, required fields and JSON Schema.
#[derive(Debug, Clone, Default)]
pub struct JsonOutputParser<D: ClarificationDetector = PatternClarificationDetector> {
    detector: D,
}

impl JsonOutputParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: ClarificationDetector> JsonOutputParser<D> {
    pub fn with_detector(detector: D) -> Self {
        Self { detector }
    }

    /// Strip a surrounding markdown code fence, if any.
    fn strip_fence(raw: &str) -> &str {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix("```") else {
            return trimmed;
        };
        // Drop the info string (e.g. `json`) on the opening fence line.
        let body = rest.split_once('\n').map_or("", |(_, body)| body);
        body.trim_end().strip_suffix("```").unwrap_or(body).trim()
    }

    fn extract_json(raw: &str) -> Result<serde_json::Value, String> {
        let candidate = Self::strip_fence(raw);
        if let Ok(value) = serde_json::from_str(candidate) {
            return Ok(value);
        }

        // Fall back to the outermost object or array embedded in prose.
        let start = candidate.find(['{', '[']);
        let end = candidate.rfind(['}', ']']);
        match (start, end) {
            (Some(s), Some(e)) if e > s => serde_json::from_str(&candidate[s..=e])
                .map_err(|err| format!("output is not valid JSON: {err}")),
            _ => Err("output does not contain a JSON value".to_string()),
        }
    }

    fn validate(value: &serde_json::Value, spec: &ParseSpec<'_>) -> Vec<String> {
        let mut errors = Vec::new();

        if !spec.required_fields.is_empty() {
            match value.as_object() {
                Some(obj) => errors.extend(
                    spec.required_fields
                        .iter()
                        .filter(|f| obj.get(f.as_str()).is_none_or(|v| v.is_null()))
                        .map(|f| format!("missing required field: {f}")),
                ),
                None => errors.push("output must be a JSON object".to_string()),
            }
        }

        if let Some(schema) = spec.schema {
            match jsonschema::validator_for(schema) {
                Ok(validator) => errors.extend(
                    validator
                        .iter_errors(value)
                        .map(|e| format!("schema violation: {e}")),
                ),
                Err(e) => errors.push(format!("invalid schema: {e}")),
            }
        }
        errors
    }
}

impl<D: ClarificationDetector> OutputParser for JsonOutputParser<D> {
    fn parse(&self, raw: &str, spec: &ParseSpec<'_>) -> ParseOutcome {
        if spec.check_clarification
            && let Some(clarification) = self.detector.detect(raw)
        {
            return ParseOutcome {
                clarification: Some(clarification),
                ..ParseOutcome::default()
            };
        }

        match Self::extract_json(raw) {
            Ok(value) => ParseOutcome {
                validation_errors: Self::validate(&value, spec),
                parsed: Some(value),
                ..ParseOutcome::default()
            },
            Err(parse_error) => ParseOutcome {
                parse_error: Some(parse_error),
                ..ParseOutcome::default()
            },
        }
    }
}
