//! OpenTelemetry GenAI semantic-convention attribute names.
//!
//! Fields declared in a span macro must be spelled inline
//! (`gen_ai.request.model = %model`); these constants cover span names and
//! the fields providers fill in later with `Span::record`.

/// Stop reason reported by the provider (e.g. "end_turn").
pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";

/// Provider-assigned request id, used to correlate with provider-side logs.
pub const GEN_AI_RESPONSE_ID: &str = "gen_ai.response.id";

pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";

pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

// --- Span names ---

/// A single HTTP call to a provider.
pub const SPAN_PROVIDER_CALL: &str = "gen_ai.provider_call";

// --- Provider name values ---

pub const PROVIDER_ANTHROPIC: &str = "anthropic";

pub const PROVIDER_SCRIPTED: &str = "scripted";

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    type Captured = Arc<Mutex<Vec<(String, String)>>>;

    struct Capture(Captured);

    struct FieldVisitor(Captured);

    impl Visit for FieldVisitor {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.lock().unwrap().push((field.name().to_string(), value.to_string()));
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.lock().unwrap().push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            self.0
                .lock()
                .unwrap()
                .push(("span".to_string(), attrs.metadata().name().to_string()));
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut FieldVisitor(Arc::clone(&self.0)));
        }
    }

    #[test]
    fn recorded_fields_match_declared_span_fields() {
        let captured: Captured = Arc::default();
        let subscriber = tracing_subscriber::registry().with(Capture(Arc::clone(&captured)));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::debug_span!(
                SPAN_PROVIDER_CALL,
                gen_ai.response.id = tracing::field::Empty,
                gen_ai.response.finish_reasons = tracing::field::Empty,
                gen_ai.usage.input_tokens = tracing::field::Empty,
                gen_ai.usage.output_tokens = tracing::field::Empty,
            );
            span.record(GEN_AI_RESPONSE_ID, "req_1");
            span.record(GEN_AI_RESPONSE_FINISH_REASONS, "end_turn");
            span.record(GEN_AI_USAGE_INPUT_TOKENS, 12u64);
            span.record(GEN_AI_USAGE_OUTPUT_TOKENS, 7u64);
        });

        let captured = captured.lock().unwrap().clone();
        let expect = |name: &str, value: &str| (name.to_string(), value.to_string());
        assert_eq!(captured[0], expect("span", "gen_ai.provider_call"));
        assert!(captured.contains(&expect("gen_ai.response.id", "req_1")));
        assert!(captured.contains(&expect("gen_ai.response.finish_reasons", "end_turn")));
        assert!(captured.contains(&expect("gen_ai.usage.input_tokens", "12")));
        assert!(captured.contains(&expect("gen_ai.usage.output_tokens", "7")));
    }
}
