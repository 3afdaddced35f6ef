//! Prompt construction for step generation.

use docloom_types::execution::ClarificationAnswer;
use docloom_types::llm::Message;

/// Marker appended to an input document cut at the character limit.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// An input document reduced to what the prompt needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondensedInput {
    pub doc_type: String,
    pub title: String,
    pub content: String,
}

impl CondensedInput {
    /// Keep at most `max_chars` characters of `content`, marking the cut.
    pub fn condense(
        doc_type: impl Into<String>,
        title: impl Into<String>,
        content: &str,
        max_chars: usize,
    ) -> Self {
        let content = match content.char_indices().nth(max_chars) {
            Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &content[..cut]),
            None => content.to_string(),
        };
        Self {
            doc_type: doc_type.into(),
            title: title.into(),
            content,
        }
    }
}

/// Everything a prompt builder may draw on.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub role: &'a str,
    pub task: &'a str,
    pub output_type: &'a str,
    pub inputs: &'a [CondensedInput],
    pub context: Option<&'a serde_json::Value>,
    pub answers: &'a [ClarificationAnswer],
    pub schema: Option<&'a serde_json::Value>,
    /// Whether the model may answer with questions instead of output.
    pub allow_questions: bool,
}

#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub system: String,
    pub messages: Vec<Message>,
}

/// Builds the system prompt and messages for one generation.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, input: &PromptInput<'_>) -> BuiltPrompt;
}

/// Markdown-sectioned prompt asking for a single JSON result.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptBuilder;

impl TemplatePromptBuilder {
    pub fn new() -> Self {
        Self
    }

    fn system_prompt(input: &PromptInput<'_>) -> String {
        let mut system = format!(
            "You are a {role}. Produce the `{output}` document.\n\
             Respond with a single JSON value and nothing else.",
            role = input.role,
            output = input.output_type,
        );
        if let Some(schema) = input.schema {
            system.push_str("\nThe JSON must conform to this schema:\n");
            system.push_str(&serde_json::to_string_pretty(schema).unwrap_or_default());
        }
        if input.allow_questions {
            system.push_str(
                "\nIf essential information is missing, reply only with the questions you need answered.",
            );
        } else {
            system.push_str("\nDo not ask questions. Make reasonable assumptions and state them in the output.");
        }
        system
    }

    fn user_prompt(input: &PromptInput<'_>) -> String {
        let mut user = format!("## Task\n{}\n", input.task);

        if !input.inputs.is_empty() {
            user.push_str("\n## Inputs\n");
            for doc in input.inputs {
                user.push_str(&format!("\n### {} ({})\n{}\n", doc.title, doc.doc_type, doc.content));
            }
        }

        if let Some(context) = input.context.filter(|c| !c.is_null()) {
            user.push_str("\n## Additional context\n");
            match context {
                serde_json::Value::String(s) => user.push_str(s),
                other => user.push_str(&serde_json::to_string_pretty(other).unwrap_or_default()),
            }
            user.push('\n');
        }

        if !input.answers.is_empty() {
            user.push_str("\n## Answers to your questions\n");
            for answer in input.answers {
                user.push_str(&format!("Q: {}\nA: {}\n", answer.question, answer.answer));
            }
        }
        user
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn build(&self, input: &PromptInput<'_>) -> BuiltPrompt {
        BuiltPrompt {
            system: Self::system_prompt(input),
            messages: vec![Message::user(Self::user_prompt(input))],
        }
    }
}
