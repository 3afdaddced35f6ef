//! Step execution: prompt building, output parsing, clarification detection
//! and the step state machine that ties them to a provider.

pub mod clarification;
pub mod executor;
pub mod parser;
pub mod prompt;

pub use clarification::{Clarification, ClarificationDetector, PatternClarificationDetector};
pub use executor::{
    Generation, GenerationOutcome, GenerationSettings, GenerationSpec, LedgerScope, StepError,
    StepExecutor, StepResult,
};
pub use parser::{JsonOutputParser, OutputParser, ParseOutcome, ParseSpec};
pub use prompt::{BuiltPrompt, CondensedInput, PromptBuilder, PromptInput, TemplatePromptBuilder};
