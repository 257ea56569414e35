//! Model engine interface.
//!
//! The daemon drives a local language model through this narrow interface:
//! chat templating, tokenization, batched evaluation, sampling and
//! detokenization. Loading the model is the constructor of the concrete
//! engine and freeing it is its `Drop`.

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::EngineConfig;
use thiserror::Error;

/// A vocabulary entry as understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub i32);

/// Errors reported by the model engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("failed to create context: {0}")]
    Context(String),

    #[error("failed to apply chat template: {0}")]
    Template(String),

    #[error("failed to tokenize prompt: {0}")]
    Tokenize(String),

    #[error("failed to evaluate batch: {0}")]
    Decode(String),

    #[error("failed to initialize sampler: {0}")]
    Sampler(String),

    #[error("failed to convert token {0:?} to text")]
    Detokenize(Token),
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Role name as chat templates expect it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message fed to the chat template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Resources for one inference context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
}

impl From<&EngineConfig> for ContextParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            context_size: config.context_size,
            batch_size: config.batch_size,
            threads: config.threads,
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Sampling policy for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    /// How many recent tokens the repetition penalty looks at.
    pub repeat_last_n: i32,
    pub seed: u32,
}

/// Low temperature, heavily truncated and repetition-penalized, so the
/// model settles on one command instead of exploring alternatives.
pub const COMMAND_SAMPLING: SamplingParams = SamplingParams {
    temperature: 0.2,
    top_p: 0.1,
    min_p: 0.05,
    repeat_penalty: 1.3,
    repeat_last_n: 64,
    seed: 0x5eed,
};

/// A loaded model.
///
/// Engines are not assumed to be reentrant: the daemon only ever calls one
/// from its single worker thread.
pub trait ModelEngine: Send {
    /// Human readable model description for logs.
    fn describe(&self) -> String;

    /// Create a fresh context with its own sampler.
    fn create_context(
        &self,
        params: &ContextParams,
        sampling: &SamplingParams,
    ) -> Result<Box<dyn EngineContext + '_>, EngineError>;

    /// Render a conversation with the model's chat template, leaving the
    /// assistant turn open.
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<String, EngineError>;

    fn token_to_text(&self, token: Token) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    /// True for the begin-of-sequence and end-of-sequence tokens.
    fn is_sequence_boundary(&self, token: Token) -> bool;
}

/// Mutable evaluation state for one generation round.
pub trait EngineContext {
    fn tokenize(&mut self, text: &str) -> Result<Vec<Token>, EngineError>;

    /// Evaluate `tokens` as one batch on sequence zero, continuing from
    /// the current position. Logits are kept only for the last token when
    /// `logits_last` is set.
    fn evaluate(&mut self, tokens: &[Token], logits_last: bool) -> Result<(), EngineError>;

    /// Sample the next token from the last logits and record it in the
    /// sampler's repetition history.
    fn sample_next(&mut self) -> Result<Token, EngineError>;
}
