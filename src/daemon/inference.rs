//! Per-request inference.
//!
//! A request runs one generation round and, when the answer came back
//! without a code fence, exactly one more round asking the model to
//! reformat its own answer. Every round renders the chat template,
//! tokenizes, evaluates the whole prompt as one batch and then samples
//! token by token, streaming each piece to the client as soon as it is
//! decoded.

use crate::daemon::engine::{
    ChatTurn, ContextParams, EngineContext, EngineError, ModelEngine, SamplingParams, Token,
};
use crate::daemon::metrics::Metrics;
use crate::daemon::prompts::REFORMAT_INSTRUCTION;
use std::io::Write;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on sampled tokens per round. Commands are short.
pub const MAX_TOKENS: usize = 256;

const CODE_FENCE: &[u8] = b"```";

/// Request-scoped failures. The daemon keeps serving after any of these.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("prompt formatting failed: {0}")]
    Format(#[source] EngineError),

    #[error("context creation failed: {0}")]
    Context(#[source] EngineError),

    #[error("tokenization failed: {0}")]
    Tokenize(#[source] EngineError),

    #[error("prompt evaluation failed: {0}")]
    Evaluate(#[source] EngineError),
}

/// State of one generation round.
#[derive(Debug, Default)]
pub struct InferenceSession {
    pub formatted_prompt: String,
    pub tokens: Vec<Token>,
    pub response: Vec<u8>,
    pub saw_newline: bool,
    pub saw_code_fence: bool,
    /// The client stopped reading; nothing more can be delivered.
    pub peer_closed: bool,
}

impl InferenceSession {
    /// Record a decoded piece that was streamed to the client.
    fn append(&mut self, piece: &[u8]) {
        if piece.contains(&b'\n') {
            self.saw_newline = true;
        }
        // A fence may straddle token boundaries, so look back two bytes.
        let lookback = self.response.len().saturating_sub(CODE_FENCE.len() - 1);
        self.response.extend_from_slice(piece);
        if !self.saw_code_fence {
            self.saw_code_fence = self.response[lookback..]
                .windows(CODE_FENCE.len())
                .any(|w| w == CODE_FENCE);
        }
    }

    /// The streamed answer, lossily decoded.
    pub fn response_text(&self) -> String {
        String::from_utf8_lossy(&self.response).into_owned()
    }
}

/// What a completed request produced.
#[derive(Debug)]
pub struct Completion {
    /// One session per round: 1, or 2 when a reformat was needed.
    pub rounds: Vec<InferenceSession>,
}

impl Completion {
    /// Whether a reformat round ran.
    pub fn retried(&self) -> bool {
        self.rounds.len() > 1
    }
}

/// Turns prompts into streamed answers using one loaded engine.
pub struct Pipeline<'e> {
    engine: &'e dyn ModelEngine,
    context_params: ContextParams,
    sampling: SamplingParams,
    system_prompt: &'e str,
}

impl<'e> Pipeline<'e> {
    /// Bind an engine, its parameters and the system instruction.
    pub fn new(
        engine: &'e dyn ModelEngine,
        context_params: ContextParams,
        sampling: SamplingParams,
        system_prompt: &'e str,
    ) -> Self {
        Self {
            engine,
            context_params,
            sampling,
            system_prompt,
        }
    }

    /// Answer `prompt`, streaming generated bytes into `out`.
    pub fn run<W: Write + ?Sized>(
        &self,
        prompt: &str,
        out: &mut W,
        metrics: &mut Metrics,
    ) -> Result<Completion, InferenceError> {
        let mut turns = vec![ChatTurn::system(self.system_prompt), ChatTurn::user(prompt)];

        let first = self.round(&turns, out, metrics)?;
        debug!(response = %first.response_text(), "First round complete");

        if first.saw_code_fence || first.peer_closed {
            return Ok(Completion {
                rounds: vec![first],
            });
        }

        debug!("Response has no code fence, requesting a reformat");
        turns.push(ChatTurn::assistant(first.response_text()));
        turns.push(ChatTurn::user(REFORMAT_INSTRUCTION));

        let second = self.round(&turns, out, metrics)?;
        debug!(response = %second.response_text(), "Reformat round complete");

        Ok(Completion {
            rounds: vec![first, second],
        })
    }

    fn round<W: Write + ?Sized>(
        &self,
        turns: &[ChatTurn],
        out: &mut W,
        metrics: &mut Metrics,
    ) -> Result<InferenceSession, InferenceError> {
        let started = Instant::now();
        let mut session = InferenceSession::default();

        session.formatted_prompt = self
            .engine
            .apply_chat_template(turns)
            .map_err(InferenceError::Format)?;
        debug!(prompt = %session.formatted_prompt, "Formatted prompt");

        let mut ctx = self
            .engine
            .create_context(&self.context_params, &self.sampling)
            .map_err(InferenceError::Context)?;

        session.tokens = ctx
            .tokenize(&session.formatted_prompt)
            .map_err(InferenceError::Tokenize)?;
        if session.tokens.is_empty() {
            return Err(InferenceError::Tokenize(EngineError::Tokenize(
                "prompt produced no tokens".to_string(),
            )));
        }
        debug!(tokens = session.tokens.len(), "Tokenized prompt");

        ctx.evaluate(&session.tokens, true)
            .map_err(InferenceError::Evaluate)?;
        metrics.on_prompt_eval(session.tokens.len(), started.elapsed());

        self.sample_loop(ctx.as_mut(), &mut session, out, metrics);
        Ok(session)
    }

    fn sample_loop<W: Write + ?Sized>(
        &self,
        ctx: &mut dyn EngineContext,
        session: &mut InferenceSession,
        out: &mut W,
        metrics: &mut Metrics,
    ) {
        for _ in 0..MAX_TOKENS {
            let started = Instant::now();

            let token = match ctx.sample_next() {
                Ok(token) => token,
                Err(e) => {
                    warn!("Sampling failed: {}", e);
                    break;
                }
            };

            if self.engine.is_end_of_generation(token)
                || (session.saw_newline && self.engine.is_sequence_boundary(token))
            {
                if write_chunk(out, b"\n").is_err() {
                    session.peer_closed = true;
                }
                break;
            }

            let piece = match self.engine.token_to_text(token) {
                Ok(piece) => piece,
                Err(e) => {
                    warn!("{}", e);
                    break;
                }
            };

            if let Err(e) = write_chunk(out, &piece) {
                debug!("Client went away mid-stream: {}", e);
                session.peer_closed = true;
                break;
            }
            session.append(&piece);

            if let Err(e) = ctx.evaluate(&[token], true) {
                warn!("Token evaluation failed: {}", e);
                break;
            }
            metrics.on_token_generated(started.elapsed());
        }
    }
}

fn write_chunk<W: Write + ?Sized>(out: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    out.write_all(bytes)?;
    out.flush()
}
