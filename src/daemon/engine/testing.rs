//! Deterministic engine for unit tests.
//!
//! Each call to `create_context` consumes the next scripted round; sampling
//! walks through that round's pieces and then reports end of generation.

use super::{ChatTurn, ContextParams, EngineContext, EngineError, ModelEngine, SamplingParams, Token};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const BOS: Token = Token(1);
pub const EOG: Token = Token(2);
const FAIL: Token = Token(3);
const FIRST_PIECE: i32 = 10;

/// Marker pieces that map to special tokens instead of text.
pub const BOS_PIECE: &str = "<bos>";
pub const EOG_PIECE: &str = "<eog>";
/// Leading a round, makes that round's prompt evaluation fail.
pub const FAIL_PIECE: &str = "<fail>";

#[derive(Debug, Default)]
pub struct EngineLog {
    pub templates: Vec<Vec<ChatTurn>>,
    pub contexts: usize,
    /// `(batch length, logits_last)` for every evaluate call.
    pub batches: Vec<(usize, bool)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub template: bool,
    pub tokenize: bool,
    pub context: bool,
    pub evaluate: bool,
}

pub struct ScriptedEngine {
    pieces: Vec<String>,
    rounds: Mutex<VecDeque<Vec<Token>>>,
    pub log: Arc<Mutex<EngineLog>>,
    pub faults: Faults,
}

impl ScriptedEngine {
    pub fn new(rounds: &[&[&str]]) -> Self {
        let mut pieces = Vec::new();
        let mut scripted = VecDeque::new();
        for round in rounds {
            let tokens = round
                .iter()
                .map(|piece| match *piece {
                    BOS_PIECE => BOS,
                    EOG_PIECE => EOG,
                    FAIL_PIECE => FAIL,
                    text => {
                        pieces.push(text.to_string());
                        Token(FIRST_PIECE + pieces.len() as i32 - 1)
                    }
                })
                .collect();
            scripted.push_back(tokens);
        }
        Self {
            pieces,
            rounds: Mutex::new(scripted),
            log: Arc::new(Mutex::new(EngineLog::default())),
            faults: Faults::default(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }
}

impl ModelEngine for ScriptedEngine {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn create_context(
        &self,
        _params: &ContextParams,
        _sampling: &SamplingParams,
    ) -> Result<Box<dyn EngineContext + '_>, EngineError> {
        if self.faults.context {
            return Err(EngineError::Context("scripted".into()));
        }
        self.log.lock().unwrap().contexts += 1;
        let mut script: VecDeque<Token> =
            self.rounds.lock().unwrap().pop_front().unwrap_or_default().into();
        let fail_evaluate = script.front() == Some(&FAIL);
        if fail_evaluate {
            script.pop_front();
        }
        Ok(Box::new(ScriptedContext {
            engine: self,
            script,
            fail_evaluate,
        }))
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<String, EngineError> {
        if self.faults.template {
            return Err(EngineError::Template("scripted".into()));
        }
        self.log.lock().unwrap().templates.push(turns.to_vec());
        Ok(turns
            .iter()
            .map(|t| format!("<{}>{}", t.role.as_str(), t.content))
            .collect())
    }

    fn token_to_text(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        let index = (token.0 - FIRST_PIECE) as usize;
        self.pieces
            .get(index)
            .map(|p| p.as_bytes().to_vec())
            .ok_or(EngineError::Detokenize(token))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOG
    }

    fn is_sequence_boundary(&self, token: Token) -> bool {
        token == BOS || token == EOG
    }
}

struct ScriptedContext<'a> {
    engine: &'a ScriptedEngine,
    script: VecDeque<Token>,
    fail_evaluate: bool,
}

impl EngineContext for ScriptedContext<'_> {
    fn tokenize(&mut self, text: &str) -> Result<Vec<Token>, EngineError> {
        if self.engine.faults.tokenize {
            return Err(EngineError::Tokenize("scripted".into()));
        }
        // One token per whitespace-separated word is plenty for the tests.
        Ok(text.split_whitespace().map(|_| Token(0)).collect())
    }

    fn evaluate(&mut self, tokens: &[Token], logits_last: bool) -> Result<(), EngineError> {
        if self.fail_evaluate || self.engine.faults.evaluate {
            return Err(EngineError::Decode("scripted".into()));
        }
        self.engine
            .log
            .lock()
            .unwrap()
            .batches
            .push((tokens.len(), logits_last));
        Ok(())
    }

    fn sample_next(&mut self) -> Result<Token, EngineError> {
        Ok(self.script.pop_front().unwrap_or(EOG))
    }
}
