//! llama.cpp model engine.

use super::{
    ChatTurn, ContextParams, EngineContext, EngineError, ModelEngine, SamplingParams, Token,
};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Template used when the GGUF file does not carry one.
const FALLBACK_TEMPLATE: &str = "llama3";

/// A GGUF model loaded through llama.cpp.
pub struct LlamaEngine {
    // Declared before the backend so it is freed first.
    model: LlamaModel,
    template: LlamaChatTemplate,
    backend: LlamaBackend,
    path: PathBuf,
}

impl LlamaEngine {
    pub fn load(path: &Path, gpu_layers: u32) -> Result<Self, EngineError> {
        let backend = LlamaBackend::init().map_err(|e| EngineError::Load(e.to_string()))?;
        let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &params)
            .map_err(|e| EngineError::Load(e.to_string()))?;

        let template = match model.chat_template(None) {
            Ok(template) => template,
            Err(e) => {
                warn!("Model has no usable chat template ({}), using {}", e, FALLBACK_TEMPLATE);
                LlamaChatTemplate::new(FALLBACK_TEMPLATE)
                    .map_err(|e| EngineError::Template(e.to_string()))?
            }
        };

        debug!(
            vocab = model.n_vocab(),
            train_ctx = model.n_ctx_train(),
            "Model loaded from {}",
            path.display()
        );

        Ok(Self {
            model,
            template,
            backend,
            path: path.to_path_buf(),
        })
    }
}

impl ModelEngine for LlamaEngine {
    fn describe(&self) -> String {
        format!("llama.cpp model {}", self.path.display())
    }

    fn create_context(
        &self,
        params: &ContextParams,
        sampling: &SamplingParams,
    ) -> Result<Box<dyn EngineContext + '_>, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.context_size))
            .with_n_batch(params.batch_size)
            .with_n_threads(params.threads as i32)
            .with_n_threads_batch(params.threads as i32);
        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::Context(e.to_string()))?;

        let sampler = LlamaSampler::chain_simple([
            LlamaSampler::penalties(sampling.repeat_last_n, sampling.repeat_penalty, 0.0, 0.0),
            LlamaSampler::top_p(sampling.top_p, 1),
            LlamaSampler::min_p(sampling.min_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(sampling.seed),
        ]);

        Ok(Box::new(LlamaSession {
            model: &self.model,
            ctx,
            sampler,
            batch_size: params.batch_size.max(1) as usize,
            n_past: 0,
            last_logits: 0,
        }))
    }

    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<String, EngineError> {
        let messages = turns
            .iter()
            .map(|turn| LlamaChatMessage::new(turn.role.as_str().to_string(), turn.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Template(e.to_string()))?;

        self.model
            .apply_chat_template(&self.template, &messages, true)
            .map_err(|e| EngineError::Template(e.to_string()))
    }

    fn token_to_text(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token.0), Special::Tokenize)
            .map_err(|_| EngineError::Detokenize(token))
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken::new(token.0))
    }

    fn is_sequence_boundary(&self, token: Token) -> bool {
        let token = LlamaToken::new(token.0);
        token == self.model.token_bos() || token == self.model.token_eos()
    }
}

/// One generation round: a context, its sampler and the decode position.
struct LlamaSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    batch_size: usize,
    n_past: i32,
    /// Batch index of the token whose logits the sampler reads.
    last_logits: i32,
}

impl EngineContext for LlamaSession<'_> {
    fn tokenize(&mut self, text: &str) -> Result<Vec<Token>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| Token(t.0)).collect())
    }

    fn evaluate(&mut self, tokens: &[Token], logits_last: bool) -> Result<(), EngineError> {
        let n_ctx = self.ctx.n_ctx() as usize;
        if self.n_past as usize + tokens.len() > n_ctx {
            return Err(EngineError::Decode(format!(
                "context full: {} + {} tokens exceeds {}",
                self.n_past,
                tokens.len(),
                n_ctx
            )));
        }

        let chunks = tokens.chunks(self.batch_size);
        let count = chunks.len();
        for (chunk_index, chunk) in chunks.enumerate() {
            let final_chunk = chunk_index + 1 == count;
            let mut batch = LlamaBatch::new(chunk.len(), 1);
            for (i, token) in chunk.iter().enumerate() {
                let logits = logits_last && final_chunk && i + 1 == chunk.len();
                batch
                    .add(LlamaToken::new(token.0), self.n_past, &[0], logits)
                    .map_err(|e| EngineError::Decode(e.to_string()))?;
                self.n_past += 1;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
            if final_chunk {
                self.last_logits = chunk.len() as i32 - 1;
            }
        }
        Ok(())
    }

    fn sample_next(&mut self) -> Result<Token, EngineError> {
        // Sampling also records the token in the repetition history.
        let token = self.sampler.sample(&self.ctx, self.last_logits);
        Ok(Token(token.0))
    }
}
