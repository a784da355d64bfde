//! Binding to llama.cpp.
//!
//! This module mirrors the call surface of the native llama.cpp wrapper the
//! session drives (load, add message, start completion, step, stop, cancel).
//! Linking the C library is not wired up yet, so the model and context types
//! are stubs that simulate llama.cpp behavior: prompt rendering with a ChatML
//! template, context accounting and a deterministic word-by-word decode.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::inference::backend::{
    BackendError, GenerationParams, ModelBackend, ModelLoader, Role, Step, END_OF_GENERATION,
};

/// Longest message accepted into the context, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 8192;

/// Upper bound on the context size used on device.
pub const MAX_CONTEXT_SIZE: u32 = 2048;

/// Tokens held back from the prompt budget for the response.
const PROMPT_RESERVE: usize = 800;

/// Tokens held back from the decode budget.
const DECODE_RESERVE: usize = 300;

/// Messages kept when the prompt has to be trimmed (first message + last four).
const MESSAGES_TO_KEEP: usize = 5;

/// Chat format tokens that never reach the caller.
const FORMAT_TOKENS: &[&str] = &[
    "<|im_end|>",
    "<|im_start|>assistant",
    "<|im_start|>",
    "<|end|>",
    "<|assistant|>",
    "<|user|>",
    "<|system|>",
];

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking (problematic on mobile).
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens, capped at the model's training context.
    pub n_ctx: u32,

    /// Use flash attention.
    pub flash_attn: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: MAX_CONTEXT_SIZE,
            flash_attn: false,
        }
    }
}

/// Stub model handle.
///
/// In a real implementation, this would wrap `*mut llama_model`.
pub struct LlamaModel {
    /// Model file path.
    pub path: PathBuf,

    /// Vocabulary size.
    pub n_vocab: usize,

    /// Context length the model was trained with.
    pub n_ctx_train: u32,

    /// Model file size in bytes.
    pub file_size: u64,
}

/// Stub context handle.
///
/// In a real implementation, this would wrap `*mut llama_context`.
pub struct LlamaContext {
    /// Context size.
    pub n_ctx: u32,

    /// Current token position.
    pub pos: usize,
}

impl LlamaModel {
    /// Load a model from a GGUF file (stub).
    pub fn load(path: &Path, _params: ModelParams) -> Result<Self, BackendError> {
        if path.as_os_str().is_empty() || !path.is_file() {
            return Err(BackendError::InvalidPath(path.to_path_buf()));
        }

        let file_size = std::fs::metadata(path)
            .map_err(|e| BackendError::ModelLoadFailed(e.to_string()))?
            .len();
        if file_size == 0 {
            return Err(BackendError::ModelLoadFailed(format!(
                "{} is empty",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            n_vocab: 49152,
            n_ctx_train: 8192,
            file_size,
        })
    }

    /// Create a new context for this model (stub).
    pub fn new_context(&self, params: ContextParams) -> Result<LlamaContext, BackendError> {
        Ok(LlamaContext {
            n_ctx: params.n_ctx.min(self.n_ctx_train),
            pos: 0,
        })
    }

    /// Estimate the token count of `text` (stub: ~1 token per 4 bytes).
    pub fn count_tokens(&self, text: &str) -> usize {
        (text.len() / 4).max(1)
    }
}

impl LlamaContext {
    /// Process a batch of `n_tokens` tokens (stub).
    pub fn decode(&mut self, n_tokens: usize) -> Result<(), BackendError> {
        if n_tokens == 0 {
            return Err(BackendError::DecodeFailed("empty batch".to_string()));
        }
        self.pos += n_tokens;
        Ok(())
    }

    /// Clear the KV cache.
    pub fn kv_cache_clear(&mut self) {
        self.pos = 0;
    }
}

/// A message as the native context holds it.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Render `messages` with the ChatML template.
pub fn apply_chat_template(messages: &[ChatMessage], add_assistant: bool) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str("<|im_start|>");
        out.push_str(message.role.as_str());
        out.push('\n');
        out.push_str(&message.content);
        out.push_str("<|im_end|>\n");
    }
    if add_assistant {
        out.push_str("<|im_start|>assistant\n");
    }
    out
}

/// Strip chat format tokens and surrounding whitespace from a response.
pub fn clean_response(response: &str) -> String {
    let mut cleaned = response.to_string();
    for token in FORMAT_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    cleaned.trim().to_string()
}

fn is_format_piece(piece: &str) -> bool {
    piece == "assistant" || piece.contains("<|im_") || FORMAT_TOKENS.contains(&piece)
}

/// A loaded llama.cpp instance.
pub struct LlamaBackend {
    model: LlamaModel,
    ctx: LlamaContext,
    store_chats: bool,
    messages: Vec<ChatMessage>,

    /// Length of the rendered conversation already fed to the context.
    prev_len: usize,

    /// Tokens in the next batch to decode; zero when no completion is active.
    batch_tokens: usize,

    /// Pieces the simulated sampler will produce.
    pending: VecDeque<String>,

    /// Response accumulated by the current completion.
    response: String,
}

impl LlamaBackend {
    fn new(model: LlamaModel, ctx: LlamaContext, params: &GenerationParams) -> Self {
        Self {
            model,
            ctx,
            store_chats: params.store_chats,
            messages: Vec::new(),
            prev_len: 0,
            batch_tokens: 0,
            pending: VecDeque::new(),
            response: String::new(),
        }
    }

    /// Number of messages currently held in the context.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Content of the message at `index`, with its role.
    pub fn message(&self, index: usize) -> Option<(Role, &str)> {
        self.messages
            .get(index)
            .map(|m| (m.role, m.content.as_str()))
    }

    /// Context size in tokens.
    pub fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx
    }

    fn push_message(&mut self, role: Role, text: &str) {
        if text.is_empty() {
            warn!(role = %role, "Ignoring empty message");
            return;
        }

        let content = if text.chars().count() > MAX_MESSAGE_LENGTH {
            warn!(
                role = %role,
                chars = text.chars().count(),
                max = MAX_MESSAGE_LENGTH,
                "Message too long, truncating"
            );
            text.chars().take(MAX_MESSAGE_LENGTH).collect()
        } else {
            text.to_string()
        };

        self.messages.push(ChatMessage { role, content });
    }

    /// Drop old messages, keeping the first one and the most recent ones.
    fn trim_messages(&mut self) {
        if self.messages.len() > MESSAGES_TO_KEEP {
            let end = self.messages.len() - MESSAGES_TO_KEEP + 1;
            self.messages.drain(1..end);
        }
    }

    /// Recompute how much of the rendered conversation the context has seen.
    fn reset_prev_len(&mut self) {
        self.prev_len = apply_chat_template(&self.messages, false).len();
    }

    /// Script the reply the simulated sampler produces for `query`.
    fn script_reply(query: &str) -> VecDeque<String> {
        let reply = format!("You said: {query}");
        let mut pieces: VecDeque<String> =
            reply.split_inclusive(' ').map(str::to_string).collect();
        pieces.push_back("<|im_end|>".to_string());
        pieces
    }
}

impl ModelBackend for LlamaBackend {
    fn add_message(&mut self, role: Role, text: &str) -> Result<(), BackendError> {
        self.push_message(role, text);
        Ok(())
    }

    fn start_completion(&mut self, prompt: &str) -> Result<(), BackendError> {
        if prompt.is_empty() {
            return Err(BackendError::InvalidQuery("empty query".to_string()));
        }

        if !self.store_chats {
            self.prev_len = 0;
            self.messages.retain(|m| m.role == Role::System);
            self.ctx.kv_cache_clear();
        }
        self.push_message(Role::User, prompt);

        let max_prompt_tokens = (self.ctx.n_ctx as usize).saturating_sub(PROMPT_RESERVE);
        let mut formatted = apply_chat_template(&self.messages, true);
        let start = self.prev_len.min(formatted.len());
        let mut prompt_tokens = self.model.count_tokens(&formatted[start..]);

        if prompt_tokens > max_prompt_tokens {
            info!(
                prompt_tokens,
                max_prompt_tokens, "Context too long, truncating old messages"
            );
            self.trim_messages();
            formatted = apply_chat_template(&self.messages, true);
            self.prev_len = 0;
            self.ctx.kv_cache_clear();
            prompt_tokens = self.model.count_tokens(&formatted);
        }

        debug!(prompt_tokens, messages = self.messages.len(), "Prompt prepared");

        self.batch_tokens = prompt_tokens;
        self.response.clear();
        self.pending = Self::script_reply(prompt);
        Ok(())
    }

    fn step(&mut self) -> Result<Step, BackendError> {
        if self.batch_tokens == 0 {
            return Err(BackendError::DecodeFailed(
                "no completion in progress".to_string(),
            ));
        }

        let max = (self.ctx.n_ctx as usize).saturating_sub(DECODE_RESERVE);
        if self.ctx.pos + self.batch_tokens > max {
            return Err(BackendError::ContextExceeded {
                used: self.ctx.pos + self.batch_tokens,
                max,
            });
        }

        self.ctx.decode(self.batch_tokens)?;
        // The sampled token becomes the next single-token batch.
        self.batch_tokens = 1;

        let Some(piece) = self.pending.pop_front() else {
            return Ok(Step::from_raw(END_OF_GENERATION.to_string()));
        };

        if is_format_piece(&piece) {
            return Ok(Step::Piece(String::new()));
        }

        self.response.push_str(&piece);
        Ok(Step::Piece(piece))
    }

    fn stop_completion(&mut self) -> Result<(), BackendError> {
        let cleaned = clean_response(&self.response);
        if self.store_chats && !cleaned.is_empty() {
            self.push_message(Role::Assistant, &cleaned);
        }
        self.response.clear();
        self.pending.clear();
        self.batch_tokens = 0;
        self.reset_prev_len();
        Ok(())
    }

    fn cancel_completion(&mut self) -> Result<(), BackendError> {
        info!("Cancelling completion, discarding partial response");
        self.response.clear();
        self.pending.clear();
        self.batch_tokens = 0;
        self.reset_prev_len();
        Ok(())
    }
}

impl Drop for LlamaBackend {
    fn drop(&mut self) {
        debug!(path = %self.model.path.display(), "Releasing llama context and model");
    }
}

/// Loads [`LlamaBackend`] instances.
#[derive(Debug, Clone, Default)]
pub struct LlamaLoader {
    pub model_params: ModelParams,
    pub context_params: ContextParams,
}

impl LlamaLoader {
    pub fn new(context_params: ContextParams) -> Self {
        Self {
            model_params: ModelParams::default(),
            context_params,
        }
    }
}

/// Validate sampling parameters the way the native loader does.
pub fn validate_params(params: &GenerationParams) -> Result<(), BackendError> {
    if !(0.0..=1.0).contains(&params.min_p) {
        return Err(BackendError::InvalidParameter(format!(
            "min_p {} must be between 0.0 and 1.0",
            params.min_p
        )));
    }
    if !(0.0..=10.0).contains(&params.temperature) {
        return Err(BackendError::InvalidParameter(format!(
            "temperature {} must be between 0.0 and 10.0",
            params.temperature
        )));
    }
    Ok(())
}

impl ModelLoader for LlamaLoader {
    fn load(
        &self,
        path: &Path,
        params: &GenerationParams,
    ) -> Result<Box<dyn ModelBackend>, BackendError> {
        validate_params(params)?;

        info!(
            path = %path.display(),
            min_p = params.min_p,
            temperature = params.temperature,
            store_chats = params.store_chats,
            "Loading model"
        );

        let model = LlamaModel::load(path, self.model_params.clone())?;
        let ctx = model.new_context(self.context_params.clone())?;

        info!(
            n_vocab = model.n_vocab,
            n_ctx_train = model.n_ctx_train,
            n_ctx = ctx.n_ctx,
            file_size = model.file_size,
            "Model loaded"
        );

        Ok(Box::new(LlamaBackend::new(model, ctx, params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(b"GGUF stub weights").unwrap();
        file
    }

    fn load(path: &Path, params: GenerationParams) -> LlamaBackend {
        let model = LlamaModel::load(path, ModelParams::default()).unwrap();
        let ctx = model.new_context(ContextParams::default()).unwrap();
        LlamaBackend::new(model, ctx, &params)
    }

    fn drain(backend: &mut LlamaBackend) -> Vec<String> {
        let mut pieces = Vec::new();
        loop {
            match backend.step().unwrap() {
                Step::Piece(p) => pieces.push(p),
                Step::EndOfGeneration => break,
            }
        }
        pieces
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let err = LlamaLoader::default()
            .load(Path::new("/nonexistent/model.gguf"), &GenerationParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::InvalidPath(_)));
    }

    #[test]
    fn test_load_rejects_out_of_range_params() {
        let file = model_file();
        let params = GenerationParams {
            min_p: 1.5,
            ..Default::default()
        };
        let err = LlamaLoader::default().load(file.path(), &params).err().unwrap();
        assert!(matches!(err, BackendError::InvalidParameter(_)));

        let params = GenerationParams {
            temperature: -0.1,
            ..Default::default()
        };
        assert!(LlamaLoader::default().load(file.path(), &params).is_err());
    }

    #[test]
    fn test_context_capped_at_device_limit() {
        let file = model_file();
        let backend = load(file.path(), GenerationParams::default());
        assert_eq!(backend.n_ctx(), MAX_CONTEXT_SIZE);
    }

    #[test]
    fn test_completion_filters_format_tokens() {
        let file = model_file();
        let mut backend = load(file.path(), GenerationParams::default());

        backend.start_completion("hello there").unwrap();
        let pieces = drain(&mut backend);
        assert_eq!(pieces.concat(), "You said: hello there");
        assert_eq!(pieces.last().map(String::as_str), Some(""));

        backend.stop_completion().unwrap();
        assert_eq!(backend.message_count(), 2);
        assert_eq!(
            backend.message(1),
            Some((Role::Assistant, "You said: hello there"))
        );
    }

    #[test]
    fn test_cancel_discards_response() {
        let file = model_file();
        let mut backend = load(file.path(), GenerationParams::default());

        backend.start_completion("hi").unwrap();
        backend.step().unwrap();
        backend.cancel_completion().unwrap();

        assert_eq!(backend.message_count(), 1);
        assert_eq!(backend.message(0), Some((Role::User, "hi")));
        assert!(backend.step().is_err());
    }

    #[test]
    fn test_without_store_chats_only_system_prompt_survives() {
        let file = model_file();
        let params = GenerationParams {
            store_chats: false,
            ..Default::default()
        };
        let mut backend = load(file.path(), params);

        backend.add_message(Role::System, "be brief").unwrap();
        backend.start_completion("first").unwrap();
        drain(&mut backend);
        backend.stop_completion().unwrap();
        assert_eq!(backend.message_count(), 2);

        backend.start_completion("second").unwrap();
        assert_eq!(backend.message_count(), 2);
        assert_eq!(backend.message(0), Some((Role::System, "be brief")));
        assert_eq!(backend.message(1), Some((Role::User, "second")));
    }

    #[test]
    fn test_long_messages_truncated_and_empty_ignored() {
        let file = model_file();
        let mut backend = load(file.path(), GenerationParams::default());

        backend.add_message(Role::User, "").unwrap();
        assert_eq!(backend.message_count(), 0);

        let long = "é".repeat(MAX_MESSAGE_LENGTH + 10);
        backend.add_message(Role::User, &long).unwrap();
        let (_, content) = backend.message(0).unwrap();
        assert_eq!(content.chars().count(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_prompt_over_budget_trims_old_messages() {
        let file = model_file();
        let mut backend = load(file.path(), GenerationParams::default());

        backend.add_message(Role::System, "system prompt").unwrap();
        for i in 0..10 {
            backend.add_message(Role::User, &format!("{i} {}", "x".repeat(1000))).unwrap();
        }
        backend.start_completion("latest").unwrap();

        assert_eq!(backend.message_count(), MESSAGES_TO_KEEP);
        assert_eq!(backend.message(0), Some((Role::System, "system prompt")));
        assert_eq!(backend.message(4), Some((Role::User, "latest")));
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(clean_response("  <|im_start|>assistant hi <|im_end|>\n"), "hi");
    }
}
