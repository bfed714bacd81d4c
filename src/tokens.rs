//! Token counting collaborator.
//!
//! The pipeline only needs `count_tokens(model, text) -> usize`; the BPE itself is
//! provided by `tiktoken-rs`. Counts are informational (usage accounting),
//! so an unknown model falls back to `cl100k_base` rather than failing.

use tiktoken_rs::{tokenizer, CoreBPE};

pub trait TokenCounter: Send + Sync {
    /// Tokens in `text` under the encoding `model` uses.
    fn count_tokens(&self, model: &str, text: &str) -> usize;
}

/// BPE token counter backed by process-wide tiktoken singletons.
///
/// The encoding is picked per call from the model name; models tiktoken does
/// not know are counted with `fallback`.
pub struct TiktokenCounter {
    fallback: &'static CoreBPE,
}

impl TiktokenCounter {
    pub fn with_fallback(fallback: &'static CoreBPE) -> Self {
        Self { fallback }
    }

    pub fn cl100k() -> Self {
        Self::with_fallback(tiktoken_rs::cl100k_base_singleton())
    }

    fn bpe(&self, model: &str) -> &'static CoreBPE {
        bpe_for_model(model).unwrap_or(self.fallback)
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::cl100k()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, model: &str, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe(model).encode_with_special_tokens(text).len()
    }
}

/// Cheap approximation: one token per whitespace-separated word, any model.
/// Used in tests and when exact counts are not worth the BPE cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count_tokens(&self, _model: &str, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let bpe = match tokenizer::get_tokenizer(model)? {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    };
    Some(bpe)
}
