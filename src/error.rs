//! error.rs
//!
//! Failures a caller may want to match on.
//!
//! Most functions in this crate return `anyhow::Result` and attach context as
//! they go. The variants here are the ones worth telling apart.

#[derive(thiserror::Error, Debug)]
pub enum LyrgenError {
    #[error("audio file contains no samples")]
    EmptyAudio,
    #[error("unsupported audio format: {0}")]
    UnsupportedAudio(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("seed text encoded to zero tokens")]
    EmptyPrompt,
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("model output is missing logits")]
    MissingLogits,
    #[error("prompt of {0} tokens does not fit the model context of {1}")]
    ContextOverflow(usize, usize),
}
