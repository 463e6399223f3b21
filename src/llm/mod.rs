pub mod openai;

pub use openai::{
    check_moderation, complete, generate_image, CompletionError, ImageError, ModelTier,
};

/// One conversation turn as supplied to the completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}
