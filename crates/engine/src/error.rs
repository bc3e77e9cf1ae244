use colloquy_storage::{ChatId, StorageError};
use snafu::Snafu;

use super::chat::ValidationError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("invalid chat metadata: {source}"))]
    Validation {
        stage: &'static str,
        source: ValidationError,
    },
    #[snafu(display("store operation failed at {stage}: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("chat {chat_id} was not found"))]
    ChatNotFound {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("conversation engine for chat {chat_id} is closed"))]
    EngineClosed {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("engine invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
}

impl EngineError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Validation { stage, .. }
            | Self::Store { stage, .. }
            | Self::ChatNotFound { stage, .. }
            | Self::EngineClosed { stage, .. }
            | Self::InvariantViolation { stage, .. } => stage,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
