pub mod chat;
pub mod context_window;
pub mod engine;
pub mod error;
pub mod message;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use chat::{
    CONTEXT_SIZE_RANGE, Chat, ChatDraft, DEFAULT_CONTEXT_SIZE, DEFAULT_TEMPERATURE,
    TEMPERATURE_RANGE, ValidationError,
};
pub use context_window::ContextWindow;
pub use engine::{EngineDeps, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use message::{Message, MessageKey, MessageSource};
pub use registry::ChatRegistry;
pub use state::{
    AlertButton, AlertButtonRole, AlertDescriptor, ConfirmableAction, ConversationFlags,
    ConversationState, GenerationPhase, GenerationRejection, GenerationTransition,
};
