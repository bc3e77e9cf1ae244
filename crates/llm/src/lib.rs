use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{ChatModel, DEFAULT_OPENAI_MODEL};
pub use provider::{
    ChatStream, DeltaStream, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamEventMapped, StreamRequest,
    StreamSessionId, make_event_stream,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigChatStream};

/// Resolves the configured provider id to a stream implementation; blank means OpenAI.
pub fn create_chat_stream(provider_id: &str) -> ProviderResult<Arc<dyn ChatStream>> {
    match provider_id.trim() {
        "" | "openai" | "rig-openai" => Ok(Arc::new(RigChatStream::new())),
        other => Err(ProviderError::UnsupportedProvider {
            stage: "create-chat-stream",
            provider_id: other.to_string(),
        }),
    }
}
