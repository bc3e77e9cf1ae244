use super::ids::{ChatId, MessageId};

/// Storage-local message source, intentionally decoupled from the engine's transcript enum.
///
/// There is no in-flight variant: reply placeholders never reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSource {
    User,
    Assistant,
    Error,
    Breaker,
}

impl MessageSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Error => "error",
            Self::Breaker => "breaker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "error" => Some(Self::Error),
            "breaker" => Some(Self::Breaker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub name: String,
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub context_size: u32,
    pub updated_at_unix_millis: u64,
}

/// Full set of user-editable chat columns, used for both insert and update.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFields {
    pub name: String,
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub context_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub source: MessageSource,
    pub content: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub source: MessageSource,
    pub content: String,
}

impl NewMessage {
    pub fn new(source: MessageSource, content: impl Into<String>) -> Self {
        Self {
            source,
            content: content.into(),
        }
    }
}

/// Outcome of a message insert: the row plus the chat recency it caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedMessage {
    pub message: MessageRecord,
    // Appends bump chat recency in the same transaction, so callers can re-sort without a read.
    pub chat_updated_at_unix_millis: u64,
}
