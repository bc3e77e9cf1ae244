use colloquy_llm::StreamSessionId;
use colloquy_storage::{self as storage, ChatId, MessageId, MessageRecord};

/// Who or what produced a transcript entry.
///
/// `Receiving` is the in-flight reply placeholder and never reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSource {
    User,
    Assistant,
    Error,
    Breaker,
    Receiving,
}

impl MessageSource {
    pub(crate) fn from_stored(source: storage::MessageSource) -> Self {
        match source {
            storage::MessageSource::User => Self::User,
            storage::MessageSource::Assistant => Self::Assistant,
            storage::MessageSource::Error => Self::Error,
            storage::MessageSource::Breaker => Self::Breaker,
        }
    }
}

/// Transcript identity: a store id once persisted, the generation's session id before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Stored(MessageId),
    Receiving(StreamSessionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub chat_id: ChatId,
    pub source: MessageSource,
    pub content: String,
}

impl Message {
    pub(crate) fn from_record(record: MessageRecord) -> Self {
        Self {
            key: MessageKey::Stored(record.id),
            chat_id: record.chat_id,
            source: MessageSource::from_stored(record.source),
            content: record.content,
        }
    }

    pub(crate) fn receiving(chat_id: ChatId, session: StreamSessionId) -> Self {
        Self {
            key: MessageKey::Receiving(session),
            chat_id,
            source: MessageSource::Receiving,
            content: String::new(),
        }
    }

    pub fn stored_id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Stored(id) => Some(id),
            MessageKey::Receiving(_) => None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.source, MessageSource::Receiving)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_records_keep_their_identity() {
        let message = Message::from_record(MessageRecord {
            id: MessageId::new(7),
            chat_id: ChatId::new(1),
            source: storage::MessageSource::Breaker,
            content: String::new(),
            created_at_unix_millis: 1,
        });

        assert_eq!(message.key, MessageKey::Stored(MessageId::new(7)));
        assert_eq!(message.source, MessageSource::Breaker);
        assert_eq!(message.stored_id(), Some(MessageId::new(7)));
    }

    #[test]
    fn placeholders_have_no_store_id() {
        let session = StreamSessionId::new();
        let placeholder = Message::receiving(ChatId::new(1), session);

        assert!(placeholder.is_receiving());
        assert_eq!(placeholder.key, MessageKey::Receiving(session));
        assert_eq!(placeholder.stored_id(), None);
    }
}
