pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{AppendedMessage, ChatFields, ChatRecord, MessageRecord, MessageSource, NewMessage};

pub trait ChatStore: Send + Sync {
    fn create_chat(&self, input: ChatFields) -> StorageResult<ChatRecord>;
    /// Lists chats most recently updated first, ties broken by descending id.
    fn list_chats(&self) -> StorageResult<Vec<ChatRecord>>;
    fn get_chat(&self, chat_id: ChatId) -> StorageResult<Option<ChatRecord>>;
    fn update_chat(&self, chat_id: ChatId, input: ChatFields) -> StorageResult<ChatRecord>;
    /// Deletes the chat and, by cascade, all of its messages.
    fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    fn insert_message(&self, chat_id: ChatId, input: NewMessage)
    -> StorageResult<AppendedMessage>;
    fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
    ) -> StorageResult<MessageRecord>;
    /// Deletes every listed message or none of them.
    fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> StorageResult<u64>;
    fn clear_messages(&self, chat_id: ChatId) -> StorageResult<u64>;
    fn clear_messages_by_source(&self, chat_id: ChatId, source: MessageSource)
    -> StorageResult<u64>;
    /// Lists a chat's messages in chronological order.
    fn list_messages(&self, chat_id: ChatId) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: ChatStore + MessageStore {}

impl<T> Storage for T where T: ChatStore + MessageStore {}
