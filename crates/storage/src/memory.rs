use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use snafu::OptionExt;

use super::error::{ConflictSnafu, MemoryLockPoisonedSnafu, NotFoundSnafu, StorageResult};
use super::ids::{ChatId, MessageId};
use super::sqlite::{next_timestamp, unix_timestamp_millis};
use super::types::{
    AppendedMessage, ChatFields, ChatRecord, MessageRecord, MessageSource, NewMessage,
};
use super::{ChatStore, MessageStore};

/// Process-local store with the same ordering and atomicity rules as [`SqliteStorage`].
///
/// [`SqliteStorage`]: super::SqliteStorage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_chat_id: i64,
    next_message_id: i64,
    latest_timestamp: Option<i64>,
    chats: BTreeMap<ChatId, ChatRecord>,
    messages: BTreeMap<ChatId, Vec<MessageRecord>>,
}

impl MemoryState {
    fn allocate_timestamp(&mut self) -> i64 {
        let now = next_timestamp(unix_timestamp_millis(), self.latest_timestamp);
        self.latest_timestamp = Some(now);
        now
    }

    fn chat_mut(&mut self, chat_id: ChatId, stage: &'static str) -> StorageResult<&mut ChatRecord> {
        self.chats.get_mut(&chat_id).context(NotFoundSnafu {
            stage,
            entity: "chat",
            id: chat_id.to_string(),
        })
    }

    fn messages_mut(
        &mut self,
        chat_id: ChatId,
        stage: &'static str,
    ) -> StorageResult<&mut Vec<MessageRecord>> {
        self.messages.get_mut(&chat_id).context(NotFoundSnafu {
            stage,
            entity: "chat",
            id: chat_id.to_string(),
        })
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .ok()
            .context(MemoryLockPoisonedSnafu { stage })
    }
}

impl ChatStore for MemoryStorage {
    fn create_chat(&self, input: ChatFields) -> StorageResult<ChatRecord> {
        let mut state = self.lock("memory-chat-create")?;
        state.next_chat_id += 1;
        let id = ChatId::new(state.next_chat_id);
        let updated_at = state.allocate_timestamp();

        let record = ChatRecord {
            id,
            name: input.name,
            model: input.model,
            prompt: input.prompt,
            temperature: input.temperature,
            context_size: input.context_size,
            updated_at_unix_millis: updated_at.max(0) as u64,
        };
        state.chats.insert(id, record.clone());
        state.messages.insert(id, Vec::new());
        Ok(record)
    }

    fn list_chats(&self) -> StorageResult<Vec<ChatRecord>> {
        let state = self.lock("memory-chat-list")?;
        let mut chats = state.chats.values().cloned().collect::<Vec<_>>();
        chats.sort_by(|left, right| {
            right
                .updated_at_unix_millis
                .cmp(&left.updated_at_unix_millis)
                .then(right.id.cmp(&left.id))
        });
        Ok(chats)
    }

    fn get_chat(&self, chat_id: ChatId) -> StorageResult<Option<ChatRecord>> {
        let state = self.lock("memory-chat-get")?;
        Ok(state.chats.get(&chat_id).cloned())
    }

    fn update_chat(&self, chat_id: ChatId, input: ChatFields) -> StorageResult<ChatRecord> {
        let mut state = self.lock("memory-chat-update")?;
        state.chat_mut(chat_id, "memory-chat-update-missing")?;
        let updated_at = state.allocate_timestamp();

        let chat = state.chat_mut(chat_id, "memory-chat-update-missing")?;
        chat.name = input.name;
        chat.model = input.model;
        chat.prompt = input.prompt;
        chat.temperature = input.temperature;
        chat.context_size = input.context_size;
        chat.updated_at_unix_millis = updated_at.max(0) as u64;
        Ok(chat.clone())
    }

    fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        let mut state = self.lock("memory-chat-delete")?;
        state
            .chats
            .remove(&chat_id)
            .context(NotFoundSnafu {
                stage: "memory-chat-delete-missing",
                entity: "chat",
                id: chat_id.to_string(),
            })?;
        state.messages.remove(&chat_id);
        Ok(())
    }
}

impl MessageStore for MemoryStorage {
    fn insert_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<AppendedMessage> {
        let mut state = self.lock("memory-message-insert")?;
        state.chat_mut(chat_id, "memory-message-insert-ensure-chat")?;

        state.next_message_id += 1;
        let id = MessageId::new(state.next_message_id);
        let created_at = state.allocate_timestamp().max(0) as u64;

        state
            .chat_mut(chat_id, "memory-message-insert-touch-chat")?
            .updated_at_unix_millis = created_at;

        let message = MessageRecord {
            id,
            chat_id,
            source: input.source,
            content: input.content,
            created_at_unix_millis: created_at,
        };
        state
            .messages_mut(chat_id, "memory-message-insert-apply")?
            .push(message.clone());

        Ok(AppendedMessage {
            message,
            chat_updated_at_unix_millis: created_at,
        })
    }

    fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
    ) -> StorageResult<MessageRecord> {
        let mut state = self.lock("memory-message-update")?;
        let message = state
            .messages_mut(chat_id, "memory-message-update-chat")?
            .iter_mut()
            .find(|message| message.id == message_id)
            .context(NotFoundSnafu {
                stage: "memory-message-update-missing",
                entity: "message",
                id: message_id.to_string(),
            })?;
        message.content = content;
        Ok(message.clone())
    }

    fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> StorageResult<u64> {
        let mut state = self.lock("memory-message-delete")?;
        let messages = state.messages_mut(chat_id, "memory-message-delete-chat")?;

        let mut wanted = message_ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let matched = messages
            .iter()
            .filter(|message| wanted.binary_search(&message.id).is_ok())
            .count();
        if matched != wanted.len() {
            return ConflictSnafu {
                stage: "memory-message-delete-partial",
                entity: "message",
                details: format!(
                    "expected to delete {} messages from chat {chat_id}, matched {matched}",
                    wanted.len()
                ),
            }
            .fail();
        }

        messages.retain(|message| wanted.binary_search(&message.id).is_err());
        Ok(matched as u64)
    }

    fn clear_messages(&self, chat_id: ChatId) -> StorageResult<u64> {
        let mut state = self.lock("memory-message-clear")?;
        let messages = state.messages_mut(chat_id, "memory-message-clear-chat")?;
        let removed = messages.len() as u64;
        messages.clear();
        Ok(removed)
    }

    fn clear_messages_by_source(
        &self,
        chat_id: ChatId,
        source: MessageSource,
    ) -> StorageResult<u64> {
        let mut state = self.lock("memory-message-clear-source")?;
        let messages = state.messages_mut(chat_id, "memory-message-clear-source-chat")?;
        let before = messages.len();
        messages.retain(|message| message.source != source);
        Ok((before - messages.len()) as u64)
    }

    fn list_messages(&self, chat_id: ChatId) -> StorageResult<Vec<MessageRecord>> {
        let mut state = self.lock("memory-message-list")?;
        Ok(state.messages_mut(chat_id, "memory-message-list-chat")?.clone())
    }
}
