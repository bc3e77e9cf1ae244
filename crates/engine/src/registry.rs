use std::collections::HashMap;

use colloquy_storage::ChatId;
use snafu::{OptionExt, ResultExt};
use tokio::sync::Mutex;

use super::chat::{Chat, ChatDraft};
use super::engine::{EngineDeps, EngineHandle};
use super::error::{ChatNotFoundSnafu, EngineResult, StoreSnafu, ValidationSnafu};
use super::message::Message;

struct RegistryInner {
    chats: Vec<Chat>,
    engines: HashMap<ChatId, EngineHandle>,
    current: Option<ChatId>,
}

impl RegistryInner {
    /// Folds in live metadata from loaded engines, then restores recency order.
    fn refresh(&mut self) {
        for chat in &mut self.chats {
            if let Some(engine) = self.engines.get(&chat.id) {
                *chat = engine.chat();
            }
        }
        Chat::sort_by_recency(&mut self.chats);
    }
}

/// Owns the chat list and one lazily spawned engine per opened chat.
pub struct ChatRegistry {
    deps: EngineDeps,
    inner: Mutex<RegistryInner>,
}

impl ChatRegistry {
    /// Loads the chat list and marks the most recent chat current without loading its messages.
    pub async fn open(deps: EngineDeps) -> EngineResult<Self> {
        let mut chats = deps
            .storage
            .list_chats()
            .context(StoreSnafu {
                stage: "registry-open-list-chats",
            })?
            .into_iter()
            .map(Chat::from_record)
            .collect::<Vec<_>>();
        Chat::sort_by_recency(&mut chats);

        let current = chats.first().map(|chat| chat.id);
        tracing::debug!(chat_count = chats.len(), current = ?current, "opened chat registry");

        Ok(Self {
            deps,
            inner: Mutex::new(RegistryInner {
                chats,
                engines: HashMap::new(),
                current,
            }),
        })
    }

    pub async fn list_chats(&self) -> Vec<Chat> {
        let mut inner = self.inner.lock().await;
        inner.refresh();
        inner.chats.clone()
    }

    pub async fn current_chat(&self) -> Option<Chat> {
        let mut inner = self.inner.lock().await;
        inner.refresh();
        let current = inner.current?;
        inner.chats.iter().find(|chat| chat.id == current).cloned()
    }

    pub async fn engine(&self, chat_id: ChatId) -> Option<EngineHandle> {
        self.inner.lock().await.engines.get(&chat_id).cloned()
    }

    /// Makes `chat_id` current, loading its transcript on first selection only.
    pub async fn select_chat(&self, chat_id: ChatId) -> EngineResult<EngineHandle> {
        let mut inner = self.inner.lock().await;

        if let Some(engine) = inner.engines.get(&chat_id).cloned() {
            inner.current = Some(chat_id);
            return Ok(engine);
        }

        let chat = inner
            .chats
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned()
            .context(ChatNotFoundSnafu {
                stage: "registry-select-chat",
                chat_id,
            })?;

        let transcript = self
            .deps
            .storage
            .list_messages(chat_id)
            .context(StoreSnafu {
                stage: "registry-select-load-messages",
            })?
            .into_iter()
            .map(Message::from_record)
            .collect::<Vec<_>>();

        tracing::debug!(
            chat_id = %chat_id,
            message_count = transcript.len(),
            "loaded chat transcript"
        );

        let engine = EngineHandle::spawn(chat, transcript, self.deps.clone());
        inner.engines.insert(chat_id, engine.clone());
        inner.current = Some(chat_id);
        Ok(engine)
    }

    /// Validates and persists a new chat, places it at the head and makes it current.
    pub async fn create_chat(&self, draft: ChatDraft) -> EngineResult<Chat> {
        let fields = draft.validate().context(ValidationSnafu {
            stage: "registry-create-validate",
        })?;
        let record = self
            .deps
            .storage
            .create_chat(fields)
            .context(StoreSnafu {
                stage: "registry-create-persist",
            })?;
        let chat = Chat::from_record(record);

        let mut inner = self.inner.lock().await;
        inner.chats.insert(0, chat.clone());
        inner.engines.insert(
            chat.id,
            EngineHandle::spawn(chat.clone(), Vec::new(), self.deps.clone()),
        );
        inner.current = Some(chat.id);

        tracing::debug!(chat_id = %chat.id, name = %chat.name, "created chat");
        Ok(chat)
    }

    /// Stops the chat's engine, deletes it with its messages, and moves selection to the new head.
    pub async fn delete_chat(&self, chat_id: ChatId) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;

        if let Some(engine) = inner.engines.remove(&chat_id) {
            engine.shutdown().await;
        }

        self.deps.storage.delete_chat(chat_id).context(StoreSnafu {
            stage: "registry-delete-chat",
        })?;

        inner.chats.retain(|chat| chat.id != chat_id);
        inner.refresh();
        if inner.current == Some(chat_id) {
            inner.current = inner.chats.first().map(|chat| chat.id);
        }

        tracing::debug!(chat_id = %chat_id, current = ?inner.current, "deleted chat");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let engines = {
            let mut inner = self.inner.lock().await;
            inner.engines.drain().map(|(_, engine)| engine).collect::<Vec<_>>()
        };

        for engine in engines {
            engine.shutdown().await;
        }
    }
}
