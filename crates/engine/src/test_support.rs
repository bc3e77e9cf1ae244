use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use colloquy_llm::{
    ChatStream, ProviderConfig, ProviderError, ProviderResult, ProviderStreamHandle,
    StreamEvent, StreamEventMapped, StreamRequest, StreamSessionId, make_event_stream,
};
use colloquy_storage::{
    AppendedMessage, ChatFields, ChatId, ChatRecord, ChatStore, MemoryStorage, MessageId,
    MessageRecord, MessageSource, MessageStore, NewMessage, StorageError, StorageResult,
};
use tokio::sync::{mpsc, oneshot};

use crate::chat::{Chat, ChatDraft};
use crate::engine::{EngineDeps, EngineHandle};
use crate::message::Message;
use crate::state::ConversationState;

const WAIT: Duration = Duration::from_secs(2);

/// One stream the engine opened, driven by the test.
pub(crate) struct OpenedStream {
    pub request: StreamRequest,
    pub events: mpsc::UnboundedSender<StreamEventMapped>,
    pub cancel: oneshot::Receiver<()>,
}

impl OpenedStream {
    pub fn session(&self) -> StreamSessionId {
        self.request.session
    }

    fn send(&self, event: StreamEvent) {
        let _ = self.events.send(StreamEventMapped {
            session: self.session(),
            event,
        });
    }

    pub fn delta(&self, text: &str) {
        self.send(StreamEvent::Delta(text.to_string()));
    }

    pub fn done(&self) {
        self.send(StreamEvent::Done);
    }

    pub fn fail(&self, error: ProviderError) {
        self.send(StreamEvent::Failed(error));
    }
}

/// [`ChatStream`] fake that hands every opened stream to the test.
pub(crate) struct ScriptedChatStream {
    opened: mpsc::UnboundedSender<OpenedStream>,
    open_failure: Mutex<Option<ProviderError>>,
}

impl ScriptedChatStream {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedStream>) {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Self {
            opened: opened_tx,
            open_failure: Mutex::new(None),
        });
        (stream, opened_rx)
    }

    pub fn fail_next_open(&self, error: ProviderError) {
        if let Ok(mut slot) = self.open_failure.lock() {
            *slot = Some(error);
        }
    }
}

impl ChatStream for ScriptedChatStream {
    fn open(
        &self,
        _config: &ProviderConfig,
        request: StreamRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        if let Some(error) = self
            .open_failure
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
        {
            return Err(error);
        }

        let (events, stream, cancel) = make_event_stream(request.session);
        let _ = self.opened.send(OpenedStream {
            request,
            events,
            cancel,
        });
        Ok(ProviderStreamHandle {
            stream,
            worker: Box::pin(async {}),
        })
    }
}

/// In-memory store with switchable write failures and a message-load counter.
#[derive(Default)]
pub(crate) struct FlakyStorage {
    inner: MemoryStorage,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
    message_loads: AtomicUsize,
}

impl FlakyStorage {
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn message_loads(&self) -> usize {
        self.message_loads.load(Ordering::SeqCst)
    }

    fn injected(flag: &AtomicBool, stage: &'static str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::InvariantViolation {
                stage,
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl ChatStore for FlakyStorage {
    fn create_chat(&self, input: ChatFields) -> StorageResult<ChatRecord> {
        self.inner.create_chat(input)
    }

    fn list_chats(&self) -> StorageResult<Vec<ChatRecord>> {
        self.inner.list_chats()
    }

    fn get_chat(&self, chat_id: ChatId) -> StorageResult<Option<ChatRecord>> {
        self.inner.get_chat(chat_id)
    }

    fn update_chat(&self, chat_id: ChatId, input: ChatFields) -> StorageResult<ChatRecord> {
        self.inner.update_chat(chat_id, input)
    }

    fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        self.inner.delete_chat(chat_id)
    }
}

impl MessageStore for FlakyStorage {
    fn insert_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<AppendedMessage> {
        Self::injected(&self.fail_inserts, "flaky-insert")?;
        self.inner.insert_message(chat_id, input)
    }

    fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
    ) -> StorageResult<MessageRecord> {
        Self::injected(&self.fail_updates, "flaky-update")?;
        self.inner.update_message(chat_id, message_id, content)
    }

    fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> StorageResult<u64> {
        self.inner.delete_messages(chat_id, message_ids)
    }

    fn clear_messages(&self, chat_id: ChatId) -> StorageResult<u64> {
        self.inner.clear_messages(chat_id)
    }

    fn clear_messages_by_source(
        &self,
        chat_id: ChatId,
        source: MessageSource,
    ) -> StorageResult<u64> {
        self.inner.clear_messages_by_source(chat_id, source)
    }

    fn list_messages(&self, chat_id: ChatId) -> StorageResult<Vec<MessageRecord>> {
        self.message_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.list_messages(chat_id)
    }
}

pub(crate) struct Harness {
    pub storage: Arc<FlakyStorage>,
    pub chat_stream: Arc<ScriptedChatStream>,
    pub opened: mpsc::UnboundedReceiver<OpenedStream>,
    pub deps: EngineDeps,
}

impl Harness {
    pub fn new() -> Self {
        let storage = Arc::new(FlakyStorage::default());
        let (chat_stream, opened) = ScriptedChatStream::new();
        let provider_config = Arc::new(ArcSwap::from_pointee(ProviderConfig::new(
            "openai", "sk-test", "",
        )));
        let deps = EngineDeps::new(storage.clone(), chat_stream.clone(), provider_config);

        Self {
            storage,
            chat_stream,
            opened,
            deps,
        }
    }

    pub fn create_chat(&self, name: &str) -> Chat {
        let fields = ChatDraft::new(name, "You are terse.")
            .validate()
            .expect("valid draft");
        Chat::from_record(self.storage.create_chat(fields).expect("create chat"))
    }

    pub fn spawn_engine(&self, seed: &[(MessageSource, &str)]) -> EngineHandle {
        let chat = self.create_chat("chat");
        for (source, content) in seed {
            self.storage
                .insert_message(chat.id, NewMessage::new(*source, *content))
                .expect("seed message");
        }

        let chat = self
            .storage
            .get_chat(chat.id)
            .expect("get chat")
            .map(Chat::from_record)
            .expect("chat exists");
        let transcript = self
            .storage
            .list_messages(chat.id)
            .expect("list seed")
            .into_iter()
            .map(Message::from_record)
            .collect();

        EngineHandle::spawn(chat, transcript, self.deps.clone())
    }
}

pub(crate) async fn next_opened(
    opened: &mut mpsc::UnboundedReceiver<OpenedStream>,
) -> OpenedStream {
    tokio::time::timeout(WAIT, opened.recv())
        .await
        .expect("stream opened in time")
        .expect("chat stream fake alive")
}

pub(crate) async fn wait_for_state(
    engine: &EngineHandle,
    mut predicate: impl FnMut(&ConversationState) -> bool,
) -> ConversationState {
    let mut state = engine.subscribe();
    let reached = tokio::time::timeout(WAIT, state.wait_for(|current| predicate(current)))
        .await
        .expect("state reached in time")
        .expect("engine alive")
        .clone();
    reached
}
