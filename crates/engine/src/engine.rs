use std::ops::ControlFlow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use colloquy_llm::{
    ChatStream, DeltaStream, ProviderConfig, ProviderError, StreamEvent, StreamEventMapped,
    StreamRequest, StreamSessionId,
};
use colloquy_storage::{
    AppendedMessage, ChatId, MessageId, MessageSource as StoredSource, NewMessage, Storage,
    StorageError,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::chat::{Chat, ChatDraft};
use super::context_window::ContextWindow;
use super::error::{
    EngineClosedSnafu, EngineError, EngineResult, StoreSnafu, ValidationSnafu,
};
use super::message::{Message, MessageKey, MessageSource};
use super::state::{
    AlertDescriptor, ConfirmableAction, ConversationState, GenerationTransition,
};

/// Collaborators shared by every engine: the store, the stream source and live provider settings.
#[derive(Clone)]
pub struct EngineDeps {
    pub storage: Arc<dyn Storage>,
    pub chat_stream: Arc<dyn ChatStream>,
    pub provider_config: Arc<ArcSwap<ProviderConfig>>,
}

impl EngineDeps {
    pub fn new(
        storage: Arc<dyn Storage>,
        chat_stream: Arc<dyn ChatStream>,
        provider_config: Arc<ArcSwap<ProviderConfig>>,
    ) -> Self {
        Self {
            storage,
            chat_stream,
            provider_config,
        }
    }
}

enum Command {
    UpdateInput {
        text: String,
        reply: oneshot::Sender<()>,
    },
    SubmitInput {
        text: String,
        reply: oneshot::Sender<EngineResult<bool>>,
    },
    Retry {
        key: MessageKey,
        reply: oneshot::Sender<EngineResult<bool>>,
    },
    Break {
        reply: oneshot::Sender<EngineResult<bool>>,
    },
    StopGeneration {
        reply: oneshot::Sender<bool>,
    },
    RequestClearAll {
        reply: oneshot::Sender<()>,
    },
    RequestClearFrom {
        key: MessageKey,
        reply: oneshot::Sender<bool>,
    },
    Confirm {
        reply: oneshot::Sender<EngineResult<bool>>,
    },
    DismissAlert {
        reply: oneshot::Sender<()>,
    },
    ClearErrors {
        reply: oneshot::Sender<EngineResult<u64>>,
    },
    EditChat {
        draft: ChatDraft,
        reply: oneshot::Sender<EngineResult<Chat>>,
    },
    SetEditDialogOpen {
        open: bool,
        reply: oneshot::Sender<()>,
    },
    ToggleRawTextMode {
        reply: oneshot::Sender<bool>,
    },
    SetExportDialogOpen {
        open: bool,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to one chat's engine task.
///
/// Commands are applied strictly in order; the state is observable through [`watch`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    chat_id: ChatId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConversationState>,
}

impl EngineHandle {
    /// Starts the engine task for `chat` seeded with its persisted transcript.
    pub fn spawn(chat: Chat, transcript: Vec<Message>, deps: EngineDeps) -> Self {
        let chat_id = chat.id;
        let state = ConversationState::new(chat, transcript);
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let engine = ConversationEngine {
            deps,
            state,
            state_tx,
            active: None,
        };
        tokio::spawn(engine.run(command_rx));

        Self {
            chat_id,
            commands: command_tx,
            state: state_rx,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn chat(&self) -> Chat {
        self.state.borrow().chat.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// Content of one transcript entry, for handing to a clipboard.
    pub fn copy_message(&self, key: MessageKey) -> Option<String> {
        self.state
            .borrow()
            .message(key)
            .map(|message| message.content.clone())
    }

    pub async fn update_input(&self, text: impl Into<String>) -> EngineResult<()> {
        let text = text.into();
        self.request("update-input", |reply| Command::UpdateInput { text, reply })
            .await
    }

    /// Persists `text` as a user message and starts a reply; `false` when ignored.
    pub async fn submit_input(&self, text: impl Into<String>) -> EngineResult<bool> {
        let text = text.into();
        self.request("submit-input", |reply| Command::SubmitInput { text, reply })
            .await?
    }

    pub async fn retry(&self, key: MessageKey) -> EngineResult<bool> {
        self.request("retry", |reply| Command::Retry { key, reply })
            .await?
    }

    pub async fn break_chat(&self) -> EngineResult<bool> {
        self.request("break-chat", |reply| Command::Break { reply })
            .await?
    }

    pub async fn stop_generation(&self) -> EngineResult<bool> {
        self.request("stop-generation", |reply| Command::StopGeneration { reply })
            .await
    }

    pub async fn request_clear_all(&self) -> EngineResult<()> {
        self.request("request-clear-all", |reply| Command::RequestClearAll { reply })
            .await
    }

    pub async fn request_clear_from(&self, key: MessageKey) -> EngineResult<bool> {
        self.request("request-clear-from", |reply| Command::RequestClearFrom {
            key,
            reply,
        })
        .await
    }

    /// Runs the action behind the open confirmation prompt.
    pub async fn confirm(&self) -> EngineResult<bool> {
        self.request("confirm", |reply| Command::Confirm { reply })
            .await?
    }

    pub async fn dismiss_alert(&self) -> EngineResult<()> {
        self.request("dismiss-alert", |reply| Command::DismissAlert { reply })
            .await
    }

    pub async fn clear_errors(&self) -> EngineResult<u64> {
        self.request("clear-errors", |reply| Command::ClearErrors { reply })
            .await?
    }

    pub async fn edit_chat(&self, draft: ChatDraft) -> EngineResult<Chat> {
        self.request("edit-chat", |reply| Command::EditChat { draft, reply })
            .await?
    }

    pub async fn set_edit_dialog_open(&self, open: bool) -> EngineResult<()> {
        self.request("set-edit-dialog-open", |reply| Command::SetEditDialogOpen {
            open,
            reply,
        })
        .await
    }

    /// Flips raw text mode and returns the new value.
    pub async fn toggle_raw_text_mode(&self) -> EngineResult<bool> {
        self.request("toggle-raw-text-mode", |reply| Command::ToggleRawTextMode {
            reply,
        })
        .await
    }

    pub async fn set_export_dialog_open(&self, open: bool) -> EngineResult<()> {
        self.request("set-export-dialog-open", |reply| {
            Command::SetExportDialogOpen { open, reply }
        })
        .await
    }

    /// Cancels any in-flight reply and stops the task. Idempotent.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .ok()
            .context(EngineClosedSnafu {
                stage,
                chat_id: self.chat_id,
            })?;
        reply_rx.await.ok().context(EngineClosedSnafu {
            stage,
            chat_id: self.chat_id,
        })
    }
}

struct ActiveGeneration {
    session: StreamSessionId,
    stream: DeltaStream,
    assistant: Option<MessageId>,
    content: String,
}

enum Step {
    Command(Option<Command>),
    Stream(StreamSessionId, Option<StreamEventMapped>),
}

struct ConversationEngine {
    deps: EngineDeps,
    state: ConversationState,
    state_tx: watch::Sender<ConversationState>,
    active: Option<ActiveGeneration>,
}

impl ConversationEngine {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(chat_id = %self.chat_id(), "conversation engine started");

        loop {
            let step = match self.active.as_mut() {
                Some(active) => {
                    let session = active.session;
                    tokio::select! {
                        command = commands.recv() => Step::Command(command),
                        event = active.stream.recv() => Step::Stream(session, event),
                    }
                }
                None => Step::Command(commands.recv().await),
            };

            match step {
                Step::Command(Some(command)) => {
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                Step::Command(None) => {
                    self.cancel_active("handles-dropped");
                    self.publish();
                    break;
                }
                Step::Stream(session, event) => {
                    self.handle_stream_event(session, event);
                    self.publish();
                }
            }
        }

        tracing::debug!(chat_id = %self.chat_id(), "conversation engine stopped");
    }

    fn chat_id(&self) -> ChatId {
        self.state.chat.id
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    /// Publishes before replying so callers observe the state their command produced.
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::UpdateInput { text, reply } => {
                self.state.pending_input = text;
                self.respond(reply, ());
            }
            Command::SubmitInput { text, reply } => {
                let result = self.submit_input(&text);
                self.respond(reply, result);
            }
            Command::Retry { key, reply } => {
                let result = self.retry(key);
                self.respond(reply, result);
            }
            Command::Break { reply } => {
                let result = self.break_chat();
                self.respond(reply, result);
            }
            Command::StopGeneration { reply } => {
                let stopped = self.cancel_active("stop-generation");
                self.respond(reply, stopped);
            }
            Command::RequestClearAll { reply } => {
                self.open_confirmation(ConfirmableAction::ClearAll);
                self.respond(reply, ());
            }
            Command::RequestClearFrom { key, reply } => {
                let opened = match key {
                    MessageKey::Stored(message_id) if self.state.message(key).is_some() => {
                        self.open_confirmation(ConfirmableAction::ClearFrom(message_id));
                        true
                    }
                    MessageKey::Stored(_) | MessageKey::Receiving(_) => false,
                };
                self.respond(reply, opened);
            }
            Command::Confirm { reply } => {
                let result = self.confirm();
                self.respond(reply, result);
            }
            Command::DismissAlert { reply } => {
                self.dismiss_alert();
                self.respond(reply, ());
            }
            Command::ClearErrors { reply } => {
                let result = self.clear_errors("clear-errors");
                self.respond(reply, result);
            }
            Command::EditChat { draft, reply } => {
                let result = self.edit_chat(&draft);
                self.respond(reply, result);
            }
            Command::SetEditDialogOpen { open, reply } => {
                self.state.flags.edit_dialog_open = open;
                self.respond(reply, ());
            }
            Command::ToggleRawTextMode { reply } => {
                self.state.flags.raw_text_mode_on = !self.state.flags.raw_text_mode_on;
                let enabled = self.state.flags.raw_text_mode_on;
                self.respond(reply, enabled);
            }
            Command::SetExportDialogOpen { open, reply } => {
                self.state.flags.export_dialog_open = open;
                self.respond(reply, ());
            }
            Command::Shutdown { reply } => {
                self.cancel_active("shutdown");
                self.respond(reply, ());
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    fn submit_input(&mut self, text: &str) -> EngineResult<bool> {
        if self.state.is_receiving() || self.active.is_some() {
            tracing::debug!(chat_id = %self.chat_id(), "ignoring submit while a reply is in flight");
            return Ok(false);
        }

        let content = text.trim();
        if content.is_empty() {
            return Ok(false);
        }

        let appended = self
            .deps
            .storage
            .insert_message(self.chat_id(), NewMessage::new(StoredSource::User, content))
            .context(StoreSnafu {
                stage: "submit-input-persist",
            })?;

        self.push_appended(appended);
        self.state.pending_input.clear();
        self.state.store_failure = None;
        self.start_generation("submit-input");
        Ok(true)
    }

    fn retry(&mut self, key: MessageKey) -> EngineResult<bool> {
        if self.state.is_receiving() || self.active.is_some() {
            return Ok(false);
        }

        let targets_error = self
            .state
            .message(key)
            .is_some_and(|message| message.source == MessageSource::Error);
        if !targets_error {
            return Ok(false);
        }

        self.clear_errors("retry-clear-errors")?;
        self.start_generation("retry");
        Ok(true)
    }

    fn break_chat(&mut self) -> EngineResult<bool> {
        let last_settled = self
            .state
            .transcript
            .iter()
            .rev()
            .find(|message| !message.is_receiving());
        match last_settled {
            None => return Ok(false),
            Some(message) if message.source == MessageSource::Breaker => return Ok(false),
            Some(_) => {}
        }

        let appended = self
            .deps
            .storage
            .insert_message(self.chat_id(), NewMessage::new(StoredSource::Breaker, ""))
            .context(StoreSnafu {
                stage: "break-chat-persist",
            })?;

        self.cancel_active("break-chat");
        self.push_appended(appended);
        self.state.store_failure = None;
        Ok(true)
    }

    fn clear_errors(&mut self, stage: &'static str) -> EngineResult<u64> {
        let removed = self
            .deps
            .storage
            .clear_messages_by_source(self.chat_id(), StoredSource::Error)
            .context(StoreSnafu { stage })?;

        self.state
            .transcript
            .retain(|message| message.source != MessageSource::Error);
        self.state.store_failure = None;
        Ok(removed)
    }

    fn open_confirmation(&mut self, action: ConfirmableAction) {
        self.state.pending_confirmation = Some(action);
        self.state.active_alert = Some(AlertDescriptor::for_action(action));
    }

    fn dismiss_alert(&mut self) {
        self.state.pending_confirmation = None;
        self.state.active_alert = None;
    }

    fn confirm(&mut self) -> EngineResult<bool> {
        let Some(action) = self.state.pending_confirmation else {
            self.dismiss_alert();
            return Ok(false);
        };

        match action {
            ConfirmableAction::ClearAll => {
                self.deps
                    .storage
                    .clear_messages(self.chat_id())
                    .context(StoreSnafu { stage: "clear-all" })?;

                self.cancel_active("clear-all");
                self.state.transcript.clear();
                self.state.flags.raw_text_mode_on = false;
            }
            ConfirmableAction::ClearFrom(message_id) => {
                let Some(index) = self.state.position(MessageKey::Stored(message_id)) else {
                    self.dismiss_alert();
                    return Ok(false);
                };

                let doomed = self.state.transcript[index..]
                    .iter()
                    .filter_map(Message::stored_id)
                    .collect::<Vec<_>>();
                self.deps
                    .storage
                    .delete_messages(self.chat_id(), &doomed)
                    .context(StoreSnafu {
                        stage: "clear-from",
                    })?;

                // An in-flight reply is always the newest entry, so it falls inside the cut.
                self.cancel_active("clear-from");
                self.state.transcript.truncate(index);
            }
        }

        self.dismiss_alert();
        self.state.store_failure = None;
        Ok(true)
    }

    fn edit_chat(&mut self, draft: &ChatDraft) -> EngineResult<Chat> {
        let fields = draft.validate().context(ValidationSnafu {
            stage: "edit-chat-validate",
        })?;
        let record = self
            .deps
            .storage
            .update_chat(self.chat_id(), fields)
            .context(StoreSnafu {
                stage: "edit-chat-persist",
            })?;

        self.state.chat = Chat::from_record(record);
        self.state.flags.edit_dialog_open = false;
        self.state.store_failure = None;
        Ok(self.state.chat.clone())
    }

    /// Builds the context window and opens a stream; `false` when there is nothing to send.
    fn start_generation(&mut self, stage: &'static str) -> bool {
        let window = ContextWindow::build(
            &self.state.chat.prompt,
            &self.state.transcript,
            self.state.chat.context_size,
        );
        if window.is_empty() {
            tracing::debug!(chat_id = %self.chat_id(), stage, "context window is empty; no request sent");
            return false;
        }

        let session = StreamSessionId::new();
        if !self.transition(GenerationTransition::Start(session), stage) {
            return false;
        }
        self.state
            .transcript
            .push(Message::receiving(self.chat_id(), session));

        // Settings are read per generation so edits apply to the next reply.
        let config = self.deps.provider_config.load_full();
        let request = StreamRequest::new(session, self.state.chat.model, window.into_messages())
            .with_temperature(self.state.chat.temperature);

        tracing::debug!(
            chat_id = %self.chat_id(),
            session = %session,
            model = %self.state.chat.model,
            message_count = request.messages.len(),
            "opening chat stream"
        );

        match self.deps.chat_stream.open(&config, request) {
            Ok(handle) => {
                tokio::spawn(handle.worker);
                self.active = Some(ActiveGeneration {
                    session,
                    stream: handle.stream,
                    assistant: None,
                    content: String::new(),
                });
            }
            Err(error) => self.finish_with_failure(session, error),
        }

        true
    }

    fn handle_stream_event(&mut self, session: StreamSessionId, event: Option<StreamEventMapped>) {
        let Some(mapped) = event else {
            tracing::warn!(
                chat_id = %self.chat_id(),
                session = %session,
                "provider stream ended before a terminal event"
            );
            self.finish_with_failure(
                session,
                ProviderError::Transport {
                    stage: "stream-closed",
                    details: "stream ended before a terminal event".to_string(),
                },
            );
            return;
        };

        if mapped.session != session {
            tracing::debug!(
                chat_id = %self.chat_id(),
                active = %session,
                stale = %mapped.session,
                "dropping stale stream event"
            );
            return;
        }

        match mapped.event {
            StreamEvent::Delta(text) => self.apply_delta(session, text),
            StreamEvent::Done => self.complete_generation(session),
            StreamEvent::Failed(error) => self.finish_with_failure(session, error),
        }
    }

    fn apply_delta(&mut self, session: StreamSessionId, text: String) {
        let Some(active) = self.active.as_ref() else {
            return;
        };

        match active.assistant {
            None => self.commit_first_delta(session, text),
            Some(message_id) => {
                let content = format!("{}{text}", active.content);
                self.commit_next_delta(session, message_id, content);
            }
        }
    }

    fn commit_first_delta(&mut self, session: StreamSessionId, text: String) {
        let appended = match self.deps.storage.insert_message(
            self.chat_id(),
            NewMessage::new(StoredSource::Assistant, text.clone()),
        ) {
            Ok(appended) => appended,
            Err(error) => {
                self.abort_on_store_failure(session, "stream-first-delta-persist", error);
                return;
            }
        };

        let message_id = appended.message.id;
        self.transition(
            GenerationTransition::FirstDelta {
                session,
                message_id,
            },
            "stream-first-delta",
        );

        self.state.chat.updated_at_unix_millis = appended.chat_updated_at_unix_millis;
        let message = Message::from_record(appended.message);
        match self.state.position(MessageKey::Receiving(session)) {
            Some(index) => self.state.transcript[index] = message,
            None => {
                tracing::error!(
                    chat_id = %self.chat_id(),
                    session = %session,
                    "reply placeholder missing when first delta arrived"
                );
                self.state.transcript.push(message);
            }
        }

        if let Some(active) = self.active.as_mut() {
            active.assistant = Some(message_id);
            active.content = text;
        }
    }

    fn commit_next_delta(&mut self, session: StreamSessionId, message_id: MessageId, content: String) {
        if let Err(error) =
            self.deps
                .storage
                .update_message(self.chat_id(), message_id, content.clone())
        {
            self.abort_on_store_failure(session, "stream-delta-persist", error);
            return;
        }

        if let Some(message) = self
            .state
            .transcript
            .iter_mut()
            .find(|message| message.key == MessageKey::Stored(message_id))
        {
            message.content.clone_from(&content);
        }
        if let Some(active) = self.active.as_mut() {
            active.content = content;
        }
    }

    fn complete_generation(&mut self, session: StreamSessionId) {
        let Some(active) = self.active.take() else {
            return;
        };

        if active.assistant.is_none() {
            drop(active);
            self.finish_with_failure(
                session,
                ProviderError::EmptyResponse {
                    stage: "stream-done-without-delta",
                },
            );
            return;
        }

        self.transition(GenerationTransition::Complete(session), "stream-complete");
        tracing::debug!(
            chat_id = %self.chat_id(),
            session = %session,
            content_len = active.content.len(),
            "generation completed"
        );
    }

    /// Turns a stream failure into an error entry; committed assistant text is kept.
    fn finish_with_failure(&mut self, session: StreamSessionId, error: ProviderError) {
        tracing::warn!(
            chat_id = %self.chat_id(),
            session = %session,
            stage = error.stage(),
            error = %error,
            "generation failed"
        );

        if let Some(mut active) = self.active.take() {
            active.stream.cancel();
        }
        self.transition(GenerationTransition::Fail(session), "stream-fail");
        self.remove_placeholder(session);

        match self.deps.storage.insert_message(
            self.chat_id(),
            NewMessage::new(StoredSource::Error, error.to_string()),
        ) {
            Ok(appended) => self.push_appended(appended),
            Err(store_error) => self.record_store_failure("stream-fail-persist", store_error),
        }

        self.transition(GenerationTransition::Settle(session), "stream-settle");
    }

    fn abort_on_store_failure(
        &mut self,
        session: StreamSessionId,
        stage: &'static str,
        error: StorageError,
    ) {
        if let Some(mut active) = self.active.take() {
            active.stream.cancel();
        }
        self.remove_placeholder(session);
        self.transition(GenerationTransition::Cancel(session), stage);
        self.record_store_failure(stage, error);
    }

    /// Cancels the in-flight reply, if any. Committed assistant text stays.
    fn cancel_active(&mut self, reason: &'static str) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };

        active.stream.cancel();
        self.remove_placeholder(active.session);
        self.transition(GenerationTransition::Cancel(active.session), reason);
        tracing::debug!(
            chat_id = %self.chat_id(),
            session = %active.session,
            reason,
            "generation cancelled"
        );
        true
    }

    fn remove_placeholder(&mut self, session: StreamSessionId) {
        self.state
            .transcript
            .retain(|message| message.key != MessageKey::Receiving(session));
    }

    fn push_appended(&mut self, appended: AppendedMessage) {
        self.state.chat.updated_at_unix_millis = appended.chat_updated_at_unix_millis;
        self.state
            .transcript
            .push(Message::from_record(appended.message));
    }

    fn record_store_failure(&mut self, stage: &'static str, error: StorageError) {
        let error = EngineError::Store {
            stage,
            source: error,
        };
        tracing::error!(
            chat_id = %self.chat_id(),
            stage,
            error = %error,
            "store write failed while applying a reply"
        );
        self.state.store_failure = Some(error.to_string());
    }

    /// Applies a checked phase change; a rejection is logged as an invariant violation.
    fn transition(&mut self, transition: GenerationTransition, stage: &'static str) -> bool {
        match self.state.apply_generation(transition) {
            Ok(_) => true,
            Err(rejection) => {
                let error = EngineError::InvariantViolation {
                    stage,
                    details: format!("{rejection:?} while applying {transition:?}"),
                };
                tracing::error!(chat_id = %self.chat_id(), stage, error = %error, "rejected generation transition");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_llm::{ProviderMessage, Role};
    use colloquy_storage::{ChatStore, MessageStore};

    use crate::chat::ChatDraft;
    use crate::state::GenerationPhase;
    use crate::test_support::{Harness, next_opened, wait_for_state};

    fn sources(state: &ConversationState) -> Vec<MessageSource> {
        state
            .transcript
            .iter()
            .map(|message| message.source)
            .collect()
    }

    fn stored_sources(harness: &Harness, chat_id: ChatId) -> Vec<StoredSource> {
        harness
            .storage
            .list_messages(chat_id)
            .expect("list stored messages")
            .into_iter()
            .map(|message| message.source)
            .collect()
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        assert!(!engine.submit_input("   \n").await.expect("submit"));

        assert!(stored_sources(&harness, engine.chat_id()).is_empty());
        assert!(engine.state().transcript.is_empty());
        assert!(harness.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn submit_while_receiving_is_ignored() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        assert!(engine.submit_input("first").await.expect("submit first"));
        assert!(!engine.submit_input("second").await.expect("submit second"));

        let state = engine.state();
        assert_eq!(
            sources(&state),
            vec![MessageSource::User, MessageSource::Receiving]
        );
        assert_eq!(
            stored_sources(&harness, engine.chat_id()),
            vec![StoredSource::User]
        );
        let _opened = next_opened(&mut harness.opened).await;
        assert!(harness.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn streamed_deltas_become_one_assistant_message() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.update_input(" hi ").await.expect("update input");

        assert!(engine.submit_input(" hi ").await.expect("submit"));
        let opened = next_opened(&mut harness.opened).await;
        assert_eq!(opened.request.temperature, Some(0.3));
        assert_eq!(
            opened.request.messages,
            vec![
                ProviderMessage::new(Role::System, "You are terse."),
                ProviderMessage::new(Role::User, "hi"),
            ]
        );

        opened.delta("Hel");
        opened.delta("lo");
        opened.done();

        let state = wait_for_state(&engine, |state| {
            state.generation.is_idle() && !state.is_receiving()
        })
        .await;
        assert_eq!(
            sources(&state),
            vec![MessageSource::User, MessageSource::Assistant]
        );
        assert_eq!(state.transcript[0].content, "hi");
        assert_eq!(state.transcript[1].content, "Hello");
        assert!(state.pending_input.is_empty());

        let stored = harness
            .storage
            .list_messages(engine.chat_id())
            .expect("list stored");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "Hello");
        assert_eq!(
            state.transcript[1].key,
            MessageKey::Stored(stored[1].id)
        );
    }

    #[tokio::test]
    async fn failing_stream_leaves_single_error_entry() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        engine.submit_input("hi").await.expect("submit");
        let opened = next_opened(&mut harness.opened).await;
        opened.fail(ProviderError::Rejected {
            stage: "test",
            code: Some("invalid_api_key".to_string()),
            details: "{}".to_string(),
        });

        let state = wait_for_state(&engine, |state| state.generation.is_idle()).await;
        assert_eq!(sources(&state), vec![MessageSource::User, MessageSource::Error]);
        assert_eq!(
            state.transcript[1].content,
            "Invalid response, error code: invalid_api_key"
        );
        assert_eq!(
            stored_sources(&harness, engine.chat_id()),
            vec![StoredSource::User, StoredSource::Error]
        );
    }

    #[tokio::test]
    async fn completion_without_deltas_is_an_empty_response_error() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        engine.submit_input("hi").await.expect("submit");
        next_opened(&mut harness.opened).await.done();

        let state = wait_for_state(&engine, |state| state.generation.is_idle()).await;
        assert_eq!(sources(&state), vec![MessageSource::User, MessageSource::Error]);
        assert_eq!(state.transcript[1].content, "Empty response");
    }

    #[tokio::test]
    async fn stream_open_failure_is_recorded_immediately() {
        let harness = Harness::new();
        harness
            .chat_stream
            .fail_next_open(ProviderError::MissingApiKey {
                stage: "test",
                provider_id: "openai".to_string(),
            });
        let engine = harness.spawn_engine(&[]);

        assert!(engine.submit_input("hi").await.expect("submit"));

        let state = engine.state();
        assert_eq!(state.generation, GenerationPhase::Idle);
        assert_eq!(sources(&state), vec![MessageSource::User, MessageSource::Error]);
        assert_eq!(state.transcript[1].content, "Missing API key");
    }

    #[tokio::test]
    async fn dropped_stream_sender_counts_as_transport_failure() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        engine.submit_input("hi").await.expect("submit");
        let opened = next_opened(&mut harness.opened).await;
        opened.delta("partial");
        drop(opened);

        let state = wait_for_state(&engine, |state| state.generation.is_idle()).await;
        assert_eq!(
            sources(&state),
            vec![
                MessageSource::User,
                MessageSource::Assistant,
                MessageSource::Error
            ]
        );
        assert_eq!(state.transcript[1].content, "partial");
    }

    #[tokio::test]
    async fn clear_from_removes_target_and_everything_newer() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[
            (StoredSource::User, "m1"),
            (StoredSource::Assistant, "m2"),
            (StoredSource::User, "m3"),
            (StoredSource::Assistant, "m4"),
        ]);
        let before = engine.state();
        let target = before.transcript[2].key;

        assert!(engine.request_clear_from(target).await.expect("request"));
        let prompted = engine.state();
        assert_eq!(
            prompted.active_alert.as_ref().map(|alert| alert.title),
            Some("Clear from bottom to this message?")
        );
        assert_eq!(prompted.transcript.len(), 4);

        assert!(engine.confirm().await.expect("confirm"));

        let state = engine.state();
        assert_eq!(
            state
                .transcript
                .iter()
                .map(|message| message.content.as_str())
                .collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert!(state.active_alert.is_none());
        assert_eq!(
            harness
                .storage
                .list_messages(engine.chat_id())
                .expect("list")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn dismissed_confirmation_does_nothing() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[(StoredSource::User, "keep me")]);

        engine.request_clear_all().await.expect("request clear all");
        assert_eq!(
            engine.state().active_alert.map(|alert| alert.title),
            Some("Clear all messages?")
        );
        engine.dismiss_alert().await.expect("dismiss");

        assert!(!engine.confirm().await.expect("confirm without prompt"));
        assert_eq!(engine.state().transcript.len(), 1);
        assert_eq!(stored_sources(&harness, engine.chat_id()).len(), 1);
    }

    #[tokio::test]
    async fn clear_all_empties_transcript_and_leaves_raw_mode() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[
            (StoredSource::User, "q"),
            (StoredSource::Assistant, "a"),
        ]);
        assert!(engine.toggle_raw_text_mode().await.expect("toggle"));

        engine.request_clear_all().await.expect("request");
        assert!(engine.confirm().await.expect("confirm"));

        let state = engine.state();
        assert!(state.transcript.is_empty());
        assert!(!state.flags.raw_text_mode_on);
        assert!(stored_sources(&harness, engine.chat_id()).is_empty());
    }

    #[tokio::test]
    async fn clear_all_while_streaming_cancels_stream() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.submit_input("hi").await.expect("submit");
        let mut opened = next_opened(&mut harness.opened).await;
        opened.delta("partial");
        wait_for_state(&engine, |state| {
            matches!(state.generation, GenerationPhase::StreamingDelta { .. })
        })
        .await;

        engine.request_clear_all().await.expect("request");
        assert!(engine.confirm().await.expect("confirm"));

        assert!(opened.cancel.try_recv().is_ok());
        assert!(
            opened
                .events
                .send(StreamEventMapped {
                    session: opened.session(),
                    event: StreamEvent::Delta(" more".to_string()),
                })
                .is_err()
        );

        let state = engine.state();
        assert!(state.transcript.is_empty());
        assert!(state.generation.is_idle());
        assert!(stored_sources(&harness, engine.chat_id()).is_empty());
    }

    #[tokio::test]
    async fn clear_from_before_inflight_reply_cancels_stream() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[
            (StoredSource::User, "m1"),
            (StoredSource::Assistant, "m2"),
        ]);
        engine.submit_input("m3").await.expect("submit");
        let mut opened = next_opened(&mut harness.opened).await;
        let target = engine.state().transcript[1].key;

        assert!(engine.request_clear_from(target).await.expect("request"));
        assert!(engine.confirm().await.expect("confirm"));

        assert!(opened.cancel.try_recv().is_ok());
        assert!(
            opened
                .events
                .send(StreamEventMapped {
                    session: opened.session(),
                    event: StreamEvent::Delta("late".to_string()),
                })
                .is_err()
        );

        let state = engine.state();
        assert_eq!(sources(&state), vec![MessageSource::User]);
        assert_eq!(state.transcript[0].content, "m1");
        assert!(!state.is_receiving());
        assert!(state.generation.is_idle());
        assert_eq!(
            stored_sources(&harness, engine.chat_id()),
            vec![StoredSource::User]
        );
    }

    #[tokio::test]
    async fn receiving_placeholder_cannot_be_a_clear_target() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.submit_input("hi").await.expect("submit");
        let _opened = next_opened(&mut harness.opened).await;

        let placeholder = engine
            .state()
            .transcript
            .last()
            .map(|message| message.key)
            .expect("placeholder");

        assert!(!engine.request_clear_from(placeholder).await.expect("request"));
        assert!(engine.state().active_alert.is_none());
    }

    #[tokio::test]
    async fn retry_clears_errors_and_replays_current_transcript() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[
            (StoredSource::User, "question"),
            (StoredSource::Error, "Network failed"),
        ]);
        let error_key = engine.state().transcript[1].key;

        assert!(engine.retry(error_key).await.expect("retry"));

        let state = engine.state();
        assert_eq!(
            sources(&state),
            vec![MessageSource::User, MessageSource::Receiving]
        );
        assert_eq!(
            stored_sources(&harness, engine.chat_id()),
            vec![StoredSource::User]
        );

        let opened = next_opened(&mut harness.opened).await;
        assert_eq!(
            opened.request.messages[1..],
            [ProviderMessage::new(Role::User, "question")]
        );
        opened.delta("answer");
        opened.done();

        let state = wait_for_state(&engine, |state| state.generation.is_idle()).await;
        assert_eq!(
            sources(&state),
            vec![MessageSource::User, MessageSource::Assistant]
        );
    }

    #[tokio::test]
    async fn retry_ignores_non_error_targets() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[(StoredSource::User, "question")]);
        let user_key = engine.state().transcript[0].key;

        assert!(!engine.retry(user_key).await.expect("retry"));
        assert!(harness.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_removes_placeholder_and_drops_later_events() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.submit_input("hi").await.expect("submit");
        let mut opened = next_opened(&mut harness.opened).await;

        assert!(engine.stop_generation().await.expect("stop"));
        assert!(!engine.stop_generation().await.expect("second stop"));

        assert!(opened.cancel.try_recv().is_ok());
        assert!(
            opened
                .events
                .send(StreamEventMapped {
                    session: opened.session(),
                    event: StreamEvent::Delta("late".to_string()),
                })
                .is_err()
        );

        let state = engine.state();
        assert_eq!(sources(&state), vec![MessageSource::User]);
        assert!(state.generation.is_idle());
    }

    #[tokio::test]
    async fn break_while_streaming_keeps_committed_content() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.submit_input("hi").await.expect("submit");
        let mut opened = next_opened(&mut harness.opened).await;
        opened.delta("partial");
        wait_for_state(&engine, |state| {
            matches!(state.generation, GenerationPhase::StreamingDelta { .. })
        })
        .await;

        assert!(engine.break_chat().await.expect("break"));
        assert!(!engine.break_chat().await.expect("second break"));

        assert!(opened.cancel.try_recv().is_ok());
        let state = engine.state();
        assert_eq!(
            sources(&state),
            vec![
                MessageSource::User,
                MessageSource::Assistant,
                MessageSource::Breaker
            ]
        );
        assert_eq!(state.transcript[1].content, "partial");
        assert!(state.generation.is_idle());
        assert_eq!(
            stored_sources(&harness, engine.chat_id()),
            vec![
                StoredSource::User,
                StoredSource::Assistant,
                StoredSource::Breaker
            ]
        );
    }

    #[tokio::test]
    async fn break_on_empty_transcript_is_a_no_op() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[]);

        assert!(!engine.break_chat().await.expect("break"));
        assert!(stored_sources(&harness, engine.chat_id()).is_empty());
    }

    #[tokio::test]
    async fn store_failure_mid_stream_aborts_generation() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        engine.submit_input("hi").await.expect("submit");
        let mut opened = next_opened(&mut harness.opened).await;
        opened.delta("first");
        wait_for_state(&engine, |state| {
            matches!(state.generation, GenerationPhase::StreamingDelta { .. })
        })
        .await;

        harness.storage.fail_updates(true);
        opened.delta(" second");

        let state = wait_for_state(&engine, |state| state.store_failure.is_some()).await;
        assert!(state.generation.is_idle());
        assert_eq!(
            sources(&state),
            vec![MessageSource::User, MessageSource::Assistant]
        );
        assert_eq!(state.transcript[1].content, "first");
        assert!(opened.cancel.try_recv().is_ok());

        let stored = harness
            .storage
            .list_messages(engine.chat_id())
            .expect("list");
        assert_eq!(stored[1].content, "first");

        harness.storage.fail_updates(false);
        engine.submit_input("again").await.expect("submit again");
        assert!(engine.state().store_failure.is_none());
    }

    #[tokio::test]
    async fn store_failure_on_submit_is_returned_without_mutation() {
        let mut harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        harness.storage.fail_inserts(true);

        let result = engine.submit_input("hi").await;

        assert!(matches!(result, Err(EngineError::Store { .. })));
        assert!(engine.state().transcript.is_empty());
        assert!(harness.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn edit_chat_rejects_out_of_range_temperature() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[]);
        let original = engine.chat();

        let result = engine
            .edit_chat(ChatDraft::new("Renamed", "New prompt").with_temperature(1.5))
            .await;

        assert!(matches!(result, Err(EngineError::Validation { .. })));
        assert_eq!(engine.chat(), original);
        let stored = harness
            .storage
            .get_chat(original.id)
            .expect("get chat")
            .expect("chat exists");
        assert_eq!(stored.name, original.name);

        engine.set_edit_dialog_open(true).await.expect("open dialog");
        let updated = engine
            .edit_chat(ChatDraft::new(" Renamed ", "New prompt").with_context_size(2))
            .await
            .expect("valid edit");
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.context_size, 2);
        assert!(updated.updated_at_unix_millis > original.updated_at_unix_millis);
        assert!(!engine.state().flags.edit_dialog_open);
    }

    #[tokio::test]
    async fn copy_and_flags_are_pure_state_reads_and_writes() {
        let harness = Harness::new();
        let engine = harness.spawn_engine(&[(StoredSource::Assistant, "copy me")]);
        let key = engine.state().transcript[0].key;

        assert_eq!(engine.copy_message(key), Some("copy me".to_string()));
        engine.set_export_dialog_open(true).await.expect("export");
        assert!(engine.state().flags.export_dialog_open);

        engine.shutdown().await;
        engine.shutdown().await;
        assert!(matches!(
            engine.set_export_dialog_open(false).await,
            Err(EngineError::EngineClosed { .. })
        ));
    }
}
