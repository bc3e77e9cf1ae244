use colloquy_llm::StreamSessionId;
use colloquy_storage::MessageId;

use super::chat::Chat;
use super::message::{Message, MessageKey, MessageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConversationFlags {
    pub edit_dialog_open: bool,
    pub raw_text_mode_on: bool,
    pub export_dialog_open: bool,
}

/// Destructive action waiting behind a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmableAction {
    ClearAll,
    ClearFrom(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertButtonRole {
    Cancel,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertButton {
    pub label: &'static str,
    pub role: AlertButtonRole,
}

/// Confirmation prompt shown before a destructive action runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDescriptor {
    pub title: &'static str,
    pub buttons: Vec<AlertButton>,
}

impl AlertDescriptor {
    pub fn for_action(action: ConfirmableAction) -> Self {
        let title = match action {
            ConfirmableAction::ClearAll => "Clear all messages?",
            ConfirmableAction::ClearFrom(_) => "Clear from bottom to this message?",
        };

        Self {
            title,
            buttons: vec![
                AlertButton {
                    label: "Cancel",
                    role: AlertButtonRole::Cancel,
                },
                AlertButton {
                    label: "Clear",
                    role: AlertButtonRole::Destructive,
                },
            ],
        }
    }
}

/// Lifecycle of the single generation a chat may have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationPhase {
    #[default]
    Idle,
    AwaitingFirstDelta(StreamSessionId),
    StreamingDelta {
        session: StreamSessionId,
        message_id: MessageId,
    },
    Finalizing(StreamSessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationTransition {
    Start(StreamSessionId),
    FirstDelta {
        session: StreamSessionId,
        message_id: MessageId,
    },
    Complete(StreamSessionId),
    Fail(StreamSessionId),
    Settle(StreamSessionId),
    Cancel(StreamSessionId),
}

/// Why a generation transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationRejection {
    AlreadyGenerating {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
    NoActiveGeneration,
    SessionMismatch {
        active: StreamSessionId,
        attempted: StreamSessionId,
    },
    UnexpectedPhase {
        phase: &'static str,
        transition: &'static str,
    },
}

pub type GenerationResult = Result<GenerationPhase, GenerationRejection>;

impl GenerationPhase {
    pub fn session(&self) -> Option<StreamSessionId> {
        match self {
            Self::Idle => None,
            Self::AwaitingFirstDelta(session)
            | Self::StreamingDelta { session, .. }
            | Self::Finalizing(session) => Some(*session),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingFirstDelta(_) => "awaiting-first-delta",
            Self::StreamingDelta { .. } => "streaming-delta",
            Self::Finalizing(_) => "finalizing",
        }
    }

    /// Applies one transition; every non-start transition must name the active session.
    pub fn apply(&self, transition: GenerationTransition) -> GenerationResult {
        if let GenerationTransition::Start(attempted) = transition {
            return match self.session() {
                Some(active) => Err(GenerationRejection::AlreadyGenerating { active, attempted }),
                None => Ok(Self::AwaitingFirstDelta(attempted)),
            };
        }

        let attempted = transition.session();
        let Some(active) = self.session() else {
            return Err(GenerationRejection::NoActiveGeneration);
        };
        if active != attempted {
            return Err(GenerationRejection::SessionMismatch { active, attempted });
        }

        match (self, transition) {
            (Self::AwaitingFirstDelta(_), GenerationTransition::FirstDelta { message_id, .. }) => {
                Ok(Self::StreamingDelta {
                    session: active,
                    message_id,
                })
            }
            (
                Self::AwaitingFirstDelta(_) | Self::StreamingDelta { .. },
                GenerationTransition::Complete(_),
            ) => Ok(Self::Idle),
            (
                Self::AwaitingFirstDelta(_) | Self::StreamingDelta { .. },
                GenerationTransition::Fail(_),
            ) => Ok(Self::Finalizing(active)),
            (Self::Finalizing(_), GenerationTransition::Settle(_)) => Ok(Self::Idle),
            (_, GenerationTransition::Cancel(_)) => Ok(Self::Idle),
            (phase, transition) => Err(GenerationRejection::UnexpectedPhase {
                phase: phase.name(),
                transition: transition.name(),
            }),
        }
    }
}

impl GenerationTransition {
    const fn session(&self) -> StreamSessionId {
        match self {
            Self::Start(session)
            | Self::FirstDelta { session, .. }
            | Self::Complete(session)
            | Self::Fail(session)
            | Self::Settle(session)
            | Self::Cancel(session) => *session,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::FirstDelta { .. } => "first-delta",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Settle(_) => "settle",
            Self::Cancel(_) => "cancel",
        }
    }
}

/// Observable state of one chat, published after every engine step.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub chat: Chat,
    pub transcript: Vec<Message>,
    pub pending_input: String,
    pub flags: ConversationFlags,
    pub active_alert: Option<AlertDescriptor>,
    pub pending_confirmation: Option<ConfirmableAction>,
    pub generation: GenerationPhase,
    /// Last store write that failed outside a caller's request; cleared by the next success.
    pub store_failure: Option<String>,
}

impl ConversationState {
    pub fn new(chat: Chat, transcript: Vec<Message>) -> Self {
        Self {
            chat,
            transcript,
            pending_input: String::new(),
            flags: ConversationFlags::default(),
            active_alert: None,
            pending_confirmation: None,
            generation: GenerationPhase::Idle,
            store_failure: None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.transcript.iter().any(Message::is_receiving)
    }

    pub fn message(&self, key: MessageKey) -> Option<&Message> {
        self.transcript.iter().find(|message| message.key == key)
    }

    pub fn position(&self, key: MessageKey) -> Option<usize> {
        self.transcript.iter().position(|message| message.key == key)
    }

    pub fn apply_generation(&mut self, transition: GenerationTransition) -> GenerationResult {
        let next = self.generation.apply(transition)?;
        self.generation = next;
        Ok(next)
    }

    /// Plain-text rendering of the conversation used by raw text mode and export.
    pub fn transcript_text(&self) -> String {
        self.transcript
            .iter()
            .filter_map(|message| match message.source {
                MessageSource::User => Some(format!("🙂 {}", message.content)),
                MessageSource::Assistant => Some(format!("🤖 {}", message.content)),
                MessageSource::Breaker => Some("---".to_string()),
                MessageSource::Error | MessageSource::Receiving => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_llm::ChatModel;
    use colloquy_storage::ChatId;

    fn chat() -> Chat {
        Chat {
            id: ChatId::new(1),
            name: "chat".to_string(),
            model: ChatModel::default(),
            prompt: "prompt".to_string(),
            temperature: 0.3,
            context_size: 4,
            updated_at_unix_millis: 1,
        }
    }

    fn stored(id: i64, source: MessageSource, content: &str) -> Message {
        Message {
            key: MessageKey::Stored(MessageId::new(id)),
            chat_id: ChatId::new(1),
            source,
            content: content.to_string(),
        }
    }

    #[test]
    fn second_start_is_rejected_while_generating() {
        let first = StreamSessionId::new();
        let second = StreamSessionId::new();
        let phase = GenerationPhase::Idle
            .apply(GenerationTransition::Start(first))
            .expect("start from idle");

        assert_eq!(
            phase.apply(GenerationTransition::Start(second)),
            Err(GenerationRejection::AlreadyGenerating {
                active: first,
                attempted: second,
            })
        );
    }

    #[test]
    fn full_lifecycle_returns_to_idle() {
        let session = StreamSessionId::new();
        let message_id = MessageId::new(9);
        let mut phase = GenerationPhase::Idle;

        for transition in [
            GenerationTransition::Start(session),
            GenerationTransition::FirstDelta {
                session,
                message_id,
            },
            GenerationTransition::Fail(session),
            GenerationTransition::Settle(session),
        ] {
            phase = phase.apply(transition).expect("legal transition");
        }

        assert_eq!(phase, GenerationPhase::Idle);
    }

    #[test]
    fn stale_and_out_of_order_transitions_are_rejected() {
        let session = StreamSessionId::new();
        let stale = StreamSessionId::new();
        let awaiting = GenerationPhase::AwaitingFirstDelta(session);

        assert!(matches!(
            awaiting.apply(GenerationTransition::Complete(stale)),
            Err(GenerationRejection::SessionMismatch { .. })
        ));
        assert_eq!(
            awaiting.apply(GenerationTransition::Settle(session)),
            Err(GenerationRejection::UnexpectedPhase {
                phase: "awaiting-first-delta",
                transition: "settle",
            })
        );
        assert_eq!(
            GenerationPhase::Idle.apply(GenerationTransition::Cancel(session)),
            Err(GenerationRejection::NoActiveGeneration)
        );
    }

    #[test]
    fn transcript_text_renders_speakers_and_breakers() {
        let mut state = ConversationState::new(
            chat(),
            vec![
                stored(1, MessageSource::User, "hi"),
                stored(2, MessageSource::Assistant, "hello"),
                stored(3, MessageSource::Error, "Network failed"),
                stored(4, MessageSource::Breaker, ""),
                stored(5, MessageSource::User, "next"),
            ],
        );
        state
            .transcript
            .push(Message::receiving(ChatId::new(1), StreamSessionId::new()));

        assert_eq!(state.transcript_text(), "🙂 hi\n\n🤖 hello\n\n---\n\n🙂 next");
        assert!(state.is_receiving());
    }

    #[test]
    fn alert_titles_follow_the_guarded_action() {
        let clear_all = AlertDescriptor::for_action(ConfirmableAction::ClearAll);
        let clear_from =
            AlertDescriptor::for_action(ConfirmableAction::ClearFrom(MessageId::new(3)));

        assert_eq!(clear_all.title, "Clear all messages?");
        assert_eq!(clear_from.title, "Clear from bottom to this message?");
        assert_eq!(clear_all.buttons.len(), 2);
        assert_eq!(clear_all.buttons[1].role, AlertButtonRole::Destructive);
    }
}
