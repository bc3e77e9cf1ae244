use std::ops::RangeInclusive;

use colloquy_llm::ChatModel;
use colloquy_storage::{ChatFields, ChatId, ChatRecord};
use snafu::{Snafu, ensure};

pub const DEFAULT_TEMPERATURE: f64 = 0.3;
pub const DEFAULT_CONTEXT_SIZE: u32 = 4;
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const CONTEXT_SIZE_RANGE: RangeInclusive<u32> = 0..=10;

/// Chat metadata as held in memory by the registry and the owning engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub model: ChatModel,
    pub prompt: String,
    pub temperature: f64,
    pub context_size: u32,
    pub updated_at_unix_millis: u64,
}

impl Chat {
    pub(crate) fn from_record(record: ChatRecord) -> Self {
        let model = ChatModel::parse(&record.model).unwrap_or_else(|| {
            tracing::warn!(
                chat_id = %record.id,
                model = %record.model,
                fallback = %ChatModel::default(),
                "stored chat references an unknown model"
            );
            ChatModel::default()
        });

        Self {
            id: record.id,
            name: record.name,
            model,
            prompt: record.prompt,
            temperature: record.temperature,
            context_size: record.context_size,
            updated_at_unix_millis: record.updated_at_unix_millis,
        }
    }

    /// Editable fields of this chat, for prefilling an edit form.
    pub fn draft(&self) -> ChatDraft {
        ChatDraft {
            name: self.name.clone(),
            model: self.model,
            prompt: self.prompt.clone(),
            temperature: self.temperature,
            context_size: self.context_size,
        }
    }

    /// Orders chats most recently updated first, ties by descending id.
    pub fn sort_by_recency(chats: &mut [Chat]) {
        chats.sort_by(|left, right| {
            right
                .updated_at_unix_millis
                .cmp(&left.updated_at_unix_millis)
                .then(right.id.cmp(&left.id))
        });
    }
}

/// User-supplied metadata for creating or editing a chat.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatDraft {
    pub name: String,
    pub model: ChatModel,
    pub prompt: String,
    pub temperature: f64,
    pub context_size: u32,
}

impl ChatDraft {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: ChatModel::default(),
            prompt: prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
            context_size: DEFAULT_CONTEXT_SIZE,
        }
    }

    pub fn with_model(mut self, model: ChatModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    /// Checks the draft and returns the trimmed fields ready to persist.
    pub fn validate(&self) -> Result<ChatFields, ValidationError> {
        let name = self.name.trim();
        let prompt = self.prompt.trim();

        ensure!(!name.is_empty(), BlankNameSnafu { stage: "validate-chat-name" });
        ensure!(
            !prompt.is_empty(),
            BlankPromptSnafu {
                stage: "validate-chat-prompt"
            }
        );
        ensure!(
            TEMPERATURE_RANGE.contains(&self.temperature),
            TemperatureOutOfRangeSnafu {
                stage: "validate-chat-temperature",
                temperature: self.temperature,
            }
        );
        ensure!(
            CONTEXT_SIZE_RANGE.contains(&self.context_size),
            ContextSizeOutOfRangeSnafu {
                stage: "validate-chat-context-size",
                context_size: self.context_size,
            }
        );

        Ok(ChatFields {
            name: name.to_string(),
            model: self.model.as_str().to_string(),
            prompt: prompt.to_string(),
            temperature: self.temperature,
            context_size: self.context_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ValidationError {
    #[snafu(display("chat name must not be blank"))]
    BlankName { stage: &'static str },
    #[snafu(display("chat prompt must not be blank"))]
    BlankPrompt { stage: &'static str },
    #[snafu(display("temperature {temperature} is outside 0..=1"))]
    TemperatureOutOfRange {
        stage: &'static str,
        temperature: f64,
    },
    #[snafu(display("context size {context_size} is outside 0..=10"))]
    ContextSizeOutOfRange {
        stage: &'static str,
        context_size: u32,
    },
}
