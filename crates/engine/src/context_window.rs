use colloquy_llm::{ProviderMessage, Role};

use super::message::{Message, MessageSource};

/// Outbound message list for one generation: the chat prompt plus recent turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    pub system: ProviderMessage,
    pub turns: Vec<ProviderMessage>,
}

impl ContextWindow {
    /// Scans back from the newest message to the first breaker and keeps the
    /// last `context_size + 1` user/assistant turns of that segment.
    pub fn build(prompt: &str, transcript: &[Message], context_size: u32) -> Self {
        let limit = context_size as usize + 1;
        let mut turns = transcript
            .iter()
            .rev()
            .take_while(|message| message.source != MessageSource::Breaker)
            .filter_map(|message| match message.source {
                MessageSource::User => Some(ProviderMessage::new(Role::User, &message.content)),
                MessageSource::Assistant => {
                    Some(ProviderMessage::new(Role::Assistant, &message.content))
                }
                MessageSource::Error | MessageSource::Breaker | MessageSource::Receiving => None,
            })
            .take(limit)
            .collect::<Vec<_>>();
        turns.reverse();

        Self {
            system: ProviderMessage::new(Role::System, prompt),
            turns,
        }
    }

    /// No turns means there is nothing to answer and no request should be made.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn into_messages(self) -> Vec<ProviderMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        messages.push(self.system);
        messages.extend(self.turns);
        messages
    }
}
