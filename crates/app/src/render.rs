use std::fmt::Write as _;

use colloquy_engine::{Chat, ConversationState, Message, MessageSource};

/// Text to print for the change between two published states of the watched chat.
///
/// Assistant replies print incrementally as deltas land; errors, prompts and
/// storage failures print once when they first appear.
pub fn render_update(previous: &ConversationState, current: &ConversationState) -> String {
    let mut output = String::new();

    for message in &current.transcript {
        let earlier = previous.message(message.key);
        match message.source {
            MessageSource::Assistant => {
                let printed = earlier.map_or(0, |earlier| earlier.content.len());
                if let Some(fresh) = message.content.get(printed..) {
                    if !fresh.is_empty() {
                        if printed == 0 {
                            output.push_str("🤖 ");
                        }
                        output.push_str(fresh);
                    }
                }
            }
            MessageSource::Error if earlier.is_none() => {
                let _ = writeln!(output, "\n[error] {}", message.content);
            }
            _ => {}
        }
    }

    if !previous.generation.is_idle() && current.generation.is_idle() {
        output.push('\n');
    }

    if previous.active_alert.is_none() {
        if let Some(alert) = &current.active_alert {
            let _ = writeln!(output, "{} (/confirm or /cancel)", alert.title);
        }
    }

    if previous.store_failure.is_none() {
        if let Some(failure) = &current.store_failure {
            let _ = writeln!(output, "[storage] {failure}");
        }
    }

    output
}

pub fn render_transcript(transcript: &[Message]) -> String {
    let mut output = String::new();
    for (index, message) in transcript.iter().enumerate() {
        let number = index + 1;
        let _ = match message.source {
            MessageSource::User => writeln!(output, "{number:>3} 🙂 {}", message.content),
            MessageSource::Assistant => writeln!(output, "{number:>3} 🤖 {}", message.content),
            MessageSource::Error => writeln!(output, "{number:>3} [error] {}", message.content),
            MessageSource::Breaker => writeln!(output, "{number:>3} ---"),
            MessageSource::Receiving => writeln!(output, "{number:>3} 🤖 …"),
        };
    }
    output
}

pub fn render_chat_line(chat: &Chat, current: bool) -> String {
    format!(
        "{} {:>4}  {}  [{} t={} ctx={}]",
        if current { "*" } else { " " },
        chat.id.to_string(),
        chat.name,
        chat.model,
        chat.temperature,
        chat.context_size
    )
}
