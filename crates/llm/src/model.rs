use std::fmt;

/// Completion models a chat can be bound to, persisted by their wire identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChatModel {
    #[default]
    Gpt4oMini,
    Gpt4o,
    Gpt41,
    O3,
    Gpt4,
    Gpt4_0314,
    Gpt4_32k,
    Gpt4_32k0314,
    Gpt35Turbo,
    Gpt35Turbo0301,
}

pub const DEFAULT_OPENAI_MODEL: ChatModel = ChatModel::Gpt4oMini;

impl ChatModel {
    pub const ALL: [ChatModel; 10] = [
        ChatModel::Gpt4oMini,
        ChatModel::Gpt4o,
        ChatModel::Gpt41,
        ChatModel::O3,
        ChatModel::Gpt4,
        ChatModel::Gpt4_0314,
        ChatModel::Gpt4_32k,
        ChatModel::Gpt4_32k0314,
        ChatModel::Gpt35Turbo,
        ChatModel::Gpt35Turbo0301,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt4o => "gpt-4o",
            Self::Gpt41 => "gpt-4.1",
            Self::O3 => "o3",
            Self::Gpt4 => "gpt-4",
            Self::Gpt4_0314 => "gpt-4-0314",
            Self::Gpt4_32k => "gpt-4-32k",
            Self::Gpt4_32k0314 => "gpt-4-32k-0314",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
            Self::Gpt35Turbo0301 => "gpt-3.5-turbo-0301",
        }
    }

    pub const fn description(&self) -> &'static str {
        match self {
            Self::Gpt4oMini => "Balanced cost/performance default",
            Self::Gpt4o => "High quality general model",
            Self::Gpt41 => "Reasoning-forward GPT-4.1",
            Self::O3 => "Advanced reasoning model",
            Self::Gpt4 => "Legacy GPT-4",
            Self::Gpt4_0314 => "GPT-4 March 2023 snapshot",
            Self::Gpt4_32k => "Legacy GPT-4 with 32k context",
            Self::Gpt4_32k0314 => "GPT-4 32k March 2023 snapshot",
            Self::Gpt35Turbo => "Legacy fast model",
            Self::Gpt35Turbo0301 => "GPT-3.5 Turbo March 2023 snapshot",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|model| model.as_str() == raw)
    }
}

impl fmt::Display for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_identifiers() {
        assert_eq!(ChatModel::parse(" gpt-4.1 "), Some(ChatModel::Gpt41));
        assert_eq!(ChatModel::parse("gpt-3.5-turbo"), Some(ChatModel::Gpt35Turbo));
        assert_eq!(ChatModel::parse("claude"), None);
    }

    #[test]
    fn dated_snapshots_round_trip_through_their_identifiers() {
        for raw in ["gpt-3.5-turbo-0301", "gpt-4-0314", "gpt-4-32k", "gpt-4-32k-0314"] {
            let model = ChatModel::parse(raw).expect("known snapshot");
            assert_eq!(model.as_str(), raw);
        }
        assert_eq!(ChatModel::parse("gpt-4-32k"), Some(ChatModel::Gpt4_32k));
    }

    #[test]
    fn default_model_is_first_listed() {
        assert_eq!(ChatModel::default(), DEFAULT_OPENAI_MODEL);
        assert_eq!(ChatModel::ALL[0], ChatModel::default());
    }
}
