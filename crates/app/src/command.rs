use colloquy_llm::ChatModel;
use colloquy_storage::ChatId;
use snafu::{OptionExt, Snafu, ensure};

pub const HELP: &str = "\
/new <name> | <prompt>   create a chat and switch to it
/list                    list chats, most recent first
/select <id>             switch to a chat
/show                    print the transcript with message numbers
/edit <field> <value>    field is name, prompt, model, temperature or context
/models                  list available models
/break                   start a fresh context
/retry                   retry the last failed reply
/stop                    stop the streaming reply
/clear                   clear all messages (asks first)
/clear-from <n>          clear message n and everything after it (asks first)
/confirm | /cancel       answer a pending clear prompt
/clear-errors            remove error messages
/copy <n>                print message n verbatim
/raw                     toggle raw text mode
/export                  print the transcript as plain text
/delete [id]             delete a chat (current one by default)
/settings                show provider settings
/key <api-key>           save the API key
/quit                    exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Empty,
    Message(String),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New { name: String, prompt: String },
    List,
    Select(ChatId),
    Show,
    Edit(EditField),
    Models,
    Break,
    Retry,
    Stop,
    Clear,
    ClearFrom(usize),
    Confirm,
    Cancel,
    ClearErrors,
    Copy(usize),
    Raw,
    Export,
    Delete(Option<ChatId>),
    Settings,
    Key(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditField {
    Name(String),
    Prompt(String),
    Model(ChatModel),
    Temperature(f64),
    ContextSize(u32),
}

#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`; try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("missing argument, usage: {usage}"))]
    MissingArgument {
        stage: &'static str,
        usage: &'static str,
    },
    #[snafu(display("invalid value `{value}`, usage: {usage}"))]
    InvalidArgument {
        stage: &'static str,
        value: String,
        usage: &'static str,
    },
}

/// Parses one terminal line. Lines not starting with `/` are chat input.
pub fn parse_input(line: &str) -> Result<Input, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Input::Message(line.to_string()));
    };

    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };

    let command = match name {
        "new" => {
            let usage = "/new <name> | <prompt>";
            let (chat_name, prompt) = rest.split_once('|').context(MissingArgumentSnafu {
                stage: "parse-new-command",
                usage,
            })?;
            Command::New {
                name: chat_name.trim().to_string(),
                prompt: prompt.trim().to_string(),
            }
        }
        "list" => Command::List,
        "select" => Command::Select(parse_chat_id(rest, "/select <id>")?),
        "show" => Command::Show,
        "edit" => Command::Edit(parse_edit(rest)?),
        "models" => Command::Models,
        "break" => Command::Break,
        "retry" => Command::Retry,
        "stop" => Command::Stop,
        "clear" => Command::Clear,
        "clear-from" => Command::ClearFrom(parse_position(rest, "/clear-from <n>")?),
        "confirm" | "yes" => Command::Confirm,
        "cancel" | "no" => Command::Cancel,
        "clear-errors" => Command::ClearErrors,
        "copy" => Command::Copy(parse_position(rest, "/copy <n>")?),
        "raw" => Command::Raw,
        "export" => Command::Export,
        "delete" if rest.is_empty() => Command::Delete(None),
        "delete" => Command::Delete(Some(parse_chat_id(rest, "/delete [id]")?)),
        "settings" => Command::Settings,
        "key" => {
            let usage = "/key <api-key>";
            ensure!(
                !rest.is_empty(),
                MissingArgumentSnafu {
                    stage: "parse-key-command",
                    usage,
                }
            );
            Command::Key(rest.to_string())
        }
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => {
            return UnknownCommandSnafu {
                stage: "parse-command-name",
                name: other.to_string(),
            }
            .fail();
        }
    };

    Ok(Input::Command(command))
}

fn parse_chat_id(raw: &str, usage: &'static str) -> Result<ChatId, CommandError> {
    ensure!(
        !raw.is_empty(),
        MissingArgumentSnafu {
            stage: "parse-chat-id",
            usage,
        }
    );
    ChatId::parse(raw).ok().context(InvalidArgumentSnafu {
        stage: "parse-chat-id",
        value: raw.to_string(),
        usage,
    })
}

/// One-based message number as printed by `/show`.
fn parse_position(raw: &str, usage: &'static str) -> Result<usize, CommandError> {
    ensure!(
        !raw.is_empty(),
        MissingArgumentSnafu {
            stage: "parse-message-number",
            usage,
        }
    );
    raw.parse::<usize>()
        .ok()
        .filter(|position| *position > 0)
        .context(InvalidArgumentSnafu {
            stage: "parse-message-number",
            value: raw.to_string(),
            usage,
        })
}

fn parse_edit(rest: &str) -> Result<EditField, CommandError> {
    let usage = "/edit <name|prompt|model|temperature|context> <value>";
    let (field, value) = rest
        .split_once(char::is_whitespace)
        .map(|(field, value)| (field, value.trim()))
        .context(MissingArgumentSnafu {
            stage: "parse-edit-command",
            usage,
        })?;

    let invalid = || InvalidArgumentSnafu {
        stage: "parse-edit-value",
        value: value.to_string(),
        usage,
    };

    match field {
        "name" => Ok(EditField::Name(value.to_string())),
        "prompt" => Ok(EditField::Prompt(value.to_string())),
        "model" => ChatModel::parse(value)
            .map(EditField::Model)
            .context(invalid()),
        "temperature" => value
            .parse::<f64>()
            .ok()
            .map(EditField::Temperature)
            .context(invalid()),
        "context" => value
            .parse::<u32>()
            .ok()
            .map(EditField::ContextSize)
            .context(invalid()),
        other => InvalidArgumentSnafu {
            stage: "parse-edit-field",
            value: other.to_string(),
            usage,
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_chat_input() {
        assert_eq!(parse_input("   "), Ok(Input::Empty));
        assert_eq!(
            parse_input("  what is rust?  "),
            Ok(Input::Message("what is rust?".to_string()))
        );
    }

    #[test]
    fn new_splits_name_and_prompt() {
        assert_eq!(
            parse_input("/new Tutor | You teach Rust."),
            Ok(Input::Command(Command::New {
                name: "Tutor".to_string(),
                prompt: "You teach Rust.".to_string(),
            }))
        );
        assert!(matches!(
            parse_input("/new Tutor"),
            Err(CommandError::MissingArgument { .. })
        ));
    }

    #[test]
    fn message_numbers_are_one_based() {
        assert_eq!(
            parse_input("/clear-from 3"),
            Ok(Input::Command(Command::ClearFrom(3)))
        );
        assert!(matches!(
            parse_input("/copy 0"),
            Err(CommandError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn edit_parses_typed_values() {
        assert_eq!(
            parse_input("/edit model gpt-4o"),
            Ok(Input::Command(Command::Edit(EditField::Model(
                ChatModel::Gpt4o
            ))))
        );
        assert_eq!(
            parse_input("/edit prompt Be brief and kind."),
            Ok(Input::Command(Command::Edit(EditField::Prompt(
                "Be brief and kind.".to_string()
            ))))
        );
        assert!(matches!(
            parse_input("/edit temperature warm"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parse_input("/edit colour blue"),
            Err(CommandError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn delete_defaults_to_current_chat() {
        assert_eq!(
            parse_input("/delete"),
            Ok(Input::Command(Command::Delete(None)))
        );
        assert_eq!(
            parse_input("/delete 7"),
            Ok(Input::Command(Command::Delete(Some(ChatId::new(7)))))
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            parse_input("/frobnicate now"),
            Err(CommandError::UnknownCommand {
                stage: "parse-command-name",
                name: "frobnicate".to_string(),
            })
        );
    }
}
