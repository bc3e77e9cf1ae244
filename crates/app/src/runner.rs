use std::io::Write as _;
use std::sync::Arc;

use colloquy_engine::{
    ChatDraft, ChatRegistry, EngineHandle, EngineResult, MessageKey, MessageSource,
};
use colloquy_llm::ChatModel;
use colloquy_storage::ChatId;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::command::{Command, EditField, HELP, Input, parse_input};
use crate::error::{AppResult, TerminalSnafu};
use crate::render::{render_chat_line, render_transcript, render_update};
use crate::settings::{AppSettings, SettingsStore};

enum Flow {
    Continue,
    Quit,
}

/// Line-oriented terminal front end over the chat registry.
pub struct Runner {
    registry: Arc<ChatRegistry>,
    settings: Arc<SettingsStore>,
    watcher: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(registry: Arc<ChatRegistry>, settings: Arc<SettingsStore>) -> Self {
        Self {
            registry,
            settings,
            watcher: None,
        }
    }

    pub async fn run(mut self) -> AppResult<()> {
        println!("colloquy: type a message, or /help for commands");
        if let Some(chat) = self.registry.current_chat().await {
            if let Err(error) = self.select(chat.id).await {
                println!("error: {error}");
            }
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context(TerminalSnafu {
            stage: "read-terminal-line",
        })? {
            let input = match parse_input(&line) {
                Ok(input) => input,
                Err(error) => {
                    println!("{error}");
                    continue;
                }
            };

            match self.handle(input).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(error) => {
                    tracing::debug!(stage = error.stage(), error = %error, "command failed");
                    println!("error: {error}");
                }
            }
        }

        self.detach();
        self.registry.shutdown().await;
        Ok(())
    }

    async fn handle(&mut self, input: Input) -> EngineResult<Flow> {
        let command = match input {
            Input::Empty => return Ok(Flow::Continue),
            Input::Message(text) => {
                if let Some(engine) = self.current_engine().await? {
                    if !engine.submit_input(text).await? {
                        println!("a reply is still in progress; /stop it first");
                    }
                }
                return Ok(Flow::Continue);
            }
            Input::Command(command) => command,
        };

        match command {
            Command::Quit => return Ok(Flow::Quit),
            Command::Help => println!("{HELP}"),
            Command::Models => {
                for model in ChatModel::ALL {
                    println!("{:<20} {}", model.as_str(), model.description());
                }
            }
            Command::Settings => self.print_settings(),
            Command::Key(api_key) => {
                let settings = AppSettings {
                    api_key,
                    ..self.settings.settings().as_ref().clone()
                };
                match self.settings.update(settings) {
                    Ok(()) => println!("API key saved"),
                    Err(error) => println!("error: {error}"),
                }
            }
            Command::New { name, prompt } => {
                let draft =
                    ChatDraft::new(name, prompt).with_model(self.settings.settings().default_model());
                let chat = self.registry.create_chat(draft).await?;
                self.select(chat.id).await?;
            }
            Command::List => {
                let current = self.registry.current_chat().await.map(|chat| chat.id);
                for chat in self.registry.list_chats().await {
                    println!("{}", render_chat_line(&chat, Some(chat.id) == current));
                }
            }
            Command::Select(chat_id) => self.select(chat_id).await?,
            Command::Delete(chat_id) => self.delete(chat_id).await?,
            command => {
                if let Some(engine) = self.current_engine().await? {
                    Self::handle_chat_command(&engine, command).await?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_chat_command(engine: &EngineHandle, command: Command) -> EngineResult<()> {
        match command {
            Command::Show => print!("{}", render_transcript(&engine.state().transcript)),
            Command::Edit(field) => {
                let mut draft = engine.chat().draft();
                match field {
                    EditField::Name(name) => draft.name = name,
                    EditField::Prompt(prompt) => draft.prompt = prompt,
                    EditField::Model(model) => draft.model = model,
                    EditField::Temperature(temperature) => draft.temperature = temperature,
                    EditField::ContextSize(context_size) => draft.context_size = context_size,
                }

                engine.set_edit_dialog_open(true).await?;
                match engine.edit_chat(draft).await {
                    Ok(chat) => println!("updated {}", render_chat_line(&chat, true).trim()),
                    Err(error) => {
                        engine.set_edit_dialog_open(false).await?;
                        return Err(error);
                    }
                }
            }
            Command::Break => {
                if !engine.break_chat().await? {
                    println!("nothing to break");
                }
            }
            Command::Retry => {
                let target = engine
                    .state()
                    .transcript
                    .iter()
                    .rev()
                    .find(|message| message.source == MessageSource::Error)
                    .map(|message| message.key);
                let Some(key) = target else {
                    println!("no failed reply to retry");
                    return Ok(());
                };
                if !engine.retry(key).await? {
                    println!("cannot retry while a reply is in progress");
                }
            }
            Command::Stop => {
                if !engine.stop_generation().await? {
                    println!("no reply in progress");
                }
            }
            Command::Clear => engine.request_clear_all().await?,
            Command::ClearFrom(position) => {
                let Some(key) = message_key(engine, position) else {
                    println!("no message {position}");
                    return Ok(());
                };
                if !engine.request_clear_from(key).await? {
                    println!("message {position} cannot be cleared");
                }
            }
            Command::Confirm => {
                if !engine.confirm().await? {
                    println!("nothing to confirm");
                }
            }
            Command::Cancel => engine.dismiss_alert().await?,
            Command::ClearErrors => {
                let removed = engine.clear_errors().await?;
                println!("removed {removed} error message(s)");
            }
            Command::Copy(position) => {
                match message_key(engine, position).and_then(|key| engine.copy_message(key)) {
                    Some(content) => println!("{content}"),
                    None => println!("no message {position}"),
                }
            }
            Command::Raw => {
                if engine.toggle_raw_text_mode().await? {
                    println!("{}", engine.state().transcript_text());
                } else {
                    println!("raw text mode off");
                }
            }
            Command::Export => {
                engine.set_export_dialog_open(true).await?;
                println!("{}", engine.state().transcript_text());
                engine.set_export_dialog_open(false).await?;
            }
            Command::New { .. }
            | Command::List
            | Command::Select(_)
            | Command::Delete(_)
            | Command::Models
            | Command::Settings
            | Command::Key(_)
            | Command::Help
            | Command::Quit => {}
        }
        Ok(())
    }

    async fn current_engine(&mut self) -> EngineResult<Option<EngineHandle>> {
        let Some(chat) = self.registry.current_chat().await else {
            println!("no chat yet; create one with /new <name> | <prompt>");
            return Ok(None);
        };
        let engine = self.registry.select_chat(chat.id).await?;
        if self.watcher.is_none() {
            self.attach(&engine);
        }
        Ok(Some(engine))
    }

    async fn select(&mut self, chat_id: ChatId) -> EngineResult<()> {
        let engine = self.registry.select_chat(chat_id).await?;
        let state = engine.state();
        println!("── {} ({})", state.chat.name, state.chat.model);
        print!("{}", render_transcript(&state.transcript));
        self.attach(&engine);
        Ok(())
    }

    async fn delete(&mut self, chat_id: Option<ChatId>) -> EngineResult<()> {
        let target = match chat_id {
            Some(chat_id) => Some(chat_id),
            None => self.registry.current_chat().await.map(|chat| chat.id),
        };
        let Some(target) = target else {
            println!("no chat to delete");
            return Ok(());
        };

        self.registry.delete_chat(target).await?;
        self.detach();
        println!("deleted chat {target}");

        if let Some(chat) = self.registry.current_chat().await {
            self.select(chat.id).await?;
        }
        Ok(())
    }

    fn print_settings(&self) {
        let settings = self.settings.settings();
        let key_state = if settings.api_key.is_empty() {
            "not set"
        } else {
            "set"
        };
        println!("settings file: {}", self.settings.config_path().display());
        println!("provider:      {}", settings.provider_id);
        println!("endpoint:      {}", settings.endpoint);
        println!("api key:       {key_state}");
        println!("default model: {}", settings.default_model);
        println!("database:      {}", settings.database_path);
    }

    /// Streams printable updates of `engine` to stdout until replaced.
    fn attach(&mut self, engine: &EngineHandle) {
        self.detach();

        let mut receiver = engine.subscribe();
        self.watcher = Some(tokio::spawn(async move {
            let mut previous = receiver.borrow_and_update().clone();
            while receiver.changed().await.is_ok() {
                let current = receiver.borrow_and_update().clone();
                let rendered = render_update(&previous, &current);
                if !rendered.is_empty() {
                    print!("{rendered}");
                    let _ = std::io::stdout().flush();
                }
                previous = current;
            }
        }));
    }

    fn detach(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

fn message_key(engine: &EngineHandle, position: usize) -> Option<MessageKey> {
    engine
        .state()
        .transcript
        .get(position.checked_sub(1)?)
        .map(|message| message.key)
}
