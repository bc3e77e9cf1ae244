use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use colloquy_llm::{ChatModel, DEFAULT_OPENAI_MODEL, ProviderConfig, RIG_OPENAI_PROVIDER_ID};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "colloquy";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "colloquy.sqlite";
pub const ENV_PREFIX: &str = "COLLOQUY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_model_name")]
    pub default_model: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            database_path: default_database_path(),
            default_model: default_model_name(),
        }
    }
}

impl AppSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn default_model(&self) -> ChatModel {
        ChatModel::parse(&self.default_model).unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.database_path = non_blank_or(self.database_path, default_database_path);

        // Unknown model names fall back so new chats always get a usable model.
        self.default_model = match ChatModel::parse(&self.default_model) {
            Some(model) => model.as_str().to_string(),
            None => {
                if !self.default_model.trim().is_empty() {
                    tracing::warn!(
                        model = %self.default_model,
                        fallback = %DEFAULT_OPENAI_MODEL,
                        "unknown default model in settings"
                    );
                }
                default_model_name()
            }
        };

        self
    }
}

/// Live settings plus the provider config snapshot engines read per generation.
pub struct SettingsStore {
    settings: ArcSwap<AppSettings>,
    provider_config: Arc<ArcSwap<ProviderConfig>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".colloquy"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(Self::figment(&config_path), &config_path);
        Self::with_settings(settings, config_path)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn with_settings(settings: AppSettings, config_path: PathBuf) -> Self {
        let provider_config = Arc::new(ArcSwap::from_pointee(settings.to_provider_config()));
        Self {
            settings: ArcSwap::from_pointee(settings),
            provider_config,
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Shared handle engines read at the start of every generation.
    pub fn provider_config(&self) -> Arc<ArcSwap<ProviderConfig>> {
        self.provider_config.clone()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.provider_config
            .store(Arc::new(normalized_settings.to_provider_config()));
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `COLLOQUY_*` environment variables.
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn load_from(figment: Figment, path: &Path) -> AppSettings {
        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings; using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    RIG_OPENAI_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model_name() -> String {
    DEFAULT_OPENAI_MODEL.as_str().to_string()
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".colloquy"))
        .join(DATABASE_FILE_NAME)
        .display()
        .to_string()
}
