use colloquy_engine::EngineError;
use colloquy_llm::ProviderError;
use colloquy_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("failed to open chat storage at `{database_path}` on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        database_path: String,
        source: StorageError,
    },
    #[snafu(display("chat stream provider is unavailable on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to load chats on `{stage}`: {source}"))]
    Registry {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
