use std::sync::Arc;

use colloquy::error::{OpenStorageSnafu, ProviderSnafu, RegistrySnafu};
use colloquy::{AppResult, Runner, SettingsStore};
use colloquy_engine::{ChatRegistry, EngineDeps};
use colloquy_storage::SqliteStorage;
use snafu::ResultExt;

#[tokio::main]
async fn main() {
    // Logs go to stderr so streamed replies on stdout stay readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "colloquy exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let settings = Arc::new(SettingsStore::load());
    let current = settings.settings();

    let storage = SqliteStorage::open(&current.database_path)
        .await
        .context(OpenStorageSnafu {
            stage: "open-sqlite-storage",
            database_path: current.database_path.clone(),
        })?;
    let chat_stream = colloquy_llm::create_chat_stream(&current.provider_id).context(ProviderSnafu {
        stage: "create-chat-stream",
    })?;

    let deps = EngineDeps::new(Arc::new(storage), chat_stream, settings.provider_config());
    let registry = ChatRegistry::open(deps).await.context(RegistrySnafu {
        stage: "open-chat-registry",
    })?;

    tracing::info!(
        database = %current.database_path,
        provider = %current.provider_id,
        "colloquy ready"
    );

    Runner::new(Arc::new(registry), settings).run().await
}
