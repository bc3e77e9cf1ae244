use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};
use tokio::runtime::RuntimeFlavor;

use super::error::{
    ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
};
use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, StorageResult,
};
use super::ids::{ChatId, MessageId};
use super::types::{
    AppendedMessage, ChatFields, ChatRecord, MessageRecord, MessageSource, NewMessage,
};
use super::{ChatStore, MessageStore};

/// Takes the write lock up front; a deferred `BEGIN` that reads first cannot wait for it in WAL mode.
const WRITE_TRANSACTION: &str = "BEGIN IMMEDIATE";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite storage");

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        let join = move || worker.join();
        let joined = match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(join)
            }
            _ => join(),
        };

        match joined {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ChatStore for SqliteStorage {
    fn create_chat(&self, input: ChatFields) -> StorageResult<ChatRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-create", async move {
            let mut connection = connect_store_connection(&database_url, "chat-create-connect").await?;
            let mut tx = connection.begin_with(WRITE_TRANSACTION).await.context(SqliteQuerySnafu {
                stage: "chat-create-begin",
            })?;

            let now = allocate_chat_timestamp(&mut tx, "chat-create-timestamp").await?;
            let context_size = i64::from(input.context_size);

            let inserted = sqlx::query(
                "INSERT INTO chats (name, model, prompt, temperature, context_size, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(input.name.clone())
            .bind(input.model.clone())
            .bind(input.prompt.clone())
            .bind(input.temperature)
            .bind(context_size)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-create-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chat-create-commit",
            })?;

            Ok(ChatRecord {
                id: ChatId::new(inserted.last_insert_rowid()),
                name: input.name,
                model: input.model,
                prompt: input.prompt,
                temperature: input.temperature,
                context_size: input.context_size,
                updated_at_unix_millis: i64_to_u64(now, "chat-create-updated-at")?,
            })
        })
    }

    fn list_chats(&self) -> StorageResult<Vec<ChatRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-list", async move {
            let mut connection = connect_store_connection(&database_url, "chat-list-connect").await?;
            let rows = sqlx::query_as::<_, ChatRow>(
                "SELECT id, name, model, prompt, temperature, context_size, updated_at FROM chats ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-query",
            })?;

            rows.into_iter().map(chat_row_to_record).collect()
        })
    }

    fn get_chat(&self, chat_id: ChatId) -> StorageResult<Option<ChatRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-get", async move {
            let mut connection = connect_store_connection(&database_url, "chat-get-connect").await?;
            let row = load_chat_row(&mut connection, chat_id, "chat-get-query").await?;
            row.map(chat_row_to_record).transpose()
        })
    }

    fn update_chat(&self, chat_id: ChatId, input: ChatFields) -> StorageResult<ChatRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-update", async move {
            let mut connection = connect_store_connection(&database_url, "chat-update-connect").await?;
            let mut tx = connection.begin_with(WRITE_TRANSACTION).await.context(SqliteQuerySnafu {
                stage: "chat-update-begin",
            })?;

            let now = allocate_chat_timestamp(&mut tx, "chat-update-timestamp").await?;
            let update_result = sqlx::query(
                "UPDATE chats SET name = ?, model = ?, prompt = ?, temperature = ?, context_size = ?, updated_at = ? WHERE id = ?",
            )
            .bind(input.name)
            .bind(input.model)
            .bind(input.prompt)
            .bind(input.temperature)
            .bind(i64::from(input.context_size))
            .bind(now)
            .bind(chat_id.as_i64())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "chat-update-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }

            let row = load_chat_row(&mut tx, chat_id, "chat-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "chat-update-load-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chat-update-commit",
            })?;

            chat_row_to_record(row)
        })
    }

    fn delete_chat(&self, chat_id: ChatId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("chat-delete", async move {
            let mut connection = connect_store_connection(&database_url, "chat-delete-connect").await?;
            // Messages go with the chat through ON DELETE CASCADE.
            let result = sqlx::query("DELETE FROM chats WHERE id = ?")
                .bind(chat_id.as_i64())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "chat-delete-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn insert_message(
        &self,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<AppendedMessage> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-insert", async move {
            let mut connection = connect_store_connection(&database_url, "message-insert-connect").await?;
            let mut tx = connection.begin_with(WRITE_TRANSACTION).await.context(SqliteQuerySnafu {
                stage: "message-insert-begin",
            })?;

            ensure_chat_exists(&mut tx, chat_id, "message-insert-ensure-chat").await?;
            let now = allocate_chat_timestamp(&mut tx, "message-insert-timestamp").await?;

            let inserted = sqlx::query(
                "INSERT INTO messages (chat_id, source, content, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(chat_id.as_i64())
            .bind(input.source.as_str())
            .bind(input.content.clone())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-apply",
            })?;

            // Appends count as chat activity for recency ordering.
            sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(chat_id.as_i64())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-insert-touch-chat",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-insert-commit",
            })?;

            let created_at = i64_to_u64(now, "message-insert-created-at")?;
            Ok(AppendedMessage {
                message: MessageRecord {
                    id: MessageId::new(inserted.last_insert_rowid()),
                    chat_id,
                    source: input.source,
                    content: input.content,
                    created_at_unix_millis: created_at,
                },
                chat_updated_at_unix_millis: created_at,
            })
        })
    }

    fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: String,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-update", async move {
            let mut connection = connect_store_connection(&database_url, "message-update-connect").await?;
            let result = sqlx::query("UPDATE messages SET content = ? WHERE id = ? AND chat_id = ?")
                .bind(content)
                .bind(message_id.as_i64())
                .bind(chat_id.as_i64())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-update-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT id, chat_id, source, content, created_at FROM messages WHERE id = ? AND chat_id = ?",
            )
            .bind(message_id.as_i64())
            .bind(chat_id.as_i64())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "message-update-load-missing",
                entity: "message",
                id: message_id.to_string(),
            })?;

            message_row_to_record(row)
        })
    }

    fn delete_messages(&self, chat_id: ChatId, message_ids: &[MessageId]) -> StorageResult<u64> {
        let mut message_ids = message_ids.to_vec();
        message_ids.sort();
        message_ids.dedup();

        if message_ids.is_empty() {
            return Ok(0);
        }

        let database_url = self.database_url.clone();
        self.run_db_call("message-delete", async move {
            let mut connection = connect_store_connection(&database_url, "message-delete-connect").await?;
            let mut tx = connection.begin_with(WRITE_TRANSACTION).await.context(SqliteQuerySnafu {
                stage: "message-delete-begin",
            })?;

            let mut deleted = 0_u64;
            for message_id in &message_ids {
                let result = sqlx::query("DELETE FROM messages WHERE id = ? AND chat_id = ?")
                    .bind(message_id.as_i64())
                    .bind(chat_id.as_i64())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-delete-apply",
                    })?;
                deleted += result.rows_affected();
            }

            // Dropping the transaction without commit rolls back the partial batch.
            if deleted != message_ids.len() as u64 {
                return ConflictSnafu {
                    stage: "message-delete-partial",
                    entity: "message",
                    details: format!(
                        "expected to delete {} messages from chat {chat_id}, matched {deleted}",
                        message_ids.len()
                    ),
                }
                .fail();
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-delete-commit",
            })?;

            Ok(deleted)
        })
    }

    fn clear_messages(&self, chat_id: ChatId) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-clear", async move {
            let mut connection = connect_store_connection(&database_url, "message-clear-connect").await?;
            ensure_chat_exists(&mut connection, chat_id, "message-clear-ensure-chat").await?;
            let result = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
                .bind(chat_id.as_i64())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-clear-apply",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn clear_messages_by_source(
        &self,
        chat_id: ChatId,
        source: MessageSource,
    ) -> StorageResult<u64> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-clear-source", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-clear-source-connect").await?;
            ensure_chat_exists(&mut connection, chat_id, "message-clear-source-ensure-chat").await?;
            let result = sqlx::query("DELETE FROM messages WHERE chat_id = ? AND source = ?")
                .bind(chat_id.as_i64())
                .bind(source.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-clear-source-apply",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn list_messages(&self, chat_id: ChatId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection = connect_store_connection(&database_url, "message-list-connect").await?;
            ensure_chat_exists(&mut connection, chat_id, "message-list-ensure-chat").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, chat_id, source, content, created_at FROM messages WHERE chat_id = ? ORDER BY id ASC",
            )
            .bind(chat_id.as_i64())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: i64,
    name: String,
    model: String,
    prompt: String,
    temperature: f64,
    context_size: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    chat_id: i64,
    source: String,
    content: String,
    created_at: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::new(row.id),
        name: row.name,
        model: row.model,
        prompt: row.prompt,
        temperature: row.temperature,
        context_size: i64_to_u32(row.context_size, "chat-row-context-size")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::new(row.id),
        chat_id: ChatId::new(row.chat_id),
        source: source_from_sql(&row.source)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_chat_row(
    connection: &mut SqliteConnection,
    chat_id: ChatId,
    stage: &'static str,
) -> StorageResult<Option<ChatRow>> {
    sqlx::query_as::<_, ChatRow>(
        "SELECT id, name, model, prompt, temperature, context_size, updated_at FROM chats WHERE id = ?",
    )
    .bind(chat_id.as_i64())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })
}

async fn ensure_chat_exists(
    connection: &mut SqliteConnection,
    chat_id: ChatId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM chats WHERE id = ? LIMIT 1")
        .bind(chat_id.as_i64())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    if existing.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "chat",
            id: chat_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn allocate_chat_timestamp(
    connection: &mut SqliteConnection,
    stage: &'static str,
) -> StorageResult<i64> {
    let latest = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(updated_at) FROM chats")
        .fetch_one(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    Ok(next_timestamp(unix_timestamp_millis(), latest))
}

/// Recency stamps must be strictly increasing so ordering never depends on clock resolution.
pub(crate) fn next_timestamp(now: i64, latest: Option<i64>) -> i64 {
    match latest {
        Some(latest) if latest >= now => latest + 1,
        _ => now,
    }
}

fn source_from_sql(raw: &str) -> StorageResult<MessageSource> {
    MessageSource::parse(raw).context(InvariantViolationSnafu {
        stage: "message-row-source",
        details: format!("unknown message source '{raw}'"),
    })
}

pub(crate) fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
