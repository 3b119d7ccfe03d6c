use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox::LocalStore;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    Attachment, ChannelId, ClientOperationId, LocalMessage, MessageId, MessageStatus,
    OperationPayload, OperationStatus, OutgoingOperation, ServerVersion,
};

const LOCAL_MESSAGE_COLUMNS: &str =
    "client_message_id, server_message_id, channel_id, text, attachments_json, status, created_at, sent_at";

const PENDING_COLUMNS: &str =
    "client_operation_id, client_message_id, channel_id, payload_json, status, retry_count, created_at, last_error";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_local_messages(&self, channel_id: &ChannelId) -> Result<Vec<LocalMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOCAL_MESSAGE_COLUMNS} FROM local_messages WHERE channel_id = ? ORDER BY created_at, client_message_id"
        ))
        .bind(channel_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(local_message_from_row).collect()
    }
}

#[async_trait]
impl LocalStore for Storage {
    async fn store_local_message(&self, message: &LocalMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_messages (client_message_id, server_message_id, channel_id, text, attachments_json, status, created_at, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(client_message_id) DO UPDATE SET
                server_message_id = excluded.server_message_id,
                channel_id = excluded.channel_id,
                text = excluded.text,
                attachments_json = excluded.attachments_json,
                status = excluded.status,
                sent_at = excluded.sent_at",
        )
        .bind(message.client_message_id.as_str())
        .bind(message.server_message_id.as_ref().map(MessageId::as_str))
        .bind(message.channel_id.as_str())
        .bind(&message.text)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(message.status.as_str())
        .bind(message.created_at)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store local message {}", message.client_message_id))?;
        Ok(())
    }

    async fn update_local_message(&self, message: &LocalMessage) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE local_messages
             SET server_message_id = ?, text = ?, attachments_json = ?, status = ?, sent_at = ?
             WHERE client_message_id = ?",
        )
        .bind(message.server_message_id.as_ref().map(MessageId::as_str))
        .bind(&message.text)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(message.status.as_str())
        .bind(message.sent_at)
        .bind(message.client_message_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(anyhow!(
                "local message {} does not exist",
                message.client_message_id
            ));
        }
        Ok(())
    }

    async fn get_local_message(&self, id: &ClientOperationId) -> Result<Option<LocalMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {LOCAL_MESSAGE_COLUMNS} FROM local_messages WHERE client_message_id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(local_message_from_row).transpose()
    }

    async fn find_local_message_by_server_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<LocalMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {LOCAL_MESSAGE_COLUMNS} FROM local_messages WHERE server_message_id = ?"
        ))
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(local_message_from_row).transpose()
    }

    async fn remove_local_message(&self, id: &ClientOperationId) -> Result<()> {
        sqlx::query("DELETE FROM local_messages WHERE client_message_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_pending(&self, operation: &OutgoingOperation) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_operations (client_operation_id, client_message_id, channel_id, kind, payload_json, status, retry_count, created_at, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(operation.client_operation_id.as_str())
        .bind(operation.client_message_id.as_str())
        .bind(operation.channel_id.as_str())
        .bind(operation.kind().as_str())
        .bind(serde_json::to_string(&operation.payload)?)
        .bind(operation.status.as_str())
        .bind(i64::from(operation.retry_count))
        .bind(operation.created_at)
        .bind(operation.last_error.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to queue operation {}",
                operation.client_operation_id
            )
        })?;
        Ok(())
    }

    async fn update_pending(&self, operation: &OutgoingOperation) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE pending_operations
             SET payload_json = ?, status = ?, retry_count = ?, last_error = ?
             WHERE client_operation_id = ?",
        )
        .bind(serde_json::to_string(&operation.payload)?)
        .bind(operation.status.as_str())
        .bind(i64::from(operation.retry_count))
        .bind(operation.last_error.as_deref())
        .bind(operation.client_operation_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(anyhow!(
                "pending operation {} does not exist",
                operation.client_operation_id
            ));
        }
        Ok(())
    }

    async fn remove_pending(&self, id: &ClientOperationId) -> Result<()> {
        sqlx::query("DELETE FROM pending_operations WHERE client_operation_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pending_message(
        &self,
        id: &ClientOperationId,
    ) -> Result<Option<OutgoingOperation>> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_operations WHERE client_operation_id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    async fn get_pending(&self) -> Result<Vec<OutgoingOperation>> {
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_operations ORDER BY created_at, client_operation_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(operation_from_row).collect()
    }

    async fn store_server_version(&self, version: &ServerVersion) -> Result<()> {
        sqlx::query(
            "INSERT INTO server_versions (message_id, text, updated_at, version) VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET text = excluded.text, updated_at = excluded.updated_at, version = excluded.version",
        )
        .bind(version.message_id.as_str())
        .bind(&version.text)
        .bind(version.updated_at)
        .bind(i64::try_from(version.version).context("server version out of range")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_server_version(&self, message_id: &MessageId) -> Result<Option<ServerVersion>> {
        let row = sqlx::query(
            "SELECT message_id, text, updated_at, version FROM server_versions WHERE message_id = ?",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(server_version_from_row).transpose()
    }
}

fn server_version_from_row(r: &SqliteRow) -> Result<ServerVersion> {
    Ok(ServerVersion {
        message_id: MessageId(r.get::<String, _>(0)),
        text: r.get::<String, _>(1),
        updated_at: r.get::<DateTime<Utc>, _>(2),
        version: u64::try_from(r.get::<i64, _>(3)).context("negative server version")?,
    })
}

fn local_message_from_row(r: &SqliteRow) -> Result<LocalMessage> {
    let attachments: Vec<Attachment> = serde_json::from_str(&r.get::<String, _>(4))
        .context("invalid attachments_json in local_messages")?;
    Ok(LocalMessage {
        client_message_id: ClientOperationId(r.get::<String, _>(0)),
        server_message_id: r.get::<Option<String>, _>(1).map(MessageId),
        channel_id: ChannelId(r.get::<String, _>(2)),
        text: r.get::<String, _>(3),
        attachments,
        status: message_status(&r.get::<String, _>(5))?,
        created_at: r.get::<DateTime<Utc>, _>(6),
        sent_at: r.get::<Option<DateTime<Utc>>, _>(7),
    })
}

fn operation_from_row(r: &SqliteRow) -> Result<OutgoingOperation> {
    let payload: OperationPayload = serde_json::from_str(&r.get::<String, _>(3))
        .context("invalid payload_json in pending_operations")?;
    Ok(OutgoingOperation {
        client_operation_id: ClientOperationId(r.get::<String, _>(0)),
        client_message_id: ClientOperationId(r.get::<String, _>(1)),
        channel_id: ChannelId(r.get::<String, _>(2)),
        payload,
        status: operation_status(&r.get::<String, _>(4))?,
        retry_count: u32::try_from(r.get::<i64, _>(5)).context("retry_count out of range")?,
        created_at: r.get::<DateTime<Utc>, _>(6),
        last_error: r.get::<Option<String>, _>(7),
    })
}

fn message_status(raw: &str) -> Result<MessageStatus> {
    match raw {
        "sending" => Ok(MessageStatus::Sending),
        "sent" => Ok(MessageStatus::Sent),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(anyhow!("unknown message status '{other}'")),
    }
}

fn operation_status(raw: &str) -> Result<OperationStatus> {
    match raw {
        "pending" => Ok(OperationStatus::Pending),
        "sending" => Ok(OperationStatus::Sending),
        "failed" => Ok(OperationStatus::Failed),
        other => Err(anyhow!("unknown operation status '{other}'")),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
