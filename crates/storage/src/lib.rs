use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mls::{EpochSecret, GroupSnapshot, MlsStore};
use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Executor, Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::debug;

use shared::domain::{ConversationId, DecryptedPlaintext, MessageId, ReadReceipt, UserId};

#[derive(Debug, Clone, Copy)]
pub struct StorageOptions {
    /// Upper bound for any single statement waiting on another process's lock.
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(3),
            max_connections: 5,
        }
    }
}

/// One local user's database: plaintext cache, processed-message ledger,
/// group-state snapshots, identity keys and read receipts. Shared by every
/// process on the device that acts for this user.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Serialized MLS state plus the revision it was saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMlsState {
    pub state: Vec<u8>,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub epoch: u64,
    pub processed_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, StorageOptions::default()).await
    }

    pub async fn connect(database_url: &str, options: StorageOptions) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }
        // Every pooled connection to `sqlite::memory:` is its own database.
        let max_connections = if in_memory { 1 } else { options.max_connections };
        Self::open(connect_options, max_connections).await
    }

    /// Opens (creating if needed) the database that belongs to `user_id` under
    /// `data_dir`. The file name is derived from the user id only, so every
    /// process on the device resolves the same file.
    pub async fn open_for_user(
        data_dir: &Path,
        user_id: &UserId,
        options: StorageOptions,
    ) -> Result<Self> {
        fs::create_dir_all(data_dir).with_context(|| {
            format!("failed to create data directory '{}'", data_dir.display())
        })?;
        let path = Self::database_path(data_dir, user_id);
        debug!("storage: opening {} for user={user_id}", path.display());

        let connect_options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);
        Self::open(connect_options, options.max_connections)
            .await
            .with_context(|| format!("failed to open user database '{}'", path.display()))
    }

    async fn open(connect_options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let migrator = sqlx::migrate!("./migrations");
        if let Err(first) = migrator.run(&pool).await {
            // Another process opening the same file may have applied them first.
            debug!("storage: retrying migrations after: {first}");
            migrator.run(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn database_file_name(user_id: &UserId) -> String {
        let digest = Sha256::digest(user_id.normalized().as_bytes());
        format!("mls_{}.sqlite3", &hex::encode(digest)[..32])
    }

    pub fn database_path(data_dir: &Path, user_id: &UserId) -> PathBuf {
        data_dir.join(Self::database_file_name(user_id))
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Starts the single-writer transaction used for decrypt-and-persist.
    ///
    /// The first statement is a write, so the call returns only once this
    /// connection holds the database write lock (or fails after the busy
    /// timeout). Dropping the returned transaction rolls it back.
    pub async fn begin_writer(&self, holder: &str) -> Result<WriterTransaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open writer transaction")?;
        sqlx::query("UPDATE writer_lock SET holder = ?, acquired_at = ? WHERE id = 1")
            .bind(holder)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .context("failed to take database write lock")?;
        Ok(WriterTransaction { tx })
    }

    pub async fn cached_plaintext(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<Option<DecryptedPlaintext>> {
        fetch_plaintext(&self.pool, message_id, user_id).await
    }

    pub async fn cached_conversation(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Vec<DecryptedPlaintext>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, conversation_id, text, embed_json, sender_id, epoch, decrypted_at
             FROM plaintext_cache
             WHERE user_id = ? AND conversation_id = ?
             ORDER BY decrypted_at ASC",
        )
        .bind(user_id.normalized())
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(plaintext_from_row).collect()
    }

    pub async fn is_processed(&self, message_id: &MessageId, user_id: &UserId) -> Result<bool> {
        fetch_is_processed(&self.pool, message_id, user_id).await
    }

    pub async fn list_processed(&self, user_id: &UserId, limit: u32) -> Result<Vec<ProcessedRecord>> {
        let rows = sqlx::query(
            "SELECT message_id, conversation_id, epoch, processed_at
             FROM processed_messages
             WHERE user_id = ?
             ORDER BY processed_at DESC
             LIMIT ?",
        )
        .bind(user_id.normalized())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ProcessedRecord {
                message_id: MessageId(r.get::<String, _>(0)),
                conversation_id: ConversationId(r.get::<String, _>(1)),
                epoch: r.get::<i64, _>(2) as u64,
                processed_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }

    pub async fn group_snapshot(
        &self,
        user_id: &UserId,
        group_id: &[u8],
    ) -> Result<Option<GroupSnapshot>> {
        let row = sqlx::query(
            "SELECT group_id, epoch, member_count FROM group_states WHERE user_id = ? AND group_id = ?",
        )
        .bind(user_id.normalized())
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| GroupSnapshot {
            group_id: r.get::<Vec<u8>, _>(0),
            epoch: r.get::<i64, _>(1) as u64,
            member_count: r.get::<i64, _>(2) as u32,
        }))
    }

    pub async fn mls_state(&self, user_id: &UserId) -> Result<Option<StoredMlsState>> {
        fetch_mls_state(&self.pool, user_id).await
    }

    pub async fn epoch_secret(
        &self,
        user_id: &UserId,
        group_id: &[u8],
        epoch: u64,
    ) -> Result<Option<Vec<u8>>> {
        let secret = sqlx::query_scalar(
            "SELECT secret FROM epoch_secrets WHERE user_id = ? AND group_id = ? AND epoch = ?",
        )
        .bind(user_id.normalized())
        .bind(group_id)
        .bind(i64::try_from(epoch).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;
        Ok(secret)
    }

    /// Epochs with a retained secret for `group_id`, oldest first.
    pub async fn retained_epochs(&self, user_id: &UserId, group_id: &[u8]) -> Result<Vec<u64>> {
        let epochs: Vec<i64> = sqlx::query_scalar(
            "SELECT epoch FROM epoch_secrets WHERE user_id = ? AND group_id = ? ORDER BY epoch ASC",
        )
        .bind(user_id.normalized())
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(epochs.into_iter().map(|epoch| epoch as u64).collect())
    }

    /// Last write wins per (message_id, user_id).
    pub async fn upsert_read_receipt(&self, receipt: &ReadReceipt) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_receipts (message_id, user_id, conversation_id, read_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                read_at = excluded.read_at",
        )
        .bind(receipt.message_id.as_str())
        .bind(receipt.user_id.as_str())
        .bind(receipt.conversation_id.as_str())
        .bind(receipt.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_read_receipts(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ReadReceipt>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, conversation_id, read_at
             FROM read_receipts
             WHERE conversation_id = ?
             ORDER BY read_at ASC, user_id ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ReadReceipt {
                message_id: MessageId(r.get::<String, _>(0)),
                user_id: UserId(r.get::<String, _>(1)),
                conversation_id: ConversationId(r.get::<String, _>(2)),
                read_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }

    /// Removes every receipt whose stored conversation id equals
    /// `conversation_id`. Returns the number of receipts removed.
    pub async fn clear_read_receipts(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM read_receipts WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A write-locked transaction over one user's database. All reads made
/// through it observe the state no other writer can change until commit.
pub struct WriterTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl WriterTransaction {
    pub async fn cached_plaintext(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Result<Option<DecryptedPlaintext>> {
        fetch_plaintext(&mut *self.tx, message_id, user_id).await
    }

    pub async fn is_processed(&mut self, message_id: &MessageId, user_id: &UserId) -> Result<bool> {
        fetch_is_processed(&mut *self.tx, message_id, user_id).await
    }

    /// Write-once: returns `false` and leaves the row untouched when a
    /// plaintext already exists for (message_id, user_id).
    pub async fn store_plaintext(&mut self, plaintext: &DecryptedPlaintext) -> Result<bool> {
        let embed_json = plaintext
            .embed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode embed")?;
        let result = sqlx::query(
            "INSERT INTO plaintext_cache
                (message_id, user_id, conversation_id, text, embed_json, sender_id, epoch, decrypted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(plaintext.message_id.as_str())
        .bind(plaintext.user_id.normalized())
        .bind(plaintext.conversation_id.as_str())
        .bind(&plaintext.text)
        .bind(embed_json)
        .bind(plaintext.sender_id.as_ref().map(UserId::as_str))
        .bind(i64::try_from(plaintext.epoch).unwrap_or(i64::MAX))
        .bind(plaintext.decrypted_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set on the processed ledger: returns `true` only for the
    /// first claim of (message_id, user_id).
    pub async fn claim_message(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
        conversation_id: &ConversationId,
        epoch: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_messages (message_id, user_id, conversation_id, epoch, processed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.as_str())
        .bind(user_id.normalized())
        .bind(conversation_id.as_str())
        .bind(i64::try_from(epoch).unwrap_or(i64::MAX))
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn save_group_snapshot(
        &mut self,
        user_id: &UserId,
        snapshot: &GroupSnapshot,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_states (user_id, group_id, epoch, member_count, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, group_id) DO UPDATE SET
                epoch = excluded.epoch,
                member_count = excluded.member_count,
                updated_at = excluded.updated_at",
        )
        .bind(user_id.normalized())
        .bind(&snapshot.group_id)
        .bind(i64::try_from(snapshot.epoch).unwrap_or(i64::MAX))
        .bind(i64::from(snapshot.member_count))
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn mls_state(&mut self, user_id: &UserId) -> Result<Option<StoredMlsState>> {
        fetch_mls_state(&mut *self.tx, user_id).await
    }

    /// Replaces the user's MLS state and returns the new revision.
    pub async fn save_mls_state(&mut self, user_id: &UserId, state: &[u8]) -> Result<i64> {
        let revision = sqlx::query_scalar(
            "INSERT INTO mls_state (user_id, state, revision, updated_at)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                state = excluded.state,
                revision = mls_state.revision + 1,
                updated_at = excluded.updated_at
             RETURNING revision",
        )
        .bind(user_id.normalized())
        .bind(state)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await
        .context("failed to save mls state")?;
        Ok(revision)
    }

    /// Keeps the first secret stored for an epoch.
    pub async fn store_epoch_secret(&mut self, user_id: &UserId, secret: &EpochSecret) -> Result<()> {
        sqlx::query(
            "INSERT INTO epoch_secrets (user_id, group_id, epoch, secret, stored_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, group_id, epoch) DO NOTHING",
        )
        .bind(user_id.normalized())
        .bind(&secret.group_id)
        .bind(i64::try_from(secret.epoch).unwrap_or(i64::MAX))
        .bind(&secret.secret)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Deletes secrets for epochs more than `retain` behind `current_epoch`.
    /// Returns the number of secrets removed.
    pub async fn prune_epoch_secrets(
        &mut self,
        user_id: &UserId,
        group_id: &[u8],
        current_epoch: u64,
        retain: usize,
    ) -> Result<u64> {
        let retain = u64::try_from(retain).unwrap_or(u64::MAX);
        let Some(oldest_kept) = current_epoch.checked_sub(retain) else {
            return Ok(0);
        };
        let result = sqlx::query(
            "DELETE FROM epoch_secrets WHERE user_id = ? AND group_id = ? AND epoch < ?",
        )
        .bind(user_id.normalized())
        .bind(group_id)
        .bind(i64::try_from(oldest_kept).unwrap_or(i64::MAX))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("failed to commit writer transaction")
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back writer transaction")
    }
}

async fn fetch_plaintext<'e, E>(
    executor: E,
    message_id: &MessageId,
    user_id: &UserId,
) -> Result<Option<DecryptedPlaintext>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT message_id, user_id, conversation_id, text, embed_json, sender_id, epoch, decrypted_at
         FROM plaintext_cache
         WHERE message_id = ? AND user_id = ?",
    )
    .bind(message_id.as_str())
    .bind(user_id.normalized())
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(plaintext_from_row).transpose()
}

async fn fetch_mls_state<'e, E>(executor: E, user_id: &UserId) -> Result<Option<StoredMlsState>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT state, revision FROM mls_state WHERE user_id = ?")
        .bind(user_id.normalized())
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|r| StoredMlsState {
        state: r.get::<Vec<u8>, _>(0),
        revision: r.get::<i64, _>(1),
    }))
}

async fn fetch_is_processed<'e, E>(
    executor: E,
    message_id: &MessageId,
    user_id: &UserId,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT 1 FROM processed_messages WHERE message_id = ? AND user_id = ?")
        .bind(message_id.as_str())
        .bind(user_id.normalized())
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}

fn plaintext_from_row(r: &SqliteRow) -> Result<DecryptedPlaintext> {
    let embed = r
        .get::<Option<String>, _>(4)
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("cached embed is not valid json")?;
    Ok(DecryptedPlaintext {
        message_id: MessageId(r.get::<String, _>(0)),
        user_id: UserId(r.get::<String, _>(1)),
        conversation_id: ConversationId(r.get::<String, _>(2)),
        text: r.get::<String, _>(3),
        embed,
        sender_id: r.get::<Option<String>, _>(5).map(UserId),
        epoch: r.get::<i64, _>(6) as u64,
        decrypted_at: r.get::<DateTime<Utc>, _>(7),
    })
}

/// True when `err` came from sqlite giving up on a lock held by another
/// connection (`SQLITE_BUSY` / `SQLITE_LOCKED` and their extended codes).
pub fn is_lock_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    })
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
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
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

#[async_trait]
impl MlsStore for Storage {
    async fn save_identity_keys(&self, user_id: &UserId, identity_bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO identity_keys (user_id, identity_bytes) VALUES (?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id.normalized())
        .bind(identity_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_identity_keys(&self, user_id: &UserId) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT identity_bytes FROM identity_keys WHERE user_id = ?")
            .bind(user_id.normalized())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
