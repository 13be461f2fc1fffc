use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use mls::{load_or_create_identity, GroupConfig, MlsContext, RatchetDecryptor};
use shared::{
    domain::{ConversationId, DecryptedPlaintext, MessageId, UserId},
    protocol::MessageBody,
};
use storage::{is_lock_contention, Storage, StorageOptions, WriterTransaction};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    config::EngineSettings,
    error::{ContextError, DecryptError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptRequest {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub group_id: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub message_id: MessageId,
}

/// Idempotent decrypt-and-persist over one active user's cryptographic
/// context. Both host processes go through an implementation of this trait.
#[async_trait]
pub trait DecryptionGateway: Send + Sync {
    /// Makes sure the in-memory context belongs to `user_id`, discarding a
    /// context left over from a previously active user.
    async fn ensure_context(&self, user_id: &UserId) -> Result<(), ContextError>;

    /// Returns the plaintext for `request.message_id`, decrypting at most once
    /// across every process that shares the user's database.
    async fn decrypt_and_store(&self, request: DecryptRequest) -> Result<String, DecryptError>;

    async fn cached_plaintext(&self, message_id: &MessageId, user_id: &UserId) -> Option<String>;

    /// Full cached record (text, embed, sender) when the implementation keeps
    /// one.
    async fn cached_message(
        &self,
        _message_id: &MessageId,
        _user_id: &UserId,
    ) -> Option<DecryptedPlaintext> {
        None
    }
}

/// Builds the decrypt primitive for a user. Called whenever the gateway has
/// no usable context for the requested user.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn open_context(
        &self,
        user_id: &UserId,
        storage: &Storage,
    ) -> Result<Box<dyn RatchetDecryptor>, ContextError>;
}

/// Restores the user's signing identity from their database and starts an
/// OpenMLS context around it. Group state is loaded by the gateway under the
/// write lock, not here.
#[derive(Debug, Clone, Default)]
pub struct OpenMlsContextProvider {
    config: GroupConfig,
}

impl OpenMlsContextProvider {
    pub fn new(config: GroupConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ContextProvider for OpenMlsContextProvider {
    async fn open_context(
        &self,
        user_id: &UserId,
        storage: &Storage,
    ) -> Result<Box<dyn RatchetDecryptor>, ContextError> {
        let identity = load_or_create_identity(storage, user_id)
            .await
            .map_err(ContextError::Storage)?;
        Ok(Box::new(MlsContext::with_config(
            user_id.clone(),
            identity,
            self.config,
        )))
    }
}

struct ActiveContext {
    user_id: UserId,
    storage: Storage,
    decryptor: Box<dyn RatchetDecryptor>,
    /// Revision of the stored MLS state the decryptor currently matches.
    /// `None` once the in-memory state may differ from the database.
    synced_revision: Option<i64>,
}

impl ActiveContext {
    fn belongs_to(&self, user_id: &UserId) -> bool {
        self.user_id.same_identity(user_id) && self.decryptor.owner().same_identity(user_id)
    }
}

pub struct MlsDecryptionGateway {
    data_dir: PathBuf,
    storage_options: StorageOptions,
    transaction_timeout: Duration,
    holder: String,
    provider: Arc<dyn ContextProvider>,
    active: Mutex<Option<ActiveContext>>,
    stores: Mutex<HashMap<String, Storage>>,
}

impl MlsDecryptionGateway {
    pub fn new(settings: &EngineSettings, provider: Arc<dyn ContextProvider>) -> Self {
        Self {
            data_dir: settings.data_dir.clone(),
            storage_options: settings.storage_options(),
            transaction_timeout: settings.transaction_timeout(),
            holder: format!("pid-{}", std::process::id()),
            provider,
            active: Mutex::new(None),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Label written to the writer lock row while this gateway holds it.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub async fn active_user(&self) -> Option<UserId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|ctx| ctx.user_id.clone())
    }

    /// Hands the gateway a context that already holds group state (for
    /// example one that joined groups from welcomes in the foreground). Its
    /// state is saved right away so other processes decrypt from it.
    pub async fn install_context(
        &self,
        mut decryptor: Box<dyn RatchetDecryptor>,
    ) -> Result<(), ContextError> {
        let user_id = decryptor.owner().clone();
        let storage = self
            .storage_for(&user_id)
            .await
            .map_err(ContextError::Storage)?;
        let mut active = self.active.lock().await;
        let synced_revision = match decryptor
            .export_state()
            .map_err(|e| ContextError::Provider(e.to_string()))?
        {
            Some(state) => {
                let mut tx = storage
                    .begin_writer(&self.holder)
                    .await
                    .map_err(ContextError::Storage)?;
                for secret in decryptor.take_epoch_secrets() {
                    tx.store_epoch_secret(&user_id, &secret)
                        .await
                        .map_err(ContextError::Storage)?;
                }
                let revision = tx
                    .save_mls_state(&user_id, &state)
                    .await
                    .map_err(ContextError::Storage)?;
                tx.commit().await.map_err(ContextError::Storage)?;
                debug!("gateway: saved installed state user={user_id} revision={revision}");
                Some(revision)
            }
            None => None,
        };
        if let Some(previous) = active.as_ref() {
            if !previous.user_id.same_identity(&user_id) {
                warn!(
                    "gateway: replacing context of user={} with user={user_id}",
                    previous.user_id
                );
            }
        }
        *active = Some(ActiveContext {
            user_id,
            storage,
            decryptor,
            synced_revision,
        });
        Ok(())
    }

    async fn storage_for(&self, user_id: &UserId) -> anyhow::Result<Storage> {
        let key = user_id.normalized();
        let mut stores = self.stores.lock().await;
        if let Some(storage) = stores.get(&key) {
            return Ok(storage.clone());
        }
        let storage = Storage::open_for_user(&self.data_dir, user_id, self.storage_options).await?;
        stores.insert(key, storage.clone());
        Ok(storage)
    }

    async fn ensure_locked(
        &self,
        slot: &mut Option<ActiveContext>,
        user_id: &UserId,
    ) -> Result<(), ContextError> {
        if let Some(current) = slot.as_ref() {
            if current.belongs_to(user_id) {
                return Ok(());
            }
            warn!(
                "gateway: discarding stale context of user={} (owner={}) for user={user_id}",
                current.user_id,
                current.decryptor.owner()
            );
            *slot = None;
        }

        let storage = self
            .storage_for(user_id)
            .await
            .map_err(ContextError::Storage)?;
        let decryptor = self.provider.open_context(user_id, &storage).await?;
        if !decryptor.owner().same_identity(user_id) {
            return Err(ContextError::Provider(format!(
                "provider built a context for {} when {user_id} was requested",
                decryptor.owner()
            )));
        }
        info!("gateway: context ready for user={user_id}");
        *slot = Some(ActiveContext {
            user_id: user_id.clone(),
            storage,
            decryptor,
            synced_revision: None,
        });
        Ok(())
    }
}

/// Brings the decryptor up to the MLS state stored in the database. Runs
/// under the write lock, so no other process can advance it meanwhile.
async fn sync_stored_state(
    ctx: &mut ActiveContext,
    tx: &mut WriterTransaction,
) -> Result<(), DecryptError> {
    let Some(stored) = tx
        .mls_state(&ctx.user_id)
        .await
        .map_err(DecryptError::Storage)?
    else {
        return Ok(());
    };
    if ctx.synced_revision == Some(stored.revision) {
        return Ok(());
    }
    ctx.decryptor.import_state(&stored.state).map_err(|e| {
        ContextError::Provider(format!(
            "stored mls state revision {} unreadable: {e}",
            stored.revision
        ))
    })?;
    debug!(
        "gateway: loaded mls state user={} revision={}",
        ctx.user_id, stored.revision
    );
    ctx.synced_revision = Some(stored.revision);
    Ok(())
}

/// Writes everything the decrypt changed in the ratchet into `tx`: the
/// retained epoch secrets and the serialized state. Returns the new state
/// revision, if the decryptor keeps any state.
async fn persist_ratchet(
    ctx: &mut ActiveContext,
    tx: &mut WriterTransaction,
    group_id: &[u8],
) -> Result<Option<i64>, DecryptError> {
    let secrets = ctx.decryptor.take_epoch_secrets();
    for secret in &secrets {
        tx.store_epoch_secret(&ctx.user_id, secret)
            .await
            .map_err(DecryptError::Storage)?;
    }
    if let Some(snapshot) = ctx.decryptor.group_snapshot(group_id) {
        if !secrets.is_empty() {
            let pruned = tx
                .prune_epoch_secrets(
                    &ctx.user_id,
                    group_id,
                    snapshot.epoch,
                    ctx.decryptor.max_past_epochs(),
                )
                .await
                .map_err(DecryptError::Storage)?;
            if pruned > 0 {
                debug!("gateway: pruned {pruned} epoch secrets below epoch {}", snapshot.epoch);
            }
        }
        tx.save_group_snapshot(&ctx.user_id, &snapshot)
            .await
            .map_err(DecryptError::Storage)?;
    }

    let Some(state) = ctx.decryptor.export_state()? else {
        return Ok(None);
    };
    let revision = tx
        .save_mls_state(&ctx.user_id, &state)
        .await
        .map_err(DecryptError::Storage)?;
    Ok(Some(revision))
}

#[async_trait]
impl DecryptionGateway for MlsDecryptionGateway {
    async fn ensure_context(&self, user_id: &UserId) -> Result<(), ContextError> {
        let mut active = self.active.lock().await;
        self.ensure_locked(&mut active, user_id).await
    }

    async fn decrypt_and_store(&self, request: DecryptRequest) -> Result<String, DecryptError> {
        let DecryptRequest {
            user_id,
            conversation_id,
            group_id,
            ciphertext,
            message_id,
        } = request;

        let storage = self
            .storage_for(&user_id)
            .await
            .map_err(DecryptError::Storage)?;
        if let Some(cached) = storage
            .cached_plaintext(&message_id, &user_id)
            .await
            .map_err(DecryptError::Storage)?
        {
            debug!("gateway: cache hit message_id={message_id}");
            return Ok(cached.text);
        }

        let mut active = self.active.lock().await;
        self.ensure_locked(&mut active, &user_id).await?;
        let Some(ctx) = active.as_mut() else {
            return Err(ContextError::Provider("no active context after rebuild".into()).into());
        };

        let mut tx = match timeout(self.transaction_timeout, ctx.storage.begin_writer(&self.holder))
            .await
        {
            Ok(Ok(tx)) => tx,
            Ok(Err(e)) if is_lock_contention(&e) => {
                warn!("gateway: write lock busy message_id={message_id}: {e:#}");
                return Err(DecryptError::Timeout);
            }
            Ok(Err(e)) => return Err(DecryptError::Storage(e)),
            Err(_) => {
                warn!(
                    "gateway: write lock not acquired within {:?} message_id={message_id}",
                    self.transaction_timeout
                );
                return Err(DecryptError::Timeout);
            }
        };

        // Another process may have finished this message while we waited.
        if let Some(cached) = tx
            .cached_plaintext(&message_id, &user_id)
            .await
            .map_err(DecryptError::Storage)?
        {
            debug!("gateway: cache filled while waiting message_id={message_id}");
            return Ok(cached.text);
        }
        if tx
            .is_processed(&message_id, &user_id)
            .await
            .map_err(DecryptError::Storage)?
        {
            warn!("gateway: message_id={message_id} already consumed without cached plaintext");
            return Err(DecryptError::AlreadyProcessed { message_id });
        }

        sync_stored_state(ctx, &mut tx).await?;
        // From here until commit the decryptor is ahead of the database.
        ctx.synced_revision = None;

        let decrypted = match ctx.decryptor.decrypt(&group_id, &ciphertext) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!("gateway: decrypt failed message_id={message_id}: {e}");
                return Err(e.into());
            }
        };

        let body = MessageBody::decode(decrypted.plaintext());
        let plaintext = DecryptedPlaintext {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            text: body.text,
            embed: body.embed,
            sender_id: decrypted
                .sender_identity
                .as_deref()
                .map(|identity| UserId::new(String::from_utf8_lossy(identity).into_owned())),
            epoch: decrypted.epoch,
            decrypted_at: Utc::now(),
        };

        if !tx
            .store_plaintext(&plaintext)
            .await
            .map_err(DecryptError::Storage)?
        {
            warn!("gateway: plaintext for message_id={message_id} appeared under the write lock");
            return Err(DecryptError::AlreadyProcessed { message_id });
        }
        if !tx
            .claim_message(&message_id, &user_id, &conversation_id, decrypted.epoch)
            .await
            .map_err(DecryptError::Storage)?
        {
            return Err(DecryptError::AlreadyProcessed { message_id });
        }
        let revision = persist_ratchet(ctx, &mut tx, &group_id).await?;
        tx.commit().await.map_err(DecryptError::Storage)?;
        ctx.synced_revision = revision;

        info!(
            "gateway: decrypted message_id={message_id} convo={conversation_id} epoch={} bytes={}",
            decrypted.epoch,
            ciphertext.len()
        );
        Ok(plaintext.text)
    }

    async fn cached_plaintext(&self, message_id: &MessageId, user_id: &UserId) -> Option<String> {
        self.cached_message(message_id, user_id)
            .await
            .map(|plaintext| plaintext.text)
    }

    async fn cached_message(
        &self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Option<DecryptedPlaintext> {
        let storage = match self.storage_for(user_id).await {
            Ok(storage) => storage,
            Err(e) => {
                warn!("gateway: cache unavailable for user={user_id}: {e:#}");
                return None;
            }
        };
        match storage.cached_plaintext(message_id, user_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!("gateway: cache lookup failed message_id={message_id}: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
