use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use openmls::group::{ProcessMessageError, ValidationError};
use openmls::prelude::*;
use openmls_basic_credential::SignatureKeyPair;
use openmls_rust_crypto::OpenMlsRustCrypto;
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;
use tls_codec::{Deserialize as TlsDeserializeTrait, Serialize as TlsSerializeTrait};
use tracing::{debug, warn};

const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;
const EPOCH_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum MlsError {
    #[error("invalid message encoding: {0}")]
    InvalidEncoding(String),
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("message for group {message_group} was routed to group {expected}")]
    GroupMismatch {
        message_group: String,
        expected: String,
    },
    #[error("message epoch {message_epoch} does not match group epoch {group_epoch}")]
    WrongEpoch { message_epoch: u64, group_epoch: u64 },
    #[error("cryptographic failure: {0}")]
    Crypto(String),
    #[error("group state could not be saved or restored: {0}")]
    State(String),
}

impl MlsError {
    /// True when the input was rejected before any group state was touched
    /// because it could not be parsed at all.
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::InvalidEncoding(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedKind {
    Application(Vec<u8>),
    Commit { new_epoch: u64 },
    Proposal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedApplication {
    pub kind: ProcessedKind,
    /// Epoch the message was sent in.
    pub epoch: u64,
    pub sender_identity: Option<Vec<u8>>,
}

impl DecryptedApplication {
    pub fn plaintext(&self) -> &[u8] {
        match &self.kind {
            ProcessedKind::Application(bytes) => bytes,
            ProcessedKind::Commit { .. } | ProcessedKind::Proposal => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_id: Vec<u8>,
    pub epoch: u64,
    pub member_count: u32,
}

/// Parameters applied to every group a context creates or joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Past epochs whose secrets stay available for late messages.
    pub max_past_epochs: usize,
    pub out_of_order_tolerance: u32,
    pub maximum_forward_distance: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_past_epochs: 5,
            out_of_order_tolerance: 10,
            maximum_forward_distance: 2000,
        }
    }
}

impl GroupConfig {
    fn sender_ratchet(&self) -> SenderRatchetConfiguration {
        SenderRatchetConfiguration::new(self.out_of_order_tolerance, self.maximum_forward_distance)
    }
}

/// Secret exported from a group's key schedule before the epoch moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSecret {
    pub group_id: Vec<u8>,
    pub epoch: u64,
    pub secret: Vec<u8>,
}

/// The ratchet-advancing decrypt primitive. Every successful `decrypt` consumes
/// key material that can never be derived again, so callers must make sure a
/// given ciphertext reaches it at most once.
pub trait RatchetDecryptor: Send {
    /// Local user this context was built for.
    fn owner(&self) -> &UserId;

    fn decrypt(
        &mut self,
        group_id: &[u8],
        ciphertext: &[u8],
    ) -> Result<DecryptedApplication, MlsError>;

    fn group_snapshot(&self, group_id: &[u8]) -> Option<GroupSnapshot>;

    /// Serialized ratchet state to persist next to the plaintext, or `None`
    /// when the context keeps nothing outside memory.
    fn export_state(&self) -> Result<Option<Vec<u8>>, MlsError> {
        Ok(None)
    }

    /// Replaces the in-memory ratchet state with one from `export_state`.
    fn import_state(&mut self, _state: &[u8]) -> Result<(), MlsError> {
        Ok(())
    }

    /// Epoch secrets exported since the previous call.
    fn take_epoch_secrets(&mut self) -> Vec<EpochSecret> {
        Vec::new()
    }

    fn max_past_epochs(&self) -> usize {
        GroupConfig::default().max_past_epochs
    }
}

#[async_trait]
pub trait MlsStore: Send + Sync {
    async fn save_identity_keys(&self, user_id: &UserId, identity_bytes: &[u8]) -> Result<()>;
    async fn load_identity_keys(&self, user_id: &UserId) -> Result<Option<Vec<u8>>>;
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    name: Vec<u8>,
    signer: SignatureKeyPair,
}

#[derive(Debug)]
pub struct MlsIdentity {
    name: Vec<u8>,
    credential_with_key: CredentialWithKey,
    signer: SignatureKeyPair,
}

impl MlsIdentity {
    pub fn new_with_name(name: impl Into<Vec<u8>>) -> Result<Self> {
        let signer = SignatureKeyPair::new(SignatureScheme::ED25519)?;
        Ok(Self::from_parts(name.into(), signer))
    }

    fn from_parts(name: Vec<u8>, signer: SignatureKeyPair) -> Self {
        let credential = BasicCredential::new(name.clone());
        let credential_with_key = CredentialWithKey {
            credential: credential.into(),
            signature_key: signer.to_public_vec().into(),
        };
        Self {
            name,
            credential_with_key,
            signer,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredIdentity {
            name: self.name.clone(),
            signer: self.signer.clone(),
        };
        Ok(serde_json::to_vec(&stored)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let stored: StoredIdentity = serde_json::from_slice(bytes)?;
        Ok(Self::from_parts(stored.name, stored.signer))
    }
}

/// Loads the persisted signing identity for `user_id`, creating and saving a
/// fresh one on first use. Stores keep the first identity written, so the
/// identity is re-read after saving in case another process won the race.
pub async fn load_or_create_identity(store: &dyn MlsStore, user_id: &UserId) -> Result<MlsIdentity> {
    if let Some(bytes) = store.load_identity_keys(user_id).await? {
        return MlsIdentity::from_bytes(&bytes);
    }

    let identity = MlsIdentity::new_with_name(user_id.normalized().into_bytes())?;
    store
        .save_identity_keys(user_id, &identity.to_bytes()?)
        .await?;
    match store.load_identity_keys(user_id).await? {
        Some(bytes) => MlsIdentity::from_bytes(&bytes),
        None => Ok(identity),
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedState {
    /// Provider storage entries, hex encoded and sorted by key.
    entries: Vec<(String, String)>,
    group_ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct GroupHandle {
    group_id: Vec<u8>,
    epoch: u64,
    signer_public_key: Vec<u8>,
}

/// Per-user cryptographic context: one identity, one OpenMLS provider, and the
/// groups this user participates in. Group state lives in the provider's
/// storage; `serialize_state` / `restore_state` move all of it in and out.
pub struct MlsContext {
    owner: UserId,
    provider: OpenMlsRustCrypto,
    identity: MlsIdentity,
    config: GroupConfig,
    groups: HashMap<Vec<u8>, MlsGroup>,
    epoch_secrets: Vec<EpochSecret>,
}

impl MlsContext {
    pub fn new(owner: UserId, identity: MlsIdentity) -> Self {
        Self::with_config(owner, identity, GroupConfig::default())
    }

    pub fn with_config(owner: UserId, identity: MlsIdentity, config: GroupConfig) -> Self {
        Self {
            owner,
            provider: OpenMlsRustCrypto::default(),
            identity,
            config,
            groups: HashMap::new(),
            epoch_secrets: Vec::new(),
        }
    }

    pub fn config(&self) -> GroupConfig {
        self.config
    }

    pub fn has_group(&self, group_id: &[u8]) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn epoch(&self, group_id: &[u8]) -> Option<u64> {
        self.groups.get(group_id).map(|group| group.epoch().as_u64())
    }

    pub fn key_package_bytes(&self) -> Result<Vec<u8>> {
        let bundle = KeyPackage::builder().build(
            CIPHERSUITE,
            &self.provider,
            &self.identity.signer,
            self.identity.credential_with_key.clone(),
        )?;
        Ok(bundle.key_package().tls_serialize_detached()?)
    }

    pub fn create_group(&mut self, group_id: &[u8]) -> Result<()> {
        let config = MlsGroupCreateConfig::builder()
            .ciphersuite(CIPHERSUITE)
            .use_ratchet_tree_extension(true)
            .max_past_epochs(self.config.max_past_epochs)
            .sender_ratchet_configuration(self.config.sender_ratchet())
            .build();
        let group = MlsGroup::new_with_group_id(
            &self.provider,
            &self.identity.signer,
            &config,
            GroupId::from_slice(group_id),
            self.identity.credential_with_key.clone(),
        )?;
        self.groups.insert(group_id.to_vec(), group);
        Ok(())
    }

    /// Joins the group described by a serialized welcome and returns its id.
    pub fn join_group_from_welcome(&mut self, welcome_bytes: &[u8]) -> Result<Vec<u8>> {
        let message = MlsMessageIn::tls_deserialize_exact(welcome_bytes)?;
        let welcome = match message.extract() {
            MlsMessageBodyIn::Welcome(welcome) => welcome,
            _ => return Err(anyhow!("message was not a welcome")),
        };
        let config = MlsGroupJoinConfig::builder()
            .use_ratchet_tree_extension(true)
            .max_past_epochs(self.config.max_past_epochs)
            .sender_ratchet_configuration(self.config.sender_ratchet())
            .build();
        let staged = StagedWelcome::new_from_welcome(&self.provider, &config, welcome, None)?;
        let group = staged.into_group(&self.provider)?;
        let group_id = group.group_id().as_slice().to_vec();
        // The group may already be past epoch 0 when joined.
        retain_epoch_secret(&mut self.epoch_secrets, &group, &self.provider);
        self.groups.insert(group_id.clone(), group);
        Ok(group_id)
    }

    /// Adds the member behind `key_package_bytes`, merges the commit locally
    /// and returns `(commit, welcome)` for distribution.
    pub fn add_member(
        &mut self,
        group_id: &[u8],
        key_package_bytes: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut bytes = key_package_bytes;
        let key_package_in = <KeyPackageIn as TlsDeserializeTrait>::tls_deserialize(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(anyhow!("key package bytes had trailing data"));
        }
        let provider = &self.provider;
        let key_package = key_package_in
            .validate(provider.crypto(), ProtocolVersion::default())
            .map_err(|e| anyhow!("invalid key package bytes: {e}"))?;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group {} not initialized", hex::encode(group_id)))?;
        let (commit, welcome, _group_info) =
            group.add_members(provider, &self.identity.signer, &[key_package])?;
        let commit_bytes = commit.tls_serialize_detached()?;
        let welcome_bytes = welcome.tls_serialize_detached()?;
        retain_epoch_secret(&mut self.epoch_secrets, group, provider);
        group.merge_pending_commit(provider)?;
        Ok((commit_bytes, welcome_bytes))
    }

    pub fn encrypt_application(&mut self, group_id: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| anyhow!("group {} not initialized", hex::encode(group_id)))?;
        let message = group.create_message(&self.provider, &self.identity.signer, plaintext)?;
        Ok(message.tls_serialize_detached()?)
    }

    /// Serializes every entry of the provider storage plus the ids of the
    /// loaded groups. The result restores the full ratchet state in any
    /// process through `restore_state`.
    pub fn serialize_state(&self) -> Result<Vec<u8>, MlsError> {
        let values = self
            .provider
            .storage()
            .values
            .read()
            .map_err(|_| MlsError::State("provider storage lock poisoned".into()))?;
        let mut entries: Vec<(String, String)> = values
            .iter()
            .map(|(key, value)| (hex::encode(key), hex::encode(value)))
            .collect();
        drop(values);
        entries.sort();

        let mut group_ids: Vec<String> = self.groups.keys().map(hex::encode).collect();
        group_ids.sort();

        serde_json::to_vec(&SerializedState { entries, group_ids })
            .map_err(|e| MlsError::State(e.to_string()))
    }

    /// Replaces the provider storage with `state` and reloads the groups it
    /// lists. Epoch secrets not yet taken are dropped with the old state.
    pub fn restore_state(&mut self, state: &[u8]) -> Result<(), MlsError> {
        let stored: SerializedState =
            serde_json::from_slice(state).map_err(|e| MlsError::State(e.to_string()))?;
        let mut entries = HashMap::with_capacity(stored.entries.len());
        for (key, value) in &stored.entries {
            let key = hex::decode(key).map_err(|e| MlsError::State(e.to_string()))?;
            let value = hex::decode(value).map_err(|e| MlsError::State(e.to_string()))?;
            entries.insert(key, value);
        }

        {
            let mut values = self
                .provider
                .storage()
                .values
                .write()
                .map_err(|_| MlsError::State("provider storage lock poisoned".into()))?;
            *values = entries;
        }

        self.groups.clear();
        self.epoch_secrets.clear();
        for group_hex in &stored.group_ids {
            let group_id = hex::decode(group_hex).map_err(|e| MlsError::State(e.to_string()))?;
            match MlsGroup::load(self.provider.storage(), &GroupId::from_slice(&group_id)) {
                Ok(Some(group)) => {
                    self.groups.insert(group_id, group);
                }
                Ok(None) => warn!("mls: group {group_hex} listed in state but missing from storage"),
                Err(e) => return Err(MlsError::State(format!("group {group_hex}: {e:?}"))),
            }
        }
        debug!(
            "mls: restored {} storage entries and {} groups for {}",
            stored.entries.len(),
            self.groups.len(),
            self.owner
        );
        Ok(())
    }

    /// Small handle naming a loaded group, its epoch and the signer used in
    /// it. Pass it to `import_group_state` to re-attach the group.
    pub fn export_group_state(&self, group_id: &[u8]) -> Result<Vec<u8>, MlsError> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| MlsError::GroupNotFound(hex::encode(group_id)))?;
        let handle = GroupHandle {
            group_id: group_id.to_vec(),
            epoch: group.epoch().as_u64(),
            signer_public_key: self.identity.signer.to_public_vec(),
        };
        serde_json::to_vec(&handle).map_err(|e| MlsError::State(e.to_string()))
    }

    /// Re-attaches the group named by an `export_group_state` handle, loading
    /// it from provider storage when it is not in memory. Returns its id.
    pub fn import_group_state(&mut self, handle: &[u8]) -> Result<Vec<u8>, MlsError> {
        let handle: GroupHandle =
            serde_json::from_slice(handle).map_err(|e| MlsError::State(e.to_string()))?;
        if handle.signer_public_key != self.identity.signer.to_public_vec() {
            return Err(MlsError::State(format!(
                "group {} was exported by a different signer",
                hex::encode(&handle.group_id)
            )));
        }
        if self.has_group(&handle.group_id) {
            return Ok(handle.group_id);
        }
        let group = MlsGroup::load(self.provider.storage(), &GroupId::from_slice(&handle.group_id))
            .map_err(|e| MlsError::State(format!("{e:?}")))?
            .ok_or_else(|| MlsError::GroupNotFound(hex::encode(&handle.group_id)))?;
        self.groups.insert(handle.group_id.clone(), group);
        Ok(handle.group_id)
    }
}

/// Exports the current epoch's secret so messages from it stay readable
/// after the group advances. A failed export only costs late messages.
fn retain_epoch_secret(
    retained: &mut Vec<EpochSecret>,
    group: &MlsGroup,
    provider: &OpenMlsRustCrypto,
) {
    let group_hex = hex::encode(group.group_id().as_slice());
    let epoch = group.epoch().as_u64();
    match group.export_secret(
        provider.crypto(),
        &format!("epoch_secret_{epoch}"),
        group_hex.as_bytes(),
        EPOCH_SECRET_LEN,
    ) {
        Ok(secret) => retained.push(EpochSecret {
            group_id: group.group_id().as_slice().to_vec(),
            epoch,
            secret: secret.to_vec(),
        }),
        Err(e) => warn!("mls: could not export epoch secret group={group_hex} epoch={epoch}: {e}"),
    }
}

impl RatchetDecryptor for MlsContext {
    fn owner(&self) -> &UserId {
        &self.owner
    }

    fn decrypt(
        &mut self,
        group_id: &[u8],
        ciphertext: &[u8],
    ) -> Result<DecryptedApplication, MlsError> {
        let message = MlsMessageIn::tls_deserialize_exact(ciphertext)
            .map_err(|e| MlsError::InvalidEncoding(e.to_string()))?;
        let protocol_message = message.try_into_protocol_message().map_err(|_| {
            MlsError::InvalidEncoding("ciphertext did not contain a protocol message".into())
        })?;

        if protocol_message.group_id().as_slice() != group_id {
            return Err(MlsError::GroupMismatch {
                message_group: hex::encode(protocol_message.group_id().as_slice()),
                expected: hex::encode(group_id),
            });
        }

        let provider = &self.provider;
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| MlsError::GroupNotFound(hex::encode(group_id)))?;

        let message_epoch = protocol_message.epoch().as_u64();
        let group_epoch = group.epoch().as_u64();
        if message_epoch != group_epoch {
            warn!(
                "mls: rejecting message from epoch {message_epoch}, group {} is at epoch {group_epoch}",
                hex::encode(group_id)
            );
            return Err(MlsError::WrongEpoch {
                message_epoch,
                group_epoch,
            });
        }

        let processed = match group.process_message(provider, protocol_message) {
            Ok(processed) => processed,
            Err(ProcessMessageError::ValidationError(ValidationError::WrongEpoch)) => {
                return Err(MlsError::WrongEpoch {
                    message_epoch,
                    group_epoch,
                })
            }
            Err(e) => return Err(MlsError::Crypto(e.to_string())),
        };
        let sender_identity = Some(processed.credential().serialized_content().to_vec());

        let kind = match processed.into_content() {
            ProcessedMessageContent::ApplicationMessage(app_msg) => {
                ProcessedKind::Application(app_msg.into_bytes())
            }
            ProcessedMessageContent::StagedCommitMessage(staged_commit) => {
                retain_epoch_secret(&mut self.epoch_secrets, group, provider);
                group
                    .merge_staged_commit(provider, *staged_commit)
                    .map_err(|e| MlsError::Crypto(e.to_string()))?;
                let new_epoch = group.epoch().as_u64();
                debug!(
                    "mls: merged commit for group {} new_epoch={new_epoch}",
                    hex::encode(group_id)
                );
                ProcessedKind::Commit { new_epoch }
            }
            _ => ProcessedKind::Proposal,
        };

        Ok(DecryptedApplication {
            kind,
            epoch: message_epoch,
            sender_identity,
        })
    }

    fn group_snapshot(&self, group_id: &[u8]) -> Option<GroupSnapshot> {
        self.groups.get(group_id).map(|group| GroupSnapshot {
            group_id: group_id.to_vec(),
            epoch: group.epoch().as_u64(),
            member_count: u32::try_from(group.members().count()).unwrap_or(u32::MAX),
        })
    }

    fn export_state(&self) -> Result<Option<Vec<u8>>, MlsError> {
        self.serialize_state().map(Some)
    }

    fn import_state(&mut self, state: &[u8]) -> Result<(), MlsError> {
        self.restore_state(state)
    }

    fn take_epoch_secrets(&mut self) -> Vec<EpochSecret> {
        std::mem::take(&mut self.epoch_secrets)
    }

    fn max_past_epochs(&self) -> usize {
        self.config.max_past_epochs
    }
}
