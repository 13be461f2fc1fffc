use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use mls::{DecryptedApplication, GroupSnapshot, MlsError, ProcessedKind, RatchetDecryptor};
use shared::domain::{DecryptedPlaintext, MessageId, UserId};
use storage::Storage;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::{
    config::EngineSettings,
    error::{ContextError, DecryptError},
    gateway::{ContextProvider, DecryptRequest, DecryptionGateway},
    notification::{Delivery, NotificationSink},
};

pub const SENDER: &str = "did:plc:bob";

pub fn settings_in(dir: &TempDir) -> EngineSettings {
    EngineSettings {
        data_dir: dir.path().to_path_buf(),
        ..EngineSettings::default()
    }
}

/// Echoes the ciphertext back as plaintext and counts every call. Ciphertext
/// starting with `bad` is rejected as malformed, `fail` as a crypto failure.
pub struct CountingDecryptor {
    owner: UserId,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingDecryptor {
    pub fn new(owner: UserId, calls: Arc<AtomicUsize>) -> Self {
        Self {
            owner,
            calls,
            delay: Duration::ZERO,
        }
    }

    /// Holds the caller inside `decrypt` for `delay`, widening race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl RatchetDecryptor for CountingDecryptor {
    fn owner(&self) -> &UserId {
        &self.owner
    }

    fn decrypt(
        &mut self,
        _group_id: &[u8],
        ciphertext: &[u8],
    ) -> Result<DecryptedApplication, MlsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if ciphertext.starts_with(b"bad") {
            return Err(MlsError::InvalidEncoding("truncated message".into()));
        }
        if ciphertext.starts_with(b"fail") {
            return Err(MlsError::Crypto("aead open failed".into()));
        }
        Ok(DecryptedApplication {
            kind: ProcessedKind::Application(ciphertext.to_vec()),
            epoch: 1,
            sender_identity: Some(SENDER.as_bytes().to_vec()),
        })
    }

    fn group_snapshot(&self, group_id: &[u8]) -> Option<GroupSnapshot> {
        Some(GroupSnapshot {
            group_id: group_id.to_vec(),
            epoch: 1,
            member_count: 2,
        })
    }
}

/// Builds a [`CountingDecryptor`] for whichever user is requested and keeps
/// track of who asked.
#[derive(Clone, Default)]
pub struct CountingProvider {
    pub calls: Arc<AtomicUsize>,
    pub opened: Arc<Mutex<Vec<UserId>>>,
    pub delay: Duration,
}

#[async_trait]
impl ContextProvider for CountingProvider {
    async fn open_context(
        &self,
        user_id: &UserId,
        _storage: &Storage,
    ) -> Result<Box<dyn RatchetDecryptor>, ContextError> {
        self.opened.lock().await.push(user_id.clone());
        Ok(Box::new(
            CountingDecryptor::new(user_id.clone(), self.calls.clone()).with_delay(self.delay),
        ))
    }
}

#[derive(Clone)]
pub enum StubOutcome {
    Text(String),
    Fail(fn() -> DecryptError),
}

/// Gateway double for pipeline tests.
#[derive(Clone)]
pub struct StubGateway {
    pub cached: Arc<Mutex<HashMap<String, DecryptedPlaintext>>>,
    pub outcome: StubOutcome,
    pub delay: Duration,
    pub decrypt_calls: Arc<Mutex<u32>>,
    pub context_calls: Arc<Mutex<u32>>,
    pub cache_calls: Arc<Mutex<u32>>,
}

impl StubGateway {
    pub fn returning(text: &str) -> Self {
        Self {
            cached: Arc::new(Mutex::new(HashMap::new())),
            outcome: StubOutcome::Text(text.to_string()),
            delay: Duration::ZERO,
            decrypt_calls: Arc::new(Mutex::new(0)),
            context_calls: Arc::new(Mutex::new(0)),
            cache_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing(make: fn() -> DecryptError) -> Self {
        Self {
            outcome: StubOutcome::Fail(make),
            ..Self::returning("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn seed(&self, plaintext: DecryptedPlaintext) {
        self.cached
            .lock()
            .await
            .insert(plaintext.message_id.to_string(), plaintext);
    }

    pub async fn total_calls(&self) -> u32 {
        *self.decrypt_calls.lock().await
            + *self.context_calls.lock().await
            + *self.cache_calls.lock().await
    }
}

#[async_trait]
impl DecryptionGateway for StubGateway {
    async fn ensure_context(&self, _user_id: &UserId) -> Result<(), ContextError> {
        *self.context_calls.lock().await += 1;
        Ok(())
    }

    async fn decrypt_and_store(&self, request: DecryptRequest) -> Result<String, DecryptError> {
        *self.decrypt_calls.lock().await += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            StubOutcome::Text(text) => {
                self.seed(plaintext(&request.message_id, &request.user_id, text))
                    .await;
                Ok(text.clone())
            }
            StubOutcome::Fail(make) => Err(make()),
        }
    }

    async fn cached_plaintext(&self, message_id: &MessageId, user_id: &UserId) -> Option<String> {
        self.cached_message(message_id, user_id)
            .await
            .map(|cached| cached.text)
    }

    async fn cached_message(
        &self,
        message_id: &MessageId,
        _user_id: &UserId,
    ) -> Option<DecryptedPlaintext> {
        *self.cache_calls.lock().await += 1;
        self.cached.lock().await.get(message_id.as_str()).cloned()
    }
}

pub fn plaintext(message_id: &MessageId, user_id: &UserId, text: &str) -> DecryptedPlaintext {
    DecryptedPlaintext {
        message_id: message_id.clone(),
        user_id: user_id.clone(),
        conversation_id: "convo-1".into(),
        text: text.to_string(),
        embed: None,
        sender_id: Some(UserId::from(SENDER)),
        epoch: 1,
        decrypted_at: chrono::Utc::now(),
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub deliveries: Arc<StdMutex<Vec<Delivery>>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<Delivery> {
        self.deliveries.lock().expect("sink lock").clone()
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&self, delivery: Delivery) {
        self.deliveries.lock().expect("sink lock").push(delivery);
    }
}
