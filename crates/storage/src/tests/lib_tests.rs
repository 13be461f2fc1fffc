use super::*;
use chrono::TimeZone;
use std::time::Duration;
use tempfile::TempDir;

fn plaintext(message_id: &str, user: &str, text: &str) -> DecryptedPlaintext {
    DecryptedPlaintext {
        message_id: MessageId::from(message_id),
        user_id: UserId::from(user),
        conversation_id: ConversationId::from("convo-1"),
        text: text.to_string(),
        embed: None,
        sender_id: Some(UserId::from("did:plc:bob")),
        epoch: 3,
        decrypted_at: Utc::now(),
    }
}

async fn user_storage(dir: &TempDir, user: &UserId) -> Storage {
    Storage::open_for_user(dir.path(), user, StorageOptions::default())
        .await
        .expect("db")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_one_database_file_per_user() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;
    drop(storage);

    let path = Storage::database_path(dir.path(), &alice);
    assert!(path.exists(), "database file should exist: {}", path.display());
    assert_eq!(
        Storage::database_file_name(&alice),
        Storage::database_file_name(&UserId::from(" DID:PLC:ALICE "))
    );
    assert_ne!(
        Storage::database_file_name(&alice),
        Storage::database_file_name(&UserId::from("did:plc:bob"))
    );
    let name = Storage::database_file_name(&alice);
    assert!(name.starts_with("mls_") && name.ends_with(".sqlite3"));
}

#[tokio::test]
async fn plaintext_cache_is_write_once() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;

    let mut first = plaintext("m1", alice.as_str(), "original");
    first.embed = Some(serde_json::json!({"uri": "at://post/1"}));
    let mut tx = storage.begin_writer("test").await.expect("writer");
    assert!(tx.store_plaintext(&first).await.expect("store"));
    assert!(!tx
        .store_plaintext(&plaintext("m1", alice.as_str(), "overwrite"))
        .await
        .expect("store again"));
    tx.commit().await.expect("commit");

    let cached = storage
        .cached_plaintext(&MessageId::from("m1"), &alice)
        .await
        .expect("lookup")
        .expect("cached");
    assert_eq!(cached.text, "original");
    assert_eq!(cached.embed, first.embed);
    assert_eq!(cached.epoch, 3);
    assert_eq!(cached.sender_id, Some(UserId::from("did:plc:bob")));
}

#[tokio::test]
async fn claim_message_is_compare_and_set() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;
    let message = MessageId::from("m1");
    let convo = ConversationId::from("convo-1");

    let mut tx = storage.begin_writer("test").await.expect("writer");
    assert!(!tx.is_processed(&message, &alice).await.expect("check"));
    assert!(tx.claim_message(&message, &alice, &convo, 2).await.expect("claim"));
    assert!(!tx.claim_message(&message, &alice, &convo, 2).await.expect("reclaim"));
    tx.commit().await.expect("commit");

    assert!(storage.is_processed(&message, &alice).await.expect("check"));
    assert!(!storage
        .is_processed(&message, &UserId::from("did:plc:bob"))
        .await
        .expect("other user"));

    let processed = storage.list_processed(&alice, 10).await.expect("list");
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].epoch, 2);
}

#[tokio::test]
async fn dropped_writer_transaction_rolls_back() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;

    {
        let mut tx = storage.begin_writer("test").await.expect("writer");
        tx.store_plaintext(&plaintext("m1", alice.as_str(), "lost"))
            .await
            .expect("store");
        tx.claim_message(
            &MessageId::from("m1"),
            &alice,
            &ConversationId::from("convo-1"),
            1,
        )
        .await
        .expect("claim");
    }

    assert!(storage
        .cached_plaintext(&MessageId::from("m1"), &alice)
        .await
        .expect("lookup")
        .is_none());
    assert!(!storage
        .is_processed(&MessageId::from("m1"), &alice)
        .await
        .expect("check"));
}

#[tokio::test]
async fn second_writer_waits_for_first_to_commit() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let app = user_storage(&dir, &alice).await;
    let extension = user_storage(&dir, &alice).await;

    let app_tx = app.begin_writer("app").await.expect("app writer");
    let waiter = tokio::spawn(async move {
        let mut tx = extension.begin_writer("extension").await?;
        let seen = tx
            .cached_plaintext(&MessageId::from("m1"), &UserId::from("did:plc:alice"))
            .await?;
        tx.commit().await?;
        anyhow::Ok(seen)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "second writer must block on the lock");

    let mut app_tx = app_tx;
    app_tx
        .store_plaintext(&plaintext("m1", alice.as_str(), "from app"))
        .await
        .expect("store");
    app_tx.commit().await.expect("commit");

    let seen = waiter.await.expect("join").expect("extension writer");
    assert_eq!(seen.map(|p| p.text).as_deref(), Some("from app"));
}

#[tokio::test]
async fn writer_gives_up_after_busy_timeout() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let holder = user_storage(&dir, &alice).await;
    let impatient = Storage::open_for_user(
        dir.path(),
        &alice,
        StorageOptions {
            busy_timeout: Duration::from_millis(100),
            max_connections: 1,
        },
    )
    .await
    .expect("db");

    let held = holder.begin_writer("holder").await.expect("writer");
    let err = impatient
        .begin_writer("impatient")
        .await
        .err()
        .expect("lock should be contended");
    assert!(is_lock_contention(&err), "unexpected error: {err:#}");
    held.rollback().await.expect("rollback");

    impatient
        .begin_writer("impatient")
        .await
        .expect("writer after release")
        .commit()
        .await
        .expect("commit");
}

#[tokio::test]
async fn group_snapshot_is_upserted() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;

    for epoch in [1, 2] {
        let mut tx = storage.begin_writer("test").await.expect("writer");
        tx.save_group_snapshot(
            &alice,
            &GroupSnapshot {
                group_id: b"group".to_vec(),
                epoch,
                member_count: 2,
            },
        )
        .await
        .expect("save");
        tx.commit().await.expect("commit");
    }

    let snapshot = storage
        .group_snapshot(&alice, b"group")
        .await
        .expect("load")
        .expect("snapshot");
    assert_eq!(snapshot.epoch, 2);
    assert_eq!(snapshot.member_count, 2);
}

#[tokio::test]
async fn read_receipts_last_write_wins_and_clear_uses_conversation_field() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap();

    let receipt = |message: &str, convo: &str, at| ReadReceipt {
        message_id: MessageId::from(message),
        conversation_id: ConversationId::from(convo),
        user_id: UserId::from("did:plc:alice"),
        read_at: at,
    };

    storage.upsert_read_receipt(&receipt("m1", "c1", t1)).await.expect("upsert");
    storage.upsert_read_receipt(&receipt("m1", "c1", t2)).await.expect("upsert");
    // Message id embeds the other conversation id; it must survive clearing "c1".
    storage
        .upsert_read_receipt(&receipt("c1-m9", "c2", t1))
        .await
        .expect("upsert");

    let c1 = storage
        .load_read_receipts(&ConversationId::from("c1"))
        .await
        .expect("load");
    assert_eq!(c1.len(), 1);
    assert_eq!(c1[0].read_at, t2);

    let removed = storage
        .clear_read_receipts(&ConversationId::from("c1"))
        .await
        .expect("clear");
    assert_eq!(removed, 1);
    let c2 = storage
        .load_read_receipts(&ConversationId::from("c2"))
        .await
        .expect("load");
    assert_eq!(c2.len(), 1);
    assert_eq!(c2[0].message_id, MessageId::from("c1-m9"));
}

#[tokio::test]
async fn identity_keys_keep_first_write() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = UserId::from("did:plc:alice");

    storage
        .save_identity_keys(&alice, b"first")
        .await
        .expect("save");
    storage
        .save_identity_keys(&alice, b"second")
        .await
        .expect("save");

    let loaded = storage
        .load_identity_keys(&alice)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded, b"first");
}

#[tokio::test]
async fn user_id_case_and_whitespace_do_not_split_cache_or_ledger() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let shouting = UserId::from("  DID:PLC:Alice ");
    let storage = user_storage(&dir, &alice).await;

    let mut tx = storage.begin_writer("test").await.expect("writer");
    assert!(tx
        .store_plaintext(&plaintext("m1", alice.as_str(), "hello"))
        .await
        .expect("store"));
    assert!(tx
        .claim_message(&MessageId::from("m1"), &alice, &ConversationId::from("convo-1"), 3)
        .await
        .expect("claim"));
    assert!(!tx
        .store_plaintext(&plaintext("m1", shouting.as_str(), "again"))
        .await
        .expect("store variant"));
    assert!(!tx
        .claim_message(&MessageId::from("m1"), &shouting, &ConversationId::from("convo-1"), 3)
        .await
        .expect("claim variant"));
    tx.commit().await.expect("commit");

    let cached = storage
        .cached_plaintext(&MessageId::from("m1"), &shouting)
        .await
        .expect("lookup")
        .expect("cached under variant id");
    assert_eq!(cached.text, "hello");
    assert!(storage
        .is_processed(&MessageId::from("m1"), &shouting)
        .await
        .expect("ledger"));
    assert_eq!(
        storage
            .cached_conversation(&shouting, &ConversationId::from("convo-1"))
            .await
            .expect("conversation")
            .len(),
        1
    );
}

#[tokio::test]
async fn mls_state_revision_grows_with_each_save() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;
    assert!(storage.mls_state(&alice).await.expect("load").is_none());

    let mut tx = storage.begin_writer("test").await.expect("writer");
    assert_eq!(tx.save_mls_state(&alice, b"first").await.expect("save"), 1);
    assert_eq!(
        tx.mls_state(&alice).await.expect("load in tx"),
        Some(StoredMlsState {
            state: b"first".to_vec(),
            revision: 1
        })
    );
    tx.commit().await.expect("commit");

    let mut tx = storage.begin_writer("test").await.expect("writer");
    assert_eq!(
        tx.save_mls_state(&UserId::from("DID:PLC:ALICE"), b"second")
            .await
            .expect("save"),
        2
    );
    tx.commit().await.expect("commit");

    let stored = storage.mls_state(&alice).await.expect("load").expect("state");
    assert_eq!(stored.state, b"second");
    assert_eq!(stored.revision, 2);
}

#[tokio::test]
async fn uncommitted_mls_state_is_discarded() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;

    let mut tx = storage.begin_writer("test").await.expect("writer");
    tx.save_mls_state(&alice, b"kept").await.expect("save");
    tx.commit().await.expect("commit");

    let mut tx = storage.begin_writer("test").await.expect("writer");
    tx.save_mls_state(&alice, b"lost").await.expect("save");
    drop(tx);

    let stored = storage.mls_state(&alice).await.expect("load").expect("state");
    assert_eq!(stored.state, b"kept");
    assert_eq!(stored.revision, 1);
}

#[tokio::test]
async fn epoch_secrets_keep_first_write_and_prune_old_epochs() {
    let dir = TempDir::new().expect("tempdir");
    let alice = UserId::from("did:plc:alice");
    let storage = user_storage(&dir, &alice).await;
    let secret = |epoch: u64, byte: u8| EpochSecret {
        group_id: b"group".to_vec(),
        epoch,
        secret: vec![byte; 32],
    };

    let mut tx = storage.begin_writer("test").await.expect("writer");
    for epoch in 0..8 {
        tx.store_epoch_secret(&alice, &secret(epoch, epoch as u8))
            .await
            .expect("store");
    }
    tx.store_epoch_secret(&alice, &secret(7, 0xff))
        .await
        .expect("store duplicate");
    assert_eq!(
        tx.prune_epoch_secrets(&alice, b"group", 7, 5).await.expect("prune"),
        2
    );
    assert_eq!(
        tx.prune_epoch_secrets(&alice, b"group", 3, 5).await.expect("prune young group"),
        0
    );
    tx.commit().await.expect("commit");

    assert_eq!(
        storage.retained_epochs(&alice, b"group").await.expect("epochs"),
        vec![2, 3, 4, 5, 6, 7]
    );
    assert_eq!(
        storage.epoch_secret(&alice, b"group", 7).await.expect("lookup"),
        Some(vec![7u8; 32])
    );
    assert!(storage
        .epoch_secret(&alice, b"group", 0)
        .await
        .expect("lookup")
        .is_none());
}
