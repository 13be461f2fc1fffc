use chrono::Utc;
use mls::{load_or_create_identity, GroupSnapshot};
use shared::domain::{ConversationId, DecryptedPlaintext, MessageId, UserId};
use storage::{Storage, StorageOptions};
use tempfile::TempDir;

/// Two handles on the same user database stand in for the foreground app and
/// the notification extension.
#[tokio::test]
async fn app_and_extension_share_cache_ledger_and_identity() {
    let dir = TempDir::new().expect("tempdir");
    let user = UserId::from("did:plc:alice");
    let app = Storage::open_for_user(dir.path(), &user, StorageOptions::default())
        .await
        .expect("app db");
    let extension =
        Storage::open_for_user(dir.path(), &UserId::from("DID:PLC:ALICE"), StorageOptions::default())
            .await
            .expect("extension db");

    let app_identity = load_or_create_identity(&app, &user)
        .await
        .expect("app identity");
    let extension_identity = load_or_create_identity(&extension, &user)
        .await
        .expect("extension identity");
    assert_eq!(
        app_identity.to_bytes().expect("bytes"),
        extension_identity.to_bytes().expect("bytes")
    );

    let message = MessageId::from("msg-42");
    let convo = ConversationId::from("convo-a");
    let mut tx = extension.begin_writer("extension").await.expect("writer");
    assert!(tx
        .claim_message(&message, &user, &convo, 7)
        .await
        .expect("claim"));
    tx.store_plaintext(&DecryptedPlaintext {
        message_id: message.clone(),
        user_id: user.clone(),
        conversation_id: convo.clone(),
        text: "see you at eight".into(),
        embed: None,
        sender_id: Some(UserId::from("did:plc:bob")),
        epoch: 7,
        decrypted_at: Utc::now(),
    })
    .await
    .expect("store");
    tx.save_group_snapshot(
        &user,
        &GroupSnapshot {
            group_id: b"convo-a".to_vec(),
            epoch: 7,
            member_count: 2,
        },
    )
    .await
    .expect("snapshot");
    tx.commit().await.expect("commit");

    assert!(app.is_processed(&message, &user).await.expect("ledger"));
    let cached = app
        .cached_plaintext(&message, &user)
        .await
        .expect("lookup")
        .expect("cached in app");
    assert_eq!(cached.text, "see you at eight");
    assert_eq!(
        app.cached_conversation(&user, &convo)
            .await
            .expect("conversation")
            .len(),
        1
    );
    assert_eq!(
        app.group_snapshot(&user, b"convo-a")
            .await
            .expect("load")
            .map(|s| s.epoch),
        Some(7)
    );

    let mut tx = app.begin_writer("app").await.expect("writer");
    assert!(!tx
        .claim_message(&message, &user, &convo, 7)
        .await
        .expect("second claim"));
    tx.rollback().await.expect("rollback");
}
