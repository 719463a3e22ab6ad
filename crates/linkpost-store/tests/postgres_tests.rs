//! Postgres integration tests.

use chrono::{Duration, Utc};
use sqlx::Row;

use linkpost_models::{AccountId, NewPost, PostStatus, TokenGrant};
use linkpost_store::{AccountRepository, PgStore, PostRepository, PostStatusWriter, PostTransition};

async fn store_with_account() -> (PgStore, AccountId) {
    dotenvy::dotenv().ok();

    let store = PgStore::from_env().await.expect("Failed to connect to Postgres");
    store.migrate().await.expect("Failed to run migrations");

    let linkedin_id = format!("test-member-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let row = sqlx::query(
        "INSERT INTO linked_accounts (linkedin_id, access_token, refresh_token) VALUES ($1, 'token', 'refresh') RETURNING id",
    )
    .bind(&linkedin_id)
    .fetch_one(store.pool())
    .await
    .expect("Failed to insert account");

    let id: i64 = row.get("id");
    (store, AccountId(id))
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_post_lifecycle() {
    let (store, account_id) = store_with_account().await;

    let post = store
        .create(&NewPost::new(account_id, "Integration post", Utc::now() + Duration::minutes(5)))
        .await
        .expect("Failed to create post");
    assert_eq!(post.status, PostStatus::Pending);

    let applied = store
        .update_status(
            post.id,
            PostTransition::AttemptFailed {
                error: "rate limited".to_string(),
            },
        )
        .await
        .expect("Failed to record attempt");
    assert!(applied);

    let applied = store
        .update_status(
            post.id,
            PostTransition::Published {
                external_post_id: "urn:li:share:123".to_string(),
                published_at: Utc::now(),
            },
        )
        .await
        .expect("Failed to publish");
    assert!(applied);

    // Terminal rows are immutable
    let applied = store
        .update_status(
            post.id,
            PostTransition::Failed {
                error: "late failure".to_string(),
            },
        )
        .await
        .expect("Failed to run update");
    assert!(!applied);

    let stored = PostRepository::find_by_id(&store, post.id)
        .await
        .expect("Failed to load post")
        .expect("Post missing");
    assert_eq!(stored.status, PostStatus::Published);
    assert_eq!(stored.external_post_id.as_deref(), Some("urn:li:share:123"));
    assert!(stored.error_message.is_none());

    // Published posts cannot be deleted
    assert!(!store.delete(post.id, account_id).await.expect("Failed to delete"));
}

#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_update_tokens() {
    let (store, account_id) = store_with_account().await;
    let now = Utc::now();

    let account = store
        .update_tokens(
            account_id,
            &TokenGrant {
                access_token: "fresh".to_string(),
                refresh_token: None,
                expires_in: 60,
            },
            now,
        )
        .await
        .expect("Failed to update tokens");

    assert_eq!(account.access_token, "fresh");
    assert_eq!(account.refresh_token.as_deref(), Some("refresh"));
    assert!(!account.is_token_expired_at(now));
}
