//! Postgres-backed repositories.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use linkpost_models::{AccountId, LinkedAccount, NewPost, PostId, PostStatus, ScheduledPost, TokenGrant};

use crate::error::{StoreError, StoreResult};
use crate::repos::{AccountRepository, PostRepository, PostStatusWriter, PostTransition};

const POST_COLUMNS: &str = r#"
    id, account_id, content, media_urls, author_urn, scheduled_for, status,
    external_post_id, error_message, created_at, published_at
"#;

const ACCOUNT_COLUMNS: &str = r#"
    id, linkedin_id, access_token, refresh_token, token_expires_at
"#;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Postgres connection URL
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/linkpost".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/linkpost".to_string()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(
                std::env::var("DATABASE_ACQUIRE_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }
}

/// Postgres implementation of every repository trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        Self::connect(&StoreConfig::from_env()).await
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_post(row: &PgRow) -> StoreResult<ScheduledPost> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<PostStatus>()
            .map_err(StoreError::invalid_row)?;

        Ok(ScheduledPost {
            id: PostId(row.try_get("id")?),
            account_id: AccountId(row.try_get("account_id")?),
            content: row.try_get("content")?,
            media_urls: row.try_get("media_urls")?,
            author_urn: row.try_get("author_urn")?,
            scheduled_for: row.try_get("scheduled_for")?,
            status,
            external_post_id: row.try_get("external_post_id")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }

    fn map_account(row: &PgRow) -> StoreResult<LinkedAccount> {
        Ok(LinkedAccount {
            id: AccountId(row.try_get("id")?),
            linkedin_id: row.try_get("linkedin_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expires_at: row.try_get("token_expires_at")?,
        })
    }
}

#[async_trait]
impl PostRepository for PgStore {
    async fn create(&self, post: &NewPost) -> StoreResult<ScheduledPost> {
        let sql = format!(
            r#"
            INSERT INTO scheduled_posts (account_id, content, media_urls, author_urn, scheduled_for, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING {POST_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(post.account_id.get())
            .bind(&post.content)
            .bind(&post.media_urls)
            .bind(&post.author_urn)
            .bind(post.scheduled_for)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::map_post(&row)?;
        debug!(post_id = %created.id, "Created scheduled post");
        Ok(created)
    }

    async fn find_by_id(&self, id: PostId) -> StoreResult<Option<ScheduledPost>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM scheduled_posts WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_post).transpose()
    }

    async fn list_by_account(&self, account_id: AccountId) -> StoreResult<Vec<ScheduledPost>> {
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM scheduled_posts WHERE account_id = $1 ORDER BY created_at DESC"
        );

        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::map_post).collect()
    }

    async fn find_pending_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledPost>> {
        let sql = format!(
            r#"
            SELECT {POST_COLUMNS} FROM scheduled_posts
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            "#
        );

        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;

        rows.iter().map(Self::map_post).collect()
    }

    async fn delete(&self, id: PostId, account_id: AccountId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_posts
            WHERE id = $1 AND account_id = $2 AND status <> 'published'
            "#,
        )
        .bind(id.get())
        .bind(account_id.get())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PostStatusWriter for PgStore {
    async fn update_status(&self, id: PostId, transition: PostTransition) -> StoreResult<bool> {
        // The `status = 'pending'` guard makes terminal rows immutable.
        let result = match &transition {
            PostTransition::Published {
                external_post_id,
                published_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE scheduled_posts
                    SET status = 'published',
                        external_post_id = $2,
                        published_at = $3,
                        error_message = NULL
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id.get())
                .bind(external_post_id)
                .bind(published_at)
                .execute(&self.pool)
                .await?
            }
            PostTransition::AttemptFailed { error } => {
                sqlx::query(
                    r#"
                    UPDATE scheduled_posts
                    SET error_message = $2
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id.get())
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            PostTransition::Failed { error } => {
                sqlx::query(
                    r#"
                    UPDATE scheduled_posts
                    SET status = 'failed',
                        error_message = $2
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(id.get())
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };

        let applied = result.rows_affected() > 0;
        if applied {
            counter!("linkpost_store_status_writes_total", "transition" => transition.as_str())
                .increment(1);
        }
        Ok(applied)
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    async fn find_by_id(&self, id: AccountId) -> StoreResult<Option<LinkedAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM linked_accounts WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_account).transpose()
    }

    async fn update_tokens(
        &self,
        id: AccountId,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> StoreResult<LinkedAccount> {
        let sql = format!(
            r#"
            UPDATE linked_accounts
            SET access_token = $2,
                refresh_token = COALESCE($3, refresh_token),
                token_expires_at = $4,
                updated_at = $5
            WHERE id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(&grant.access_token)
            .bind(&grant.refresh_token)
            .bind(grant.expires_at(now))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("linked account {}", id)))?;

        Self::map_account(&row)
    }
}
