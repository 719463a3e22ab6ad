//! In-memory repositories for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use linkpost_models::{AccountId, LinkedAccount, NewPost, PostId, PostStatus, ScheduledPost, TokenGrant};

use crate::error::{StoreError, StoreResult};
use crate::repos::{AccountRepository, PostRepository, PostStatusWriter, PostTransition};

#[derive(Default)]
struct Tables {
    posts: HashMap<PostId, ScheduledPost>,
    accounts: HashMap<AccountId, LinkedAccount>,
}

/// Store keeping every row in process memory.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    next_post_id: Arc<AtomicI64>,
    status_writes: Arc<AtomicUsize>,
    token_writes: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an account.
    pub async fn insert_account(&self, account: LinkedAccount) {
        self.tables.write().await.accounts.insert(account.id, account);
    }

    /// Insert a post row verbatim, bypassing id allocation.
    pub async fn insert_post(&self, post: ScheduledPost) {
        self.next_post_id.fetch_max(post.id.get(), Ordering::SeqCst);
        self.tables.write().await.posts.insert(post.id, post);
    }

    /// Number of status transitions that were applied.
    pub fn status_write_count(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Number of credential updates that were persisted.
    pub fn token_write_count(&self) -> usize {
        self.token_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostRepository for InMemoryStore {
    async fn create(&self, post: &NewPost) -> StoreResult<ScheduledPost> {
        let id = PostId(self.next_post_id.fetch_add(1, Ordering::SeqCst) + 1);
        let row = ScheduledPost {
            id,
            account_id: post.account_id,
            content: post.content.clone(),
            media_urls: post.media_urls.clone(),
            author_urn: post.author_urn.clone(),
            scheduled_for: post.scheduled_for,
            status: PostStatus::Pending,
            external_post_id: None,
            error_message: None,
            created_at: Utc::now(),
            published_at: None,
        };

        self.tables.write().await.posts.insert(id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: PostId) -> StoreResult<Option<ScheduledPost>> {
        Ok(self.tables.read().await.posts.get(&id).cloned())
    }

    async fn list_by_account(&self, account_id: AccountId) -> StoreResult<Vec<ScheduledPost>> {
        let tables = self.tables.read().await;
        let mut posts: Vec<_> = tables
            .posts
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(posts)
    }

    async fn find_pending_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledPost>> {
        let tables = self.tables.read().await;
        let mut posts: Vec<_> = tables
            .posts
            .values()
            .filter(|p| p.is_pending() && p.scheduled_for <= now)
            .cloned()
            .collect();
        posts.sort_by_key(|p| (p.scheduled_for, p.id));
        Ok(posts)
    }

    async fn delete(&self, id: PostId, account_id: AccountId) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let deletable = tables
            .posts
            .get(&id)
            .map(|p| p.account_id == account_id && p.status != PostStatus::Published)
            .unwrap_or(false);

        if deletable {
            tables.posts.remove(&id);
        }
        Ok(deletable)
    }
}

#[async_trait]
impl PostStatusWriter for InMemoryStore {
    async fn update_status(&self, id: PostId, transition: PostTransition) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let applied = match tables.posts.get_mut(&id) {
            Some(post) => transition.apply(post),
            None => false,
        };

        if applied {
            self.status_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(applied)
    }
}

#[async_trait]
impl AccountRepository for InMemoryStore {
    async fn find_by_id(&self, id: AccountId) -> StoreResult<Option<LinkedAccount>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn update_tokens(
        &self,
        id: AccountId,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> StoreResult<LinkedAccount> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("linked account {}", id)))?;

        account.access_token = grant.access_token.clone();
        if let Some(refresh) = &grant.refresh_token {
            account.refresh_token = Some(refresh.clone());
        }
        account.token_expires_at = Some(grant.expires_at(now));

        self.token_writes.fetch_add(1, Ordering::SeqCst);
        Ok(account.clone())
    }
}
