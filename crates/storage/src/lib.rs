use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use domwatch_core::{Bookmark, DomainStatus, HistoryEntry, Subscription, UnknownStatusError};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for the subscriptions table.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the per-check history log.
    pub fn history(&self) -> HistoryRepository {
        HistoryRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn bookmarks(&self) -> BookmarkRepository {
        BookmarkRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable mapping from (user, domain) to the last known status.
///
/// Implementations must be safe to call concurrently from several workers and
/// must not cache: a write is visible to every later read.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Snapshot of every subscription at call time.
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn get(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Insert-or-replace keyed by (user_id, domain). `created_at` of an existing row is kept.
    async fn upsert(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Inserts a new pair only while the user holds fewer than `limit` rows.
    ///
    /// The count and the insert happen in one statement, so concurrent calls
    /// cannot push a user past the cap. Returns `false` when the cap refused it.
    async fn insert_within_limit(
        &self,
        subscription: &Subscription,
        limit: u32,
    ) -> Result<bool, StoreError>;

    /// Returns `true` when a row existed.
    async fn delete(&self, user_id: &str, domain: &str) -> Result<bool, StoreError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError>;

    async fn count_for_user(&self, user_id: &str) -> Result<u32, StoreError>;
}

/// Repository for the `subscriptions` table.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Lists every subscription ordered by key.
    pub async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT user_id, domain, current_status, last_check, created_at \
             FROM subscriptions ORDER BY user_id, domain",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRow::into_domain).collect()
    }

    /// Loads a single subscription.
    pub async fn get(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT user_id, domain, current_status, last_check, created_at \
             FROM subscriptions WHERE user_id = ? AND domain = ?",
        )
        .bind(user_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_domain).transpose()
    }

    /// Inserts the subscription or overwrites its status and `last_check`.
    pub async fn upsert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, domain, current_status, last_check, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, domain) DO UPDATE \
             SET current_status = excluded.current_status, \
                 last_check = excluded.last_check",
        )
        .bind(&subscription.user_id)
        .bind(&subscription.domain)
        .bind(subscription.current_status.as_str())
        .bind(subscription.last_check.map(to_rfc3339))
        .bind(to_rfc3339(subscription.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Capped insert; see [`SubscriptionStore::insert_within_limit`].
    pub async fn insert_within_limit(
        &self,
        subscription: &Subscription,
        limit: u32,
    ) -> Result<bool, StoreError> {
        // The SELECT needs its WHERE clause for SQLite to accept the upsert tail.
        let result = sqlx::query(
            "INSERT INTO subscriptions (user_id, domain, current_status, last_check, created_at) \
             SELECT ?, ?, ?, ?, ? \
             WHERE (SELECT COUNT(*) FROM subscriptions WHERE user_id = ?) < ? \
             ON CONFLICT(user_id, domain) DO UPDATE \
             SET current_status = excluded.current_status, \
                 last_check = excluded.last_check",
        )
        .bind(&subscription.user_id)
        .bind(&subscription.domain)
        .bind(subscription.current_status.as_str())
        .bind(subscription.last_check.map(to_rfc3339))
        .bind(to_rfc3339(subscription.created_at))
        .bind(&subscription.user_id)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Removes a subscription, returning whether a row existed.
    pub async fn delete(&self, user_id: &str, domain: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE user_id = ? AND domain = ?")
            .bind(user_id)
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists a user's subscriptions, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT user_id, domain, current_status, last_check, created_at \
             FROM subscriptions WHERE user_id = ? \
             ORDER BY created_at DESC, domain ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRow::into_domain).collect()
    }

    /// Counts a user's active subscriptions.
    pub async fn count_for_user(&self, user_id: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM subscriptions WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let total: i64 = row.get("total");
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl SubscriptionStore for SubscriptionRepository {
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        SubscriptionRepository::list_all(self).await
    }

    async fn get(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        SubscriptionRepository::get(self, user_id, domain).await
    }

    async fn upsert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        SubscriptionRepository::upsert(self, subscription).await
    }

    async fn insert_within_limit(
        &self,
        subscription: &Subscription,
        limit: u32,
    ) -> Result<bool, StoreError> {
        SubscriptionRepository::insert_within_limit(self, subscription, limit).await
    }

    async fn delete(&self, user_id: &str, domain: &str) -> Result<bool, StoreError> {
        SubscriptionRepository::delete(self, user_id, domain).await
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        SubscriptionRepository::list_for_user(self, user_id).await
    }

    async fn count_for_user(&self, user_id: &str) -> Result<u32, StoreError> {
        SubscriptionRepository::count_for_user(self, user_id).await
    }
}

/// Raw `subscriptions` row.
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    domain: String,
    current_status: String,
    last_check: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_domain(self) -> Result<Subscription, StoreError> {
        let current_status = self.current_status.parse::<DomainStatus>()?;
        Ok(Subscription {
            user_id: self.user_id,
            domain: self.domain,
            current_status,
            last_check: self.last_check,
            created_at: self.created_at,
        })
    }
}

/// Append-only log of observations made for a user.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), StoreError>;

    /// Most recent entries first.
    async fn recent_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Repository for the `check_history` table.
#[derive(Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

#[async_trait]
impl HistoryStore for HistoryRepository {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO check_history (user_id, domain, status, checked_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.user_id)
        .bind(&entry.domain)
        .bind(entry.status.as_str())
        .bind(to_rfc3339(entry.checked_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT user_id, domain, status, checked_at FROM check_history \
             WHERE user_id = ? ORDER BY checked_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(HistoryRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    user_id: String,
    domain: String,
    status: String,
    checked_at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_domain(self) -> Result<HistoryEntry, StoreError> {
        Ok(HistoryEntry {
            status: self.status.parse::<DomainStatus>()?,
            user_id: self.user_id,
            domain: self.domain,
            checked_at: self.checked_at,
        })
    }
}

/// Result of [`BookmarkStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkInsert {
    Added,
    AlreadyPresent,
    LimitReached,
}

#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// Adds a bookmark unless the user already holds `limit` of them.
    async fn add(&self, bookmark: &Bookmark, limit: u32) -> Result<BookmarkInsert, StoreError>;

    async fn remove(&self, user_id: &str, domain: &str) -> Result<bool, StoreError>;

    /// Newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Bookmark>, StoreError>;
}

/// Repository for the `bookmarks` table.
#[derive(Clone)]
pub struct BookmarkRepository {
    pool: SqlitePool,
}

#[async_trait]
impl BookmarkStore for BookmarkRepository {
    async fn add(&self, bookmark: &Bookmark, limit: u32) -> Result<BookmarkInsert, StoreError> {
        let result = sqlx::query(
            "INSERT INTO bookmarks (user_id, domain, added_at) \
             SELECT ?, ?, ? \
             WHERE (SELECT COUNT(*) FROM bookmarks WHERE user_id = ?) < ? \
             ON CONFLICT(user_id, domain) DO NOTHING",
        )
        .bind(&bookmark.user_id)
        .bind(&bookmark.domain)
        .bind(to_rfc3339(bookmark.added_at))
        .bind(&bookmark.user_id)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(BookmarkInsert::Added);
        }

        let existing = sqlx::query("SELECT 1 FROM bookmarks WHERE user_id = ? AND domain = ?")
            .bind(&bookmark.user_id)
            .bind(&bookmark.domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(if existing.is_some() {
            BookmarkInsert::AlreadyPresent
        } else {
            BookmarkInsert::LimitReached
        })
    }

    async fn remove(&self, user_id: &str, domain: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE user_id = ? AND domain = ?")
            .bind(user_id)
            .bind(domain)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
            "SELECT user_id, domain, added_at FROM bookmarks \
             WHERE user_id = ? ORDER BY added_at DESC, domain ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, domain, added_at)| Bookmark {
                user_id,
                domain,
                added_at,
            })
            .collect())
    }
}

/// Errors that can occur while reading or writing subscriptions, history or bookmarks.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to decode stored status: {0}")]
    Decode(#[from] UnknownStatusError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
