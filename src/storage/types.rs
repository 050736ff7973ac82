use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of gator appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// A UNIQUE constraint rejected the write (e.g. a post link that is already stored)
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The row addressed by the operation does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error by the driver-reported kind and result code.
    ///
    /// Unique violations become [`DatabaseError::DuplicateKey`] and lock
    /// contention becomes [`DatabaseError::InstanceLocked`]. Nothing here
    /// inspects the message text.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::DuplicateKey(db_err.message().to_string());
            }
            let code = db_err.code();
            if matches!(code.as_deref(), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                return DatabaseError::InstanceLocked;
            }
        }
        DatabaseError::Other(err)
    }

    /// True when the error is the "row already exists" case of a UNIQUE constraint.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, DatabaseError::DuplicateKey(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from_sqlx(err)
    }
}

// ============================================================================
// Timestamp helpers
// ============================================================================

/// Instants are stored as UTC milliseconds since the epoch.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

/// A registered RSS source with rotation metadata.
///
/// `last_fetched_at` is `None` until the first ingestion pass marks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Feed listing row joined with the owning user's name.
#[derive(Debug, Clone)]
pub struct FeedWithOwner {
    pub feed: Feed,
    pub owner_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFollow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

/// A deduplicated entry persisted from a feed. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: i64,
}

/// Post listing row for `browse`, carrying the feed's display name.
#[derive(Debug, Clone)]
pub struct PostWithFeed {
    pub post: Post,
    pub feed_name: String,
}

/// Parameters for [`Database::insert_post`](super::Database::insert_post).
#[derive(Debug, Clone)]
pub struct NewPost {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: i64,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
}

impl UserRow {
    pub(crate) fn into_user(self) -> User {
        User {
            id: self.id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            name: self.name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at: Option<i64>,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            name: self.name,
            url: self.url,
            user_id: self.user_id,
            last_fetched_at: self.last_fetched_at.map(from_millis),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedWithOwnerRow {
    #[sqlx(flatten)]
    pub feed: FeedRow,
    pub owner_name: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedFollowRow {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

impl FeedFollowRow {
    pub(crate) fn into_follow(self) -> FeedFollow {
        FeedFollow {
            id: self.id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            user_id: self.user_id,
            feed_id: self.feed_id,
            user_name: self.user_name,
            feed_name: self.feed_name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<i64>,
    pub feed_id: i64,
}

impl PostRow {
    pub(crate) fn into_post(self) -> Post {
        Post {
            id: self.id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            title: self.title,
            url: self.url,
            description: self.description,
            published_at: self.published_at.map(from_millis),
            feed_id: self.feed_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostWithFeedRow {
    #[sqlx(flatten)]
    pub post: PostRow,
    pub feed_name: String,
}
