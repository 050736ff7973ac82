use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{to_millis, DatabaseError, Feed, FeedRow, FeedWithOwner, FeedWithOwnerRow};

const FEED_COLUMNS: &str = "id, created_at, updated_at, name, url, user_id, last_fetched_at";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Register a feed. An already-registered URL fails with
    /// [`DatabaseError::DuplicateKey`].
    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Feed, DatabaseError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            r#"
            INSERT INTO feeds (created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_feed())
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedRow::into_feed))
    }

    /// All feeds with the name of the user who registered them, oldest first.
    pub async fn list_feeds_with_owners(&self) -> Result<Vec<FeedWithOwner>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedWithOwnerRow>(
            r#"
            SELECT f.id, f.created_at, f.updated_at, f.name, f.url, f.user_id,
                   f.last_fetched_at, u.name AS owner_name
            FROM feeds f
            JOIN users u ON u.id = f.user_id
            ORDER BY f.created_at, f.id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FeedWithOwner {
                feed: row.feed.into_feed(),
                owner_name: row.owner_name,
            })
            .collect())
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// The feed that has waited longest since its last fetch.
    ///
    /// Never-fetched feeds (NULL) come first; ties are broken by id so the
    /// choice is deterministic for a given stored state.
    pub async fn get_next_feed_to_poll(&self) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST, id ASC
            LIMIT 1
        "#
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedRow::into_feed))
    }

    /// Record that `feed_id` was fetched at `fetched_at`.
    ///
    /// The stored value never moves backwards: an older `fetched_at` than the
    /// one on record leaves `last_fetched_at` unchanged.
    pub async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        fetched_at: DateTime<Utc>,
    ) -> Result<Feed, DatabaseError> {
        let ts = to_millis(fetched_at);
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            r#"
            UPDATE feeds
            SET last_fetched_at = MAX(COALESCE(last_fetched_at, ?), ?),
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(FeedRow::into_feed)
            .ok_or_else(|| DatabaseError::NotFound(format!("feed {}", feed_id)))
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn seed_feeds(db: &Database, count: usize) -> Vec<i64> {
        let user = db.create_user("owner", at(0)).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let feed = db
                .create_feed(
                    &format!("Feed {}", i),
                    &format!("https://feed{}.example.com/rss", i),
                    user.id,
                    at(0),
                )
                .await
                .unwrap();
            ids.push(feed.id);
        }
        ids
    }

    #[tokio::test]
    async fn test_create_feed_duplicate_url() {
        let db = test_db().await;
        let user = db.create_user("alice", at(0)).await.unwrap();
        db.create_feed("One", "https://example.com/rss", user.id, at(0))
            .await
            .unwrap();

        let err = db
            .create_feed("Two", "https://example.com/rss", user.id, at(1))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_get_feed_by_url() {
        let db = test_db().await;
        let ids = seed_feeds(&db, 2).await;

        let feed = db
            .get_feed_by_url("https://feed1.example.com/rss")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.id, ids[1]);
        assert_eq!(feed.last_fetched_at, None);
        assert!(db
            .get_feed_by_url("https://nope.example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_feeds_with_owners() {
        let db = test_db().await;
        seed_feeds(&db, 2).await;

        let feeds = db.list_feeds_with_owners().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert!(feeds.iter().all(|f| f.owner_name == "owner"));
        assert_eq!(feeds[0].feed.name, "Feed 0");
    }

    #[tokio::test]
    async fn test_next_feed_none_when_empty() {
        let db = test_db().await;
        assert!(db.get_next_feed_to_poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_never_fetched_selected_before_fetched() {
        let db = test_db().await;
        let ids = seed_feeds(&db, 3).await;

        // Feeds 0 and 2 were fetched; feed 1 never was.
        db.mark_feed_fetched(ids[0], at(10)).await.unwrap();
        db.mark_feed_fetched(ids[2], at(5)).await.unwrap();

        let next = db.get_next_feed_to_poll().await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
    }

    #[tokio::test]
    async fn test_earliest_fetch_selected_first() {
        let db = test_db().await;
        let ids = seed_feeds(&db, 3).await;

        db.mark_feed_fetched(ids[0], at(30)).await.unwrap();
        db.mark_feed_fetched(ids[1], at(10)).await.unwrap();
        db.mark_feed_fetched(ids[2], at(20)).await.unwrap();

        let next = db.get_next_feed_to_poll().await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
    }

    #[tokio::test]
    async fn test_rotation_visits_every_feed() {
        let db = test_db().await;
        let ids = seed_feeds(&db, 3).await;

        let mut visited = Vec::new();
        for tick in 0..6 {
            let next = db.get_next_feed_to_poll().await.unwrap().unwrap();
            visited.push(next.id);
            db.mark_feed_fetched(next.id, at(tick)).await.unwrap();
        }

        let expected: Vec<i64> = ids.iter().chain(ids.iter()).copied().collect();
        assert_eq!(visited, expected);
    }

    #[tokio::test]
    async fn test_mark_fetched_is_monotonic() {
        let db = test_db().await;
        let ids = seed_feeds(&db, 1).await;

        let feed = db.mark_feed_fetched(ids[0], at(100)).await.unwrap();
        assert_eq!(feed.last_fetched_at, Some(at(100)));

        let feed = db
            .mark_feed_fetched(ids[0], at(100) - Duration::seconds(50))
            .await
            .unwrap();
        assert_eq!(feed.last_fetched_at, Some(at(100)));

        let feed = db.mark_feed_fetched(ids[0], at(200)).await.unwrap();
        assert_eq!(feed.last_fetched_at, Some(at(200)));
    }

    #[tokio::test]
    async fn test_mark_fetched_unknown_feed() {
        let db = test_db().await;
        let err = db.mark_feed_fetched(999, at(0)).await.unwrap_err();
        assert!(matches!(err, crate::storage::DatabaseError::NotFound(_)));
    }
}
