use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{to_millis, DatabaseError, FeedFollow, FeedFollowRow};

impl Database {
    // ========================================================================
    // Follow Operations
    // ========================================================================

    /// Follow `feed_id` as `user_id`. Following twice fails with
    /// [`DatabaseError::DuplicateKey`].
    pub async fn create_feed_follow(
        &self,
        user_id: i64,
        feed_id: i64,
        now: DateTime<Utc>,
    ) -> Result<FeedFollow, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        // SQLite only allows RETURNING on top-level statements, so the join is a second query.
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_follows (created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, FeedFollowRow>(
            r#"
            SELECT ff.id, ff.created_at, ff.updated_at, ff.user_id, ff.feed_id,
                   u.name AS user_name, f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.id = ?
        "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into_follow())
    }

    /// Feeds followed by `user_id`, in the order they were followed.
    pub async fn get_feed_follows_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<FeedFollow>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedFollowRow>(
            r#"
            SELECT ff.id, ff.created_at, ff.updated_at, ff.user_id, ff.feed_id,
                   u.name AS user_name, f.name AS feed_name
            FROM feed_follows ff
            JOIN users u ON u.id = ff.user_id
            JOIN feeds f ON f.id = ff.feed_id
            WHERE ff.user_id = ?
            ORDER BY ff.created_at, ff.id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedFollowRow::into_follow).collect())
    }

    /// Stop following the feed at `url`. Returns `false` if there was no such follow.
    pub async fn delete_feed_follow(&self, user_id: i64, url: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_follows
            WHERE user_id = ?
              AND feed_id = (SELECT id FROM feeds WHERE url = ?)
        "#,
        )
        .bind(user_id)
        .bind(url)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use chrono::Utc;

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice", Utc::now()).await.unwrap();
        let feed = db
            .create_feed("Blog", "https://example.com/rss", user.id, Utc::now())
            .await
            .unwrap();
        (db, user.id, feed.id)
    }

    #[tokio::test]
    async fn test_follow_returns_names() {
        let (db, user_id, feed_id) = setup().await;

        let follow = db
            .create_feed_follow(user_id, feed_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(follow.user_name, "alice");
        assert_eq!(follow.feed_name, "Blog");
    }

    #[tokio::test]
    async fn test_follow_twice_is_duplicate() {
        let (db, user_id, feed_id) = setup().await;
        db.create_feed_follow(user_id, feed_id, Utc::now())
            .await
            .unwrap();

        let err = db
            .create_feed_follow(user_id, feed_id, Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_unfollow() {
        let (db, user_id, feed_id) = setup().await;
        db.create_feed_follow(user_id, feed_id, Utc::now())
            .await
            .unwrap();

        assert!(db
            .delete_feed_follow(user_id, "https://example.com/rss")
            .await
            .unwrap());
        assert!(db
            .get_feed_follows_for_user(user_id)
            .await
            .unwrap()
            .is_empty());
        assert!(!db
            .delete_feed_follow(user_id, "https://example.com/rss")
            .await
            .unwrap());
    }
}
