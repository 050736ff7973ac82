use super::schema::Database;
use super::types::{to_millis, DatabaseError, NewPost, Post, PostRow, PostWithFeed, PostWithFeedRow};

/// Upper bound on `browse` page size (OOM protection)
const MAX_BROWSE_LIMIT: i64 = 500;

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert a post keyed by its link.
    ///
    /// A link that is already stored fails with [`DatabaseError::DuplicateKey`]
    /// and leaves the existing row untouched. Callers ingesting feeds treat
    /// that as "already known". This holds under concurrent writers too, since
    /// the UNIQUE(url) constraint is what rejects the second insert.
    pub async fn insert_post(&self, post: &NewPost) -> Result<Post, DatabaseError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            INSERT INTO posts (created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, created_at, updated_at, title, url, description, published_at, feed_id
        "#,
        )
        .bind(to_millis(post.created_at))
        .bind(to_millis(post.updated_at))
        .bind(&post.title)
        .bind(&post.url)
        .bind(&post.description)
        .bind(post.published_at.map(to_millis))
        .bind(post.feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_post())
    }

    /// Posts stored for one feed, newest publication first (undated last).
    pub async fn get_posts_for_feed(&self, feed_id: i64) -> Result<Vec<Post>, DatabaseError> {
        let rows = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT id, created_at, updated_at, title, url, description, published_at, feed_id
            FROM posts
            WHERE feed_id = ?
            ORDER BY published_at DESC NULLS LAST, id
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PostRow::into_post).collect())
    }

    pub async fn count_posts(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Newest posts across the feeds `user_id` follows.
    ///
    /// `limit` is clamped to `1..=MAX_BROWSE_LIMIT`.
    pub async fn get_posts_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<PostWithFeed>, DatabaseError> {
        let limit = limit.clamp(1, MAX_BROWSE_LIMIT);
        let rows = sqlx::query_as::<_, PostWithFeedRow>(
            r#"
            SELECT p.id, p.created_at, p.updated_at, p.title, p.url, p.description,
                   p.published_at, p.feed_id, f.name AS feed_name
            FROM posts p
            JOIN feed_follows ff ON ff.feed_id = p.feed_id
            JOIN feeds f ON f.id = p.feed_id
            WHERE ff.user_id = ?
            ORDER BY p.published_at DESC NULLS LAST, p.created_at DESC, p.id DESC
            LIMIT ?
        "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PostWithFeed {
                post: row.post.into_post(),
                feed_name: row.feed_name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewPost};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn new_post(feed_id: i64, url: &str, published: Option<i64>) -> NewPost {
        NewPost {
            created_at: at(0),
            updated_at: at(0),
            title: format!("Title for {}", url),
            url: url.to_string(),
            description: None,
            published_at: published.map(at),
            feed_id,
        }
    }

    async fn setup() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice", at(0)).await.unwrap();
        let feed = db
            .create_feed("Blog", "https://example.com/rss", user.id, at(0))
            .await
            .unwrap();
        (db, user.id, feed.id)
    }

    #[tokio::test]
    async fn test_insert_post_roundtrips_fields() {
        let (db, _, feed_id) = setup().await;
        let mut post = new_post(feed_id, "https://example.com/a", Some(60));
        post.description = Some("Body".to_string());

        let stored = db.insert_post(&post).await.unwrap();
        assert_eq!(stored.url, "https://example.com/a");
        assert_eq!(stored.description.as_deref(), Some("Body"));
        assert_eq!(stored.published_at, Some(at(60)));
        assert_eq!(stored.feed_id, feed_id);
    }

    #[tokio::test]
    async fn test_duplicate_link_is_duplicate_key() {
        let (db, _, feed_id) = setup().await;
        db.insert_post(&new_post(feed_id, "https://example.com/a", None))
            .await
            .unwrap();

        let mut again = new_post(feed_id, "https://example.com/a", Some(5));
        again.title = "Changed title".to_string();
        let err = db.insert_post(&again).await.unwrap_err();
        assert!(err.is_duplicate_key(), "expected DuplicateKey, got {:?}", err);

        // The original row is untouched
        let posts = db.get_posts_for_feed(feed_id).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Title for https://example.com/a");
        assert_eq!(posts[0].published_at, None);
    }

    #[tokio::test]
    async fn test_posts_for_user_only_followed_feeds() {
        let (db, user_id, feed_id) = setup().await;
        let other = db
            .create_feed("Other", "https://other.example.com/rss", user_id, at(0))
            .await
            .unwrap();
        db.create_feed_follow(user_id, feed_id, at(0)).await.unwrap();

        db.insert_post(&new_post(feed_id, "https://example.com/old", Some(10)))
            .await
            .unwrap();
        db.insert_post(&new_post(feed_id, "https://example.com/new", Some(20)))
            .await
            .unwrap();
        db.insert_post(&new_post(other.id, "https://other.example.com/x", Some(30)))
            .await
            .unwrap();

        let posts = db.get_posts_for_user(user_id, 10).await.unwrap();
        let urls: Vec<&str> = posts.iter().map(|p| p.post.url.as_str()).collect();
        assert_eq!(urls, vec!["https://example.com/new", "https://example.com/old"]);
        assert!(posts.iter().all(|p| p.feed_name == "Blog"));

        let limited = db.get_posts_for_user(user_id, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
