use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::fetcher::{FeedClient, FetchError};
use super::parser::FeedEntry;
use super::pubdate::parse_pub_date;
use crate::storage::{Database, DatabaseError, Feed, NewPost};

/// Source of "now" for fetch marks and post timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A pass that stopped before looking at any entry.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not mark feed fetched: {0}")]
    MarkFetched(#[source] DatabaseError),
    #[error("could not collect feed: {0}")]
    Fetch(#[from] FetchError),
}

/// Outcome of one ingestion pass over a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub feed_id: i64,
    pub feed_name: String,
    /// Entries in the fetched document
    pub found: usize,
    /// Posts newly stored
    pub saved: usize,
    /// Entries whose link was already stored
    pub duplicates: usize,
    /// Entries that failed to store for any other reason
    pub failed: usize,
    /// Entries stored without a date because their pubDate did not parse
    pub undated: usize,
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} found, {} saved", self.found, self.saved)
    }
}

/// Runs ingestion passes: mark fetched, fetch, store new posts.
#[derive(Clone)]
pub struct Ingester {
    db: Database,
    client: FeedClient,
    clock: Arc<dyn Clock>,
}

impl Ingester {
    pub fn new(db: Database, client: FeedClient) -> Self {
        Self::with_clock(db, client, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, client: FeedClient, clock: Arc<dyn Clock>) -> Self {
        Self { db, client, clock }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// One ingestion pass over `feed`.
    ///
    /// The feed is marked fetched *before* the network call, so a feed that
    /// keeps failing still moves to the back of the rotation. Fetch and parse
    /// failures end the pass without touching posts. Per-entry problems
    /// (unparseable date, duplicate link, a failed insert) are logged and
    /// counted; the remaining entries are still processed.
    pub async fn ingest(&self, feed: &Feed) -> Result<IngestReport, IngestError> {
        self.db
            .mark_feed_fetched(feed.id, self.clock.now())
            .await
            .map_err(|e| {
                tracing::error!(feed = %feed.name, error = %e, "Couldn't mark feed fetched");
                IngestError::MarkFetched(e)
            })?;

        let doc = self.client.fetch(&feed.url).await.map_err(|e| {
            tracing::warn!(feed = %feed.name, url = %feed.url, error = %e, "Couldn't collect feed");
            IngestError::Fetch(e)
        })?;

        let mut report = IngestReport {
            feed_id: feed.id,
            feed_name: feed.name.clone(),
            found: doc.items.len(),
            ..IngestReport::default()
        };

        for entry in &doc.items {
            self.store_entry(feed, entry, &mut report).await;
        }

        tracing::info!(
            feed = %feed.name,
            found = report.found,
            saved = report.saved,
            duplicates = report.duplicates,
            failed = report.failed,
            "Feed collected: {}",
            report
        );
        Ok(report)
    }

    async fn store_entry(&self, feed: &Feed, entry: &FeedEntry, report: &mut IngestReport) {
        let published_at = match parse_pub_date(&entry.pub_date) {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(feed = %feed.name, post = %entry.title, error = %e, "Storing post without a publish date");
                report.undated += 1;
                None
            }
        };

        let now = self.clock.now();
        let post = NewPost {
            created_at: now,
            updated_at: now,
            title: entry.title.clone(),
            url: entry.link.clone(),
            description: Some(entry.description.clone()).filter(|d| !d.is_empty()),
            published_at,
            feed_id: feed.id,
        };

        match self.db.insert_post(&post).await {
            Ok(stored) => {
                report.saved += 1;
                tracing::info!(feed = %feed.name, post = %stored.title, "Saved post");
            }
            Err(DatabaseError::DuplicateKey(_)) => {
                report.duplicates += 1;
                tracing::debug!(feed = %feed.name, url = %entry.link, "Post already stored");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(feed = %feed.name, post = %entry.title, error = %e, "Error saving post");
            }
        }
    }
}
