//! Feed collection: fetching, decoding and storing RSS posts.
//!
//! - [`fetcher`] - HTTP retrieval of one RSS document with a per-fetch timeout
//! - [`parser`] - event-based RSS 2.0 decoding plus HTML unescaping
//! - [`pubdate`] - `<pubDate>` normalization over a table of layouts
//! - [`ingest`] - one ingestion pass: mark fetched, fetch, store new posts
//! - [`scheduler`] - the interval loop that runs one pass per tick
//!
//! ```ignore
//! use gator::feed::{parse_interval, FeedClient, Ingester, PollScheduler};
//!
//! let client = FeedClient::new("gator", Duration::from_secs(10))?;
//! let scheduler = PollScheduler::new(Ingester::new(db, client), parse_interval("1m")?)?;
//! scheduler.run_until(tokio::signal::ctrl_c().map(|_| ())).await;
//! ```

pub mod fetcher;
pub mod ingest;
pub mod parser;
pub mod pubdate;
pub mod scheduler;

pub use fetcher::{FeedClient, FetchError, DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT};
pub use ingest::{Clock, IngestError, IngestReport, Ingester, SystemClock};
pub use parser::{parse_rss, unescape_html, FeedDocument, FeedEntry, ParseError};
pub use pubdate::{parse_pub_date, DateParseError, Layout, LAYOUTS};
pub use scheduler::{parse_interval, IntervalError, PollScheduler, PollTask, TickOutcome};
