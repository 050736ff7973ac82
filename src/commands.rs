//! Subcommand handlers.
//!
//! Each handler takes the shared [`State`] and writes its user-facing output
//! to `out`. Handlers that act on behalf of a user first resolve a
//! [`Session`] from the configured current user name.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;

use crate::config::Config;
use crate::feed::{parse_interval, FeedClient, FeedDocument, Ingester, PollScheduler};
use crate::storage::{Database, DatabaseError, User};

/// Default number of posts shown by `browse`.
pub const DEFAULT_BROWSE_LIMIT: i64 = 2;

/// Everything a handler may touch.
pub struct State {
    pub db: Database,
    pub config: Config,
    pub config_path: PathBuf,
}

/// The logged-in user, resolved against the database.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
}

impl State {
    pub fn new(db: Database, config: Config, config_path: PathBuf) -> Self {
        Self {
            db,
            config,
            config_path,
        }
    }

    /// Resolve the current user. Fails if nobody is logged in or the
    /// configured user no longer exists (e.g. after `reset`).
    pub async fn session(&self) -> Result<Session> {
        let Some(name) = self.config.current_user_name.as_deref() else {
            bail!("No user is logged in. Run `gator login <name>` or `gator register <name>` first.");
        };
        match self.db.get_user(name).await? {
            Some(user) => Ok(Session { user }),
            None => bail!("User '{}' does not exist, please register first.", name),
        }
    }

    fn feed_client(&self) -> Result<FeedClient> {
        FeedClient::new(&self.config.user_agent, self.config.fetch_timeout())
            .context("Failed to build HTTP client")
    }
}

pub async fn register(state: &mut State, name: &str, out: &mut impl Write) -> Result<()> {
    let user = match state.db.create_user(name, Utc::now()).await {
        Ok(user) => user,
        Err(DatabaseError::DuplicateKey(_)) => bail!("User '{}' already exists!", name),
        Err(e) => return Err(e).context("Couldn't create user"),
    };
    state
        .config
        .set_user(&user.name, &state.config_path)
        .context("Couldn't set current user")?;

    tracing::info!(user = %user.name, id = user.id, "User created");
    writeln!(out, "User '{}' created successfully!", user.name)?;
    Ok(())
}

pub async fn login(state: &mut State, name: &str, out: &mut impl Write) -> Result<()> {
    if state.db.get_user(name).await?.is_none() {
        bail!("User '{}' does not exist, please register first.", name);
    }
    state
        .config
        .set_user(name, &state.config_path)
        .context("Couldn't set current user")?;

    writeln!(out, "User switched to '{}'", name)?;
    Ok(())
}

pub async fn users(state: &State, out: &mut impl Write) -> Result<()> {
    let current = state.config.current_user_name.as_deref();
    for user in state.db.list_users().await.context("Couldn't list users")? {
        if Some(user.name.as_str()) == current {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

/// Delete every user. Feeds, follows and posts go with them.
pub async fn reset(state: &State, out: &mut impl Write) -> Result<()> {
    let deleted = state
        .db
        .delete_all_users()
        .await
        .context("Failed to reset database")?;
    tracing::info!(users = deleted, "Database reset");
    writeln!(out, "Database reset successful! {} users deleted.", deleted)?;
    Ok(())
}

/// Register a feed and follow it. Adding a URL that is already registered
/// follows the existing feed instead.
pub async fn add_feed(state: &State, name: &str, url: &str, out: &mut impl Write) -> Result<()> {
    let session = state.session().await?;
    validate_feed_url(url)?;

    let now = Utc::now();
    let feed = match state.db.create_feed(name, url, session.user.id, now).await {
        Ok(feed) => feed,
        Err(DatabaseError::DuplicateKey(_)) => {
            let existing = state
                .db
                .get_feed_by_url(url)
                .await?
                .with_context(|| format!("Feed with URL '{}' disappeared", url))?;
            match state
                .db
                .create_feed_follow(session.user.id, existing.id, now)
                .await
            {
                Ok(_) => writeln!(
                    out,
                    "Feed with URL '{}' already exists. You are now following it.",
                    url
                )?,
                Err(DatabaseError::DuplicateKey(_)) => writeln!(
                    out,
                    "Feed with URL '{}' already exists and you are already following it.",
                    url
                )?,
                Err(e) => return Err(e).context("Couldn't follow existing feed"),
            }
            return Ok(());
        }
        Err(e) => return Err(e).context("Couldn't create feed"),
    };

    state
        .db
        .create_feed_follow(session.user.id, feed.id, now)
        .await
        .context("Couldn't follow the feed")?;

    tracing::info!(feed = %feed.name, url = %feed.url, user = %session.user.name, "Feed added");
    writeln!(out, "Feed added successfully:")?;
    writeln!(out, "  Name: {}", feed.name)?;
    writeln!(out, "  URL: {}", feed.url)?;
    writeln!(out, "  Created At: {}", feed.created_at.to_rfc3339())?;
    writeln!(out, "You are now following this feed.")?;
    Ok(())
}

pub async fn feeds(state: &State, out: &mut impl Write) -> Result<()> {
    let feeds = state
        .db
        .list_feeds_with_owners()
        .await
        .context("Couldn't get feeds")?;
    if feeds.is_empty() {
        writeln!(out, "No feeds found in the database")?;
        return Ok(());
    }

    writeln!(out, "Found {} feeds:", feeds.len())?;
    for entry in feeds {
        writeln!(out)?;
        writeln!(out, "* {}", entry.feed.name)?;
        writeln!(out, "  URL: {}", entry.feed.url)?;
        writeln!(out, "  Created By: {}", entry.owner_name)?;
        match entry.feed.last_fetched_at {
            Some(ts) => writeln!(out, "  Last Fetched: {}", ts.to_rfc3339())?,
            None => writeln!(out, "  Last Fetched: never")?,
        }
    }
    Ok(())
}

pub async fn follow(state: &State, url: &str, out: &mut impl Write) -> Result<()> {
    let session = state.session().await?;
    let Some(feed) = state.db.get_feed_by_url(url).await? else {
        bail!("No feed found with URL '{}'", url);
    };

    match state
        .db
        .create_feed_follow(session.user.id, feed.id, Utc::now())
        .await
    {
        Ok(follow) => writeln!(out, "You are now following the feed '{}'", follow.feed_name)?,
        Err(DatabaseError::DuplicateKey(_)) => {
            writeln!(out, "You are already following the feed '{}'", feed.name)?
        }
        Err(e) => return Err(e).context("Couldn't create feed follow"),
    }
    Ok(())
}

pub async fn unfollow(state: &State, url: &str, out: &mut impl Write) -> Result<()> {
    let session = state.session().await?;
    if state
        .db
        .delete_feed_follow(session.user.id, url)
        .await
        .context("Couldn't unfollow feed")?
    {
        writeln!(out, "Unfollowed '{}'", url)?;
        Ok(())
    } else {
        bail!("You are not following a feed with URL '{}'", url)
    }
}

pub async fn following(state: &State, out: &mut impl Write) -> Result<()> {
    let session = state.session().await?;
    let follows = state
        .db
        .get_feed_follows_for_user(session.user.id)
        .await
        .context("Couldn't get feed follows")?;

    if follows.is_empty() {
        writeln!(out, "User '{}' is not following any feeds", session.user.name)?;
        return Ok(());
    }
    writeln!(
        out,
        "User '{}' is following {} feeds:",
        session.user.name,
        follows.len()
    )?;
    for follow in follows {
        writeln!(out, "* {}", follow.feed_name)?;
    }
    Ok(())
}

/// Newest posts from the feeds the current user follows.
pub async fn browse(state: &State, limit: Option<i64>, out: &mut impl Write) -> Result<()> {
    let session = state.session().await?;
    let limit = limit.unwrap_or(DEFAULT_BROWSE_LIMIT);
    if limit < 1 {
        bail!("Invalid limit {}: must be at least 1", limit);
    }

    let posts = state
        .db
        .get_posts_for_user(session.user.id, limit)
        .await
        .context("Error getting posts")?;

    if posts.is_empty() {
        writeln!(out, "No posts found. Try following some feeds first!")?;
        return Ok(());
    }

    writeln!(out, "Found {} posts for {}:", posts.len(), session.user.name)?;
    for entry in posts {
        let post = entry.post;
        let published = post
            .published_at
            .map(|ts| ts.format("%b %d, %Y").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        writeln!(out)?;
        writeln!(out, "Feed: {}", entry.feed_name)?;
        writeln!(out, "Title: {}", post.title)?;
        writeln!(out, "Published: {}", published)?;
        writeln!(out, "URL: {}", post.url)?;
        if let Some(description) = post.description {
            writeln!(out, "Description: {}", description)?;
        }
        writeln!(out, "--------------------")?;
    }
    Ok(())
}

/// `agg`: with an interval, poll feeds until `shutdown` resolves; without
/// one, fetch a single feed once and print it.
///
/// The interval is validated before any network activity.
pub async fn agg<F>(
    state: &State,
    interval: Option<&str>,
    url: Option<&str>,
    shutdown: F,
    out: &mut impl Write,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let Some(interval) = interval else {
        return fetch_once(state, url, out).await;
    };
    if url.is_some() {
        bail!("--url only applies to a one-off fetch; drop the interval to use it");
    }

    let interval = parse_interval(interval)?;
    let ingester = Ingester::new(state.db.clone(), state.feed_client()?);
    let scheduler = PollScheduler::new(ingester, interval)?;

    writeln!(out, "Collecting feeds every {:?}", interval)?;
    out.flush()?;
    scheduler.run_until(shutdown).await;
    Ok(())
}

/// Fetch `url`, or the feed next in rotation, and print it. Does not mark
/// the feed fetched or store posts.
async fn fetch_once(state: &State, url: Option<&str>, out: &mut impl Write) -> Result<()> {
    let url = match url {
        Some(url) => url.to_string(),
        None => match state.db.get_next_feed_to_poll().await? {
            Some(feed) => feed.url,
            None => bail!("No feeds to fetch. Add one with `gator addfeed <name> <url>`."),
        },
    };

    let doc = state
        .feed_client()?
        .fetch(&url)
        .await
        .with_context(|| format!("Couldn't fetch feed '{}'", url))?;
    print_document(&doc, out)?;
    Ok(())
}

fn print_document(doc: &FeedDocument, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "Title: {}", doc.title)?;
    writeln!(out, "Link: {}", doc.link)?;
    writeln!(out, "Description: {}", doc.description)?;
    writeln!(out, "Items: {}", doc.items.len())?;
    for item in &doc.items {
        writeln!(out)?;
        writeln!(out, "* {}", item.title)?;
        writeln!(out, "  Link: {}", item.link)?;
        if !item.pub_date.is_empty() {
            writeln!(out, "  Published: {}", item.pub_date)?;
        }
        if !item.description.is_empty() {
            writeln!(out, "  Description: {}", item.description)?;
        }
    }
    Ok(())
}

fn validate_feed_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => bail!("Invalid URL '{}': scheme must be http or https, got {}", url, scheme),
    }
}
