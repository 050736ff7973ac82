use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_rss, FeedDocument};

/// Value sent in the `User-Agent` header unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = "gator";
/// Per-fetch bound covering connect, headers and body.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching one feed.
///
/// `Transport` and `Timeout` are network-level failures; none of these are
/// retried here; the scheduler simply moves on to the next feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, reading the body)
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The per-fetch timeout elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response status other than 200 OK
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body is not a decodable RSS document
    #[error("Parse error: {0}")]
    Parse(#[from] super::parser::ParseError),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

impl FetchError {
    /// DNS, connection and timeout failures, as opposed to a server that answered.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Timeout(_))
    }
}

/// HTTP client for RSS documents.
///
/// Cheap to clone; the underlying `reqwest::Client` pools connections.
#[derive(Debug, Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl FeedClient {
    /// Build a client that identifies itself with `user_agent`.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { http, timeout })
    }

    /// GET `url` and decode the body as RSS.
    ///
    /// The whole body is read before parsing. The timeout bounds the request
    /// and the body read together.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Transport`] - DNS, connection or TLS failure
    /// - [`FetchError::Timeout`] - the configured bound elapsed
    /// - [`FetchError::HttpStatus`] - any status other than 200
    /// - [`FetchError::ResponseTooLarge`] - body over 10MB
    /// - [`FetchError::Parse`] - body is not an RSS channel
    pub async fn fetch(&self, url: &str) -> Result<FeedDocument, FetchError> {
        let bytes = tokio::time::timeout(self.timeout, self.fetch_bytes(url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let doc = parse_rss(&bytes)?;
        tracing::debug!(
            url = %url,
            bytes = bytes.len(),
            items = doc.items.len(),
            "Fetched feed"
        );
        Ok(doc)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).send().await?;

        // Only 200 counts; redirects have already been followed by reqwest
        if response.status() != reqwest::StatusCode::OK {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, MAX_FEED_SIZE).await
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
