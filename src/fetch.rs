//! Streaming HTTP download with bounded, manually followed redirects.

use futures_util::StreamExt;
use reqwest::{header::LOCATION, Client, StatusCode, Url};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },
    #[error("redirect from {url} has no usable Location header")]
    MissingLocation { url: String },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: StatusCode, url: String },
    #[error("writing download: {0}")]
    Io(#[from] io::Error),
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the client used for downloads. Redirects are followed by
/// [`download`] itself so the hop limit and status rules stay in one place.
///
/// `timeout` bounds each request from connect to the last body byte, so a
/// host that accepts and then goes silent fails instead of hanging.
pub fn client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Fetch `url` into `dest`, following at most `max_redirects` 301/302 hops.
///
/// Returns the number of bytes written. On any error a partially written
/// `dest` is removed.
pub async fn download(
    client: &Client,
    url: &str,
    dest: &Path,
    max_redirects: usize,
) -> Result<u64, FetchError> {
    let result = fetch_to_file(client, url, dest, max_redirects).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

async fn fetch_to_file(
    client: &Client,
    url: &str,
    dest: &Path,
    max_redirects: usize,
) -> Result<u64, FetchError> {
    let mut current = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let mut hops = 0;

    let response = loop {
        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: current.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => break response,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                hops += 1;
                if hops > max_redirects {
                    return Err(FetchError::TooManyRedirects {
                        limit: max_redirects,
                    });
                }
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| current.join(location).ok())
                    .ok_or_else(|| FetchError::MissingLocation {
                        url: current.to_string(),
                    })?;
                debug!(from = %current, to = %next, hop = hops, "Following redirect");
                current = next;
            }
            status => {
                return Err(FetchError::UnexpectedStatus {
                    status,
                    url: current.to_string(),
                })
            }
        }
    };

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|source| FetchError::Request {
            url: current.to_string(),
            source,
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!(url = %current, bytes = written, dest = %dest.display(), "Download complete");
    Ok(written)
}
