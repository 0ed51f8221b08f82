//! HTTP for UPnP
//!
//! UPnP devices speak a small, predictable subset of HTTP: plain `http://`,
//! one request per connection, short XML bodies. Requests go through
//! `reqwest` with connection pooling disabled; response bodies are read into
//! a buffer of bounded capacity and anything beyond it is dropped.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Port used when a URL does not name one
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Longest accepted host name
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Redirects followed by [`get`] before giving up
const MAX_REDIRECTS: usize = 4;

/// User-Agent sent with every request
pub const USER_AGENT: &str = concat!("natter/", env!("CARGO_PKG_VERSION"), " UPnP/1.0");

/// HTTP error types
#[derive(Debug, Error)]
pub enum HttpError {
    /// URL could not be split into host, port and path
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Scheme other than `http://`
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Connection, protocol or redirect failure
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Request did not complete in time
    #[error("HTTP request timed out")]
    Timeout,

    /// Error status on a description download
    #[error("HTTP status {0}")]
    Status(u16),
}

/// `http://host[:port]/path`, split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    /// Port, [`DEFAULT_HTTP_PORT`] when absent
    pub port: u16,
    /// Absolute path including any query string
    pub path: String,
}

impl HttpUrl {
    /// Parse an `http://` URL; the path is mandatory
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::UnsupportedScheme`] for any other scheme and
    /// [`HttpError::InvalidUrl`] for missing host or path, a bad port, or a
    /// host name longer than [`MAX_HOSTNAME_LEN`].
    pub fn parse(url: &str) -> Result<Self, HttpError> {
        let invalid = || HttpError::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(HttpError::UnsupportedScheme(url.to_string()));
        }

        let (host, after_host) = if let Some(bracketed) = rest.strip_prefix('[') {
            let close = bracketed.find(']').ok_or_else(invalid)?;
            (&bracketed[..close], &bracketed[close + 1..])
        } else {
            let end = rest.find([':', '/']).unwrap_or(rest.len());
            (&rest[..end], &rest[end..])
        };
        if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
            return Err(invalid());
        }

        let (port, path) = match after_host.strip_prefix(':') {
            Some(port_and_path) => {
                let end = port_and_path.find('/').unwrap_or(port_and_path.len());
                let port = port_and_path[..end].parse().map_err(|_| invalid())?;
                (port, &port_and_path[end..])
            }
            None => (DEFAULT_HTTP_PORT, after_host),
        };
        if !path.starts_with('/') {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Value of the `Host:` header: the port is only included when not 80
    #[must_use]
    pub fn host_header(&self) -> String {
        let host = self.bracketed_host();
        if self.port == DEFAULT_HTTP_PORT {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.bracketed_host(), self.port, self.path)
    }
}

/// One-shot client: no pooling, no proxies, UPnP-friendly header casing
fn client() -> Result<reqwest::Client, HttpError> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(0)
        .http1_title_case_headers()
        .no_proxy()
        .build()?;
    Ok(client)
}

/// Read the body, keeping at most `capacity` bytes
async fn read_body(mut response: reqwest::Response, capacity: usize) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::with_capacity(capacity.min(64 * 1024));
    while let Some(chunk) = response.chunk().await? {
        let room = capacity - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= capacity {
            debug!("Response truncated to {} bytes", capacity);
            break;
        }
    }
    Ok(body)
}

/// Download `url` and return the response body
///
/// Follows up to four redirects. The whole download, redirects included,
/// must finish within `timeout`.
///
/// # Errors
///
/// Returns URL, request, timeout or error-status failures.
pub async fn get(url: &str, capacity: usize, timeout: Duration) -> Result<Vec<u8>, HttpError> {
    let target = HttpUrl::parse(url)?;
    let body = tokio::time::timeout(timeout, fetch(&target, capacity))
        .await
        .map_err(|_| HttpError::Timeout)??;
    debug!("Downloaded {} bytes from {}", body.len(), target);
    Ok(body)
}

async fn fetch(target: &HttpUrl, capacity: usize) -> Result<Vec<u8>, HttpError> {
    let response = client()?.get(target.to_string()).send().await?;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(HttpError::Status(status.as_u16()));
    }
    read_body(response, capacity).await
}

/// POST a SOAP request and return the response body
///
/// Error statuses are not treated as failures: UPnP devices report action
/// errors as `500` with a SOAP fault body the caller must inspect.
///
/// # Errors
///
/// Returns request or timeout failures.
pub async fn post_soap(
    url: &HttpUrl,
    soap_action: &str,
    body: &str,
    capacity: usize,
    timeout: Duration,
) -> Result<Vec<u8>, HttpError> {
    tokio::time::timeout(timeout, exchange(url, soap_action, body, capacity))
        .await
        .map_err(|_| HttpError::Timeout)?
}

async fn exchange(
    url: &HttpUrl,
    soap_action: &str,
    body: &str,
    capacity: usize,
) -> Result<Vec<u8>, HttpError> {
    let response = client()?
        .post(url.to_string())
        .header("Content-Type", "text/xml")
        .header("SOAPAction", format!("\"{soap_action}\""))
        .header("Connection", "Close")
        .header("Cache-Control", "no-cache")
        .header("Pragma", "no-cache")
        .body(body.to_string())
        .send()
        .await?;
    debug!("{} answered {}", url, response.status());
    read_body(response, capacity).await
}
