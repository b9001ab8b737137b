//! Read-only HTTP client for remote files.
//!
//! One [`RemoteReader`] wraps one remote URL — a peer's blob endpoint or
//! the upstream origin — and exposes `pread`-style positional reads over
//! HTTP range requests. The reader is stateless; connection pooling lives
//! in the shared `reqwest` client.

use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::trace;

/// A failure against a remote file.
///
/// Distinguishes *the remote said no* (an HTTP status, typically 4xx)
/// from *the remote is unreachable* (a transport fault), so the fetch
/// engine can decide whether trying the next peer is worthwhile.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote answered with a non-success status.
    #[error("remote responded with status {status}")]
    Status { status: StatusCode },

    /// The request never completed: DNS, connect, TLS, or read failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response lacked a header the contract requires.
    #[error("remote response missing a usable {0} header")]
    Header(&'static str),
}

impl RemoteError {
    /// Whether the remote explicitly refused (4xx), as opposed to being
    /// unreachable or broken. Refusals are not retried.
    pub fn is_refusal(&self) -> bool {
        matches!(self, RemoteError::Status { status } if status.is_client_error())
    }

    /// Whether the remote definitively does not have the content.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RemoteError::Status {
                status: StatusCode::NOT_FOUND
            }
        )
    }
}

/// Build the blob URL for `key` on a peer's HTTP host.
pub fn blob_url(http_host: &str, key: &str) -> String {
    format!(
        "{}/v2/blobs/{}",
        http_host.trim_end_matches('/'),
        urlencoding::encode(key)
    )
}

/// Read-only view of one remote file.
#[derive(Clone)]
pub struct RemoteReader {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl RemoteReader {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Attach headers forwarded verbatim with every request, e.g. the
    /// caller's origin authentication.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// The remote URL this reader points at.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Read `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` only at
    /// end of file. A 200 response is accepted in place of 206 only for
    /// offset zero, where the prefix of the full body is the right data.
    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize, RemoteError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset + buf.len() as u64 - 1;
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?;

        let status = response.status();
        let ranged = match status {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::OK if offset == 0 => false,
            _ => return Err(RemoteError::Status { status }),
        };

        let body = response.bytes().await?;
        let n = body.len().min(buf.len());
        buf[..n].copy_from_slice(&body[..n]);
        trace!(url = %self.url, offset, n, ranged, "remote read");
        Ok(n)
    }

    /// Total size of the remote file.
    ///
    /// Uses HEAD `Content-Length`; remotes that reject HEAD are probed
    /// with a one-byte range GET and the `Content-Range` total.
    pub async fn fstat(&self) -> Result<u64, RemoteError> {
        let response = self
            .client
            .head(&self.url)
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return content_length(response.headers())
                .ok_or(RemoteError::Header("Content-Length"));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::Status { status });
        }

        // HEAD not supported; fall back to a minimal ranged GET.
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => content_range_total(response.headers())
                .ok_or(RemoteError::Header("Content-Range")),
            StatusCode::OK => {
                content_length(response.headers()).ok_or(RemoteError::Header("Content-Length"))
            }
            _ => Err(RemoteError::Status { status }),
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

/// Parse the total out of `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxHeaderMap, StatusCode as AxStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::net::SocketAddr;

    const BODY: &[u8] = b"0123456789abcdef";

    async fn serve_blob(State(head_ok): State<bool>, headers: AxHeaderMap, method: axum::http::Method) -> impl IntoResponse {
        if method == axum::http::Method::HEAD && !head_ok {
            return (AxStatus::METHOD_NOT_ALLOWED, AxHeaderMap::new(), Vec::new());
        }

        let mut out = AxHeaderMap::new();
        if let Some(range) = headers
            .get("range")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.strip_prefix("bytes="))
        {
            let (a, b) = range.split_once('-').unwrap();
            let a: usize = a.parse().unwrap();
            let b: usize = b.parse::<usize>().unwrap().min(BODY.len() - 1);
            out.insert(
                "content-range",
                format!("bytes {a}-{b}/{}", BODY.len()).parse().unwrap(),
            );
            return (AxStatus::PARTIAL_CONTENT, out, BODY[a..=b].to_vec());
        }
        (AxStatus::OK, out, BODY.to_vec())
    }

    async fn spawn_remote(head_ok: bool) -> SocketAddr {
        // axum's `get` also answers HEAD; the handler rejects HEAD itself
        // when exercising the Content-Range fallback.
        let app = axum::Router::new()
            .route("/blob", get(serve_blob))
            .with_state(head_ok);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn pread_reads_ranges() {
        let addr = spawn_remote(true).await;
        let reader = RemoteReader::new(
            reqwest::Client::new(),
            format!("http://{addr}/blob"),
        );

        let mut buf = [0u8; 4];
        let n = reader.pread(&mut buf, 4).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"4567");

        // Reading past the end is short.
        let mut buf = [0u8; 8];
        let n = reader.pread(&mut buf, 12).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"cdef");
    }

    #[tokio::test]
    async fn pread_empty_buf_is_noop() {
        let reader = RemoteReader::new(reqwest::Client::new(), "http://127.0.0.1:1/nothing");
        let n = reader.pread(&mut [], 0).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn missing_blob_is_a_refusal() {
        let addr = spawn_remote(true).await;
        let reader = RemoteReader::new(
            reqwest::Client::new(),
            format!("http://{addr}/absent"),
        );

        let err = reader.pread(&mut [0u8; 4], 0).await.unwrap_err();
        assert!(err.is_refusal());
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn unreachable_peer_is_not_a_refusal() {
        let reader = RemoteReader::new(reqwest::Client::new(), "http://127.0.0.1:1/blob");
        let err = reader.pread(&mut [0u8; 4], 0).await.unwrap_err();
        assert!(!err.is_refusal());
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[tokio::test]
    async fn fstat_via_head() {
        let addr = spawn_remote(true).await;
        let reader = RemoteReader::new(
            reqwest::Client::new(),
            format!("http://{addr}/blob"),
        );
        assert_eq!(reader.fstat().await.unwrap(), BODY.len() as u64);
    }

    #[tokio::test]
    async fn fstat_falls_back_to_content_range() {
        let addr = spawn_remote(false).await;
        let reader = RemoteReader::new(
            reqwest::Client::new(),
            format!("http://{addr}/blob"),
        );
        assert_eq!(reader.fstat().await.unwrap(), BODY.len() as u64);
    }

    #[test]
    fn blob_url_escapes_keys() {
        let url = blob_url("https://10.0.0.1:5000/", "sha256:ab/cd");
        assert_eq!(url, "https://10.0.0.1:5000/v2/blobs/sha256%3Aab%2Fcd");
    }
}
