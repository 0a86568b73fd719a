// src/fetcher.rs

use crate::models::{Chunk, ResourceDescriptor, ValidationToken};
use crate::progress::ProgressTracker;
use crate::retry::{classify, FetchError, RetryDecision, RetryPolicy};
use futures_util::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG,
    LAST_MODIFIED, RANGE,
};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// What a probe learned about a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub token: ValidationToken,
    pub ranges_supported: bool,
}

/// Fetches byte ranges of one resource into segment files.
#[derive(Debug, Clone)]
pub struct RangeFetcher {
    client: Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RangeFetcher {
    pub fn new(client: Client, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { client, retry, timeout }
    }

    /// Determine size, change tag and range support.
    ///
    /// HEAD first; servers that reject HEAD or omit the length get a
    /// `Range: bytes=0-0` GET and the total is read from `Content-Range`.
    pub async fn probe(&self, resource: &ResourceDescriptor) -> Result<ProbeResult, FetchError> {
        let headers = build_headers(resource)?;
        let headers = &headers;
        with_retry(&self.retry, "probe", || async move {
            match self.probe_head(resource, headers).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => {}
                Err(e) => tracing::debug!("HEAD probe of {} failed: {}", resource.url, e),
            }
            self.probe_range(resource, headers).await
        })
        .await
    }

    async fn probe_head(
        &self,
        resource: &ResourceDescriptor,
        headers: &HeaderMap,
    ) -> Result<Option<ProbeResult>, FetchError> {
        let resp = self
            .client
            .head(&resource.url)
            .headers(headers.clone())
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        let Some(size) = header_str(resp.headers(), CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok()) else {
            return Ok(None);
        };
        let ranges_supported = header_str(resp.headers(), ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(Some(ProbeResult {
            token: ValidationToken { size, tag: change_tag(resp.headers()) },
            ranges_supported,
        }))
    }

    async fn probe_range(
        &self,
        resource: &ResourceDescriptor,
        headers: &HeaderMap,
    ) -> Result<ProbeResult, FetchError> {
        let resp = self
            .client
            .get(&resource.url)
            .headers(headers.clone())
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        let tag = change_tag(resp.headers());
        if status == StatusCode::PARTIAL_CONTENT {
            let size = header_str(resp.headers(), CONTENT_RANGE)
                .and_then(parse_content_range_total)
                .ok_or(FetchError::Status(status))?;
            return Ok(ProbeResult { token: ValidationToken { size, tag }, ranges_supported: true });
        }
        if status.is_success() {
            let size = header_str(resp.headers(), CONTENT_LENGTH)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(FetchError::Status(status))?;
            return Ok(ProbeResult { token: ValidationToken { size, tag }, ranges_supported: false });
        }
        Err(FetchError::Status(status))
    }

    /// Bring `segment` up to `chunk.len()` bytes, appending from whatever is
    /// already on disk. Returns the number of bytes fetched over the network.
    ///
    /// Without range support the chunk must span the whole resource; any
    /// partial segment is discarded and the body refetched from the start.
    pub async fn fetch_chunk(
        &self,
        resource: &ResourceDescriptor,
        chunk: Chunk,
        segment: &Path,
        ranged: bool,
        progress: &ProgressTracker,
    ) -> Result<u64, FetchError> {
        let headers = build_headers(resource)?;
        let fetched = AtomicU64::new(0);
        let fetched_ref = &fetched;
        let label = format!("chunk {}", chunk.index);
        with_retry(&self.retry, &label, || {
            let headers = headers.clone();
            async move {
                match self.fetch_attempt(resource, chunk, segment, ranged, headers, progress).await {
                    Ok(n) => {
                        fetched_ref.fetch_add(n, Ordering::Relaxed);
                        Ok(())
                    }
                    Err((n, e)) => {
                        fetched_ref.fetch_add(n, Ordering::Relaxed);
                        Err(e)
                    }
                }
            }
        })
        .await?;
        Ok(fetched.into_inner())
    }

    /// One request. On failure also returns how many bytes it managed to
    /// persist, so the caller's accounting stays exact across retries.
    async fn fetch_attempt(
        &self,
        resource: &ResourceDescriptor,
        chunk: Chunk,
        segment: &Path,
        ranged: bool,
        headers: HeaderMap,
        progress: &ProgressTracker,
    ) -> Result<u64, (u64, FetchError)> {
        let expected = chunk.len();
        let mut existing = existing_len(segment).await.map_err(after(0))?;
        if existing >= expected {
            return Ok(0);
        }
        if existing > 0 && !ranged {
            tracing::debug!("{} has no range support, restarting segment from zero", resource.url);
            truncate(segment).await.map_err(after(0))?;
            progress.rewind(existing);
            existing = 0;
        }

        let mut request = self.client.get(&resource.url).headers(headers).timeout(self.timeout);
        if ranged {
            request = request.header(RANGE, chunk.range_header_value(existing));
        }
        let resp = request.send().await.map_err(after(0))?;
        let status = resp.status();
        if !status.is_success() {
            return Err((0, FetchError::Status(status)));
        }
        let offset = chunk.start + existing;
        if ranged && status == StatusCode::PARTIAL_CONTENT {
            let actual = header_str(resp.headers(), CONTENT_RANGE).and_then(parse_content_range_start);
            if actual != Some(offset) {
                return Err((0, FetchError::RangeMismatch { expected: offset, actual }));
            }
        } else if ranged && offset != 0 {
            // A plain 200 is only usable when it carries exactly what we asked for.
            return Err((0, FetchError::RangeIgnored(status)));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment)
            .await
            .map_err(after(0))?;

        let remaining = expected - existing;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = file.flush().await;
                    return Err((written, e.into()));
                }
            };
            let take = (remaining - written).min(bytes.len() as u64) as usize;
            if let Err(e) = file.write_all(&bytes[..take]).await {
                return Err((written, e.into()));
            }
            written += take as u64;
            progress.add(take as u64);
            if written == remaining {
                if take < bytes.len() {
                    tracing::warn!("{}: server sent more than chunk {} asked for, extra bytes dropped", resource.url, chunk.index);
                }
                break;
            }
        }
        file.flush().await.map_err(after(written))?;

        if written < remaining {
            return Err((
                written,
                FetchError::PartialTransfer { expected: remaining, received: written },
            ));
        }
        Ok(written)
    }
}

fn after<E: Into<FetchError>>(written: u64) -> impl FnOnce(E) -> (u64, FetchError) {
    move |e| (written, e.into())
}

/// Run `attempt` until it succeeds or the policy gives up, sleeping the
/// backoff delay in between.
async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut attempt: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut n = 1u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => match policy.decide(n, classify(&e)) {
                RetryDecision::NoRetry => return Err(e),
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label,
                        n,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
            },
        }
    }
}

pub(crate) fn build_headers(resource: &ResourceDescriptor) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in &resource.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::InvalidHeader(format!("{}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::InvalidHeader(format!("{}: {}", name, e)))?;
        map.insert(header, value);
    }
    Ok(map)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn change_tag(headers: &HeaderMap) -> Option<String> {
    header_str(headers, ETAG)
        .or_else(|| header_str(headers, LAST_MODIFIED))
        .map(str::to_string)
}

/// `bytes 0-0/12345` -> 12345
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// `bytes 500-999/12345` -> 500
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

async fn existing_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn truncate(path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(0).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes */99"), Some(99));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn content_range_start() {
        assert_eq!(parse_content_range_start("bytes 500-999/12345"), Some(500));
        assert_eq!(parse_content_range_start("bytes 0-0/*"), Some(0));
        assert_eq!(parse_content_range_start("bytes */99"), None);
        assert_eq!(parse_content_range_start("garbage"), None);
    }

    #[test]
    fn change_tag_prefers_etag() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(change_tag(&headers).as_deref(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        assert_eq!(change_tag(&headers).as_deref(), Some("\"abc\""));
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let res = ResourceDescriptor::new("http://h/x", "/tmp/x").with_header("bad header", "v");
        assert!(build_headers(&res).is_err());
        let res = ResourceDescriptor::new("http://h/x", "/tmp/x").with_header("Referer", "http://h/");
        assert_eq!(build_headers(&res).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_policy_limit() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result: Result<(), FetchError> = with_retry(&policy, "test", || {
            calls += 1;
            async { Err(FetchError::PartialTransfer { expected: 2, received: 1 }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<(), FetchError> = with_retry(&policy, "test", || {
            calls += 1;
            async { Err(FetchError::Status(StatusCode::NOT_FOUND)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
