use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::fetcher::{ProbeResult, RangeFetcher};
use crate::integrity::{self, IntegrityError};
use crate::models::{ResourceDescriptor, SessionMetadata, ValidationToken};
use crate::planner::plan_chunks;
use crate::progress::{ProgressFn, ProgressTracker};
use crate::retry::{FetchError, RetryPolicy};
use crate::session::{session_key, SessionError, SessionStore};

/// Errors surfaced by one engine invocation.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("could not probe {url}: {source}")]
    Probe { url: String, source: FetchError },
    #[error("remote content changed since the session began (stored {stored}, now {current}); start a fresh download")]
    StaleResume { stored: ValidationToken, current: ValidationToken },
    #[error("chunk {index} failed after retries: {source}")]
    ChunkFetch { index: usize, source: FetchError },
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("session metadata unusable: {0}")]
    MetadataCorrupt(String),
    #[error("another download is already using session {0}")]
    SessionBusy(String),
    #[error("invalid request header {0}")]
    InvalidHeader(String),
    #[error("session store error: {0}")]
    Session(SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download worker crashed: {0}")]
    Worker(String),
}

impl From<SessionError> for DownloadError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Corrupt { .. } => DownloadError::MetadataCorrupt(e.to_string()),
            other => DownloadError::Session(other),
        }
    }
}

impl DownloadError {
    /// Whether running the same request again may succeed. Stale sessions,
    /// corrupt segments and integrity failures need a fresh download instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Probe { .. } | DownloadError::ChunkFetch { .. } | DownloadError::SessionBusy(_)
        )
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Directory holding one JSON file per resumable session.
    pub session_dir: PathBuf,
    pub retry: RetryPolicy,
    /// Timeout applied to each individual request attempt.
    pub request_timeout: Duration,
    /// Keep session metadata and segments after a failure so a later call
    /// can resume.
    pub retain_on_failure: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from(".vdm-sessions"),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
            retain_on_failure: true,
        }
    }
}

/// Outcome of a successful engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub size: u64,
    pub segments: usize,
    /// Bytes transferred over the network in this call.
    pub fetched: u64,
    pub resumed: bool,
}

/// Chunked, resumable download engine. One instance serves many concurrent
/// downloads as long as they target different sessions.
#[derive(Debug)]
pub struct DownloadEngine {
    fetcher: RangeFetcher,
    store: SessionStore,
    options: EngineOptions,
    active: Mutex<HashSet<String>>,
}

/// Releases the session key when the invocation ends, however it ends.
struct SessionLease<'a> {
    active: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.key);
    }
}

impl DownloadEngine {
    pub fn new(client: Client, options: EngineOptions) -> Self {
        let fetcher = RangeFetcher::new(client, options.retry, options.request_timeout);
        Self {
            fetcher,
            store: SessionStore::new(options.session_dir.clone()),
            options,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    /// Fetch `resource` into its destination using up to `concurrency`
    /// parallel range requests.
    ///
    /// With `resume_allowed` an existing session for the same URL and
    /// destination is revalidated and continued; otherwise any old session is
    /// discarded first.
    pub async fn download(
        &self,
        resource: &ResourceDescriptor,
        concurrency: usize,
        resume_allowed: bool,
        progress: Option<ProgressFn>,
    ) -> Result<DownloadReport, DownloadError> {
        let key = session_key(&resource.url, &resource.destination);
        let _lease = self.acquire(&key)?;

        let (meta, resumed) = self.prepare(resource, &key, concurrency, resume_allowed).await?;
        let result = self.transfer(resource, &meta, progress).await;

        match result {
            Ok(fetched) => {
                self.cleanup(&key, &meta).await;
                tracing::info!(
                    "downloaded {} ({} bytes, {} segments, {} fetched, resumed: {})",
                    resource.url,
                    meta.token.size,
                    meta.chunks.len(),
                    fetched,
                    resumed
                );
                Ok(DownloadReport {
                    size: meta.token.size,
                    segments: meta.chunks.len(),
                    fetched,
                    resumed,
                })
            }
            Err(e) => {
                if self.options.retain_on_failure {
                    tracing::warn!("download of {} failed, session kept for resume: {}", resource.url, e);
                } else {
                    tracing::warn!("download of {} failed, discarding session: {}", resource.url, e);
                    self.cleanup(&key, &meta).await;
                }
                Err(e)
            }
        }
    }

    fn acquire(&self, key: &str) -> Result<SessionLease<'_>, DownloadError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.to_string()) {
            return Err(DownloadError::SessionBusy(key.to_string()));
        }
        Ok(SessionLease { active: &self.active, key: key.to_string() })
    }

    /// Load and revalidate a session, or plan and persist a new one.
    async fn prepare(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        concurrency: usize,
        resume_allowed: bool,
    ) -> Result<(SessionMetadata, bool), DownloadError> {
        let existing = match self.store.load(key).await {
            Ok(found) => found,
            Err(e @ SessionError::Corrupt { .. }) => {
                tracing::warn!("discarding unreadable session for {}: {}", resource.url, e);
                self.store.remove(key).await?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        let probe = self.probe(resource).await?;

        if let Some(stored) = existing {
            if resume_allowed {
                if stored.token != probe.token {
                    return Err(DownloadError::StaleResume {
                        stored: stored.token,
                        current: probe.token,
                    });
                }
                tracing::info!(
                    "resuming {} from session created {} ({} segments)",
                    resource.url,
                    stored.created_at,
                    stored.chunks.len()
                );
                return Ok((stored, true));
            }
            tracing::debug!("resume not allowed, discarding previous session for {}", resource.url);
            self.cleanup(key, &stored).await;
        }

        let count = if probe.ranges_supported { concurrency.max(1) } else { 1 };
        if !probe.ranges_supported && concurrency > 1 {
            tracing::info!("{} does not support ranges, using a single segment", resource.url);
        }
        let chunks = plan_chunks(probe.token.size, count);
        let meta = SessionMetadata::new(resource, probe.token, probe.ranges_supported, chunks);
        for segment in &meta.segments {
            remove_if_exists(segment).await?;
        }
        self.store.save(key, &meta).await?;
        tracing::debug!("planned {} segments for {} ({} bytes)", meta.chunks.len(), resource.url, meta.token.size);
        Ok((meta, false))
    }

    async fn probe(&self, resource: &ResourceDescriptor) -> Result<ProbeResult, DownloadError> {
        self.fetcher.probe(resource).await.map_err(|source| match source {
            FetchError::InvalidHeader(header) => DownloadError::InvalidHeader(header),
            source => DownloadError::Probe { url: resource.url.clone(), source },
        })
    }

    /// Fetch every incomplete segment in parallel, wait for all of them,
    /// then merge and verify.
    async fn transfer(
        &self,
        resource: &ResourceDescriptor,
        meta: &SessionMetadata,
        progress: Option<ProgressFn>,
    ) -> Result<u64, DownloadError> {
        let tracker = Arc::new(ProgressTracker::new(meta.token.size, progress));

        let mut pending = Vec::new();
        for (chunk, segment) in meta.chunks.iter().zip(&meta.segments) {
            let on_disk = file_len(segment).await?;
            tracker.add(on_disk.min(chunk.len()));
            if on_disk >= chunk.len() {
                tracing::debug!("segment {} already complete, skipping", chunk.index);
            } else {
                pending.push((*chunk, segment.clone()));
            }
        }

        let mut workers = JoinSet::new();
        for (chunk, segment) in pending {
            let fetcher = self.fetcher.clone();
            let resource = resource.clone();
            let tracker = tracker.clone();
            let ranged = meta.ranges_supported;
            workers.spawn(async move {
                fetcher
                    .fetch_chunk(&resource, chunk, &segment, ranged, &tracker)
                    .await
                    .map_err(|source| DownloadError::ChunkFetch { index: chunk.index, source })
            });
        }

        let mut fetched = 0u64;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(|e| DownloadError::Worker(e.to_string())).and_then(|r| r);
            match outcome {
                Ok(n) => fetched += n,
                Err(e) => {
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        let segments: Vec<(PathBuf, u64)> = meta
            .segments
            .iter()
            .cloned()
            .zip(meta.chunks.iter().map(|c| c.len()))
            .collect();
        integrity::merge_segments(&segments, &resource.destination).await?;

        if let Err(e) = integrity::verify_file(
            &resource.destination,
            meta.token.size,
            resource.expected_sha256.as_deref(),
        )
        .await
        {
            let _ = tokio::fs::remove_file(&resource.destination).await;
            return Err(e.into());
        }

        tracker.finish();
        Ok(fetched)
    }

    async fn cleanup(&self, key: &str, meta: &SessionMetadata) {
        for segment in &meta.segments {
            if let Err(e) = remove_if_exists(segment).await {
                tracing::warn!("could not remove segment {}: {}", segment.display(), e);
            }
        }
        if let Err(e) = self.store.remove(key).await {
            tracing::warn!("could not remove session {}: {}", key, e);
        }
    }
}

async fn file_len(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let chunk = DownloadError::ChunkFetch {
            index: 0,
            source: FetchError::PartialTransfer { expected: 1, received: 0 },
        };
        assert!(chunk.is_retryable());

        let stale = DownloadError::StaleResume {
            stored: ValidationToken { size: 1, tag: None },
            current: ValidationToken { size: 2, tag: None },
        };
        assert!(!stale.is_retryable());

        let corrupt = DownloadError::from(IntegrityError::CorruptSegment {
            path: PathBuf::from("x"),
            expected: 2,
            actual: 1,
        });
        assert!(!corrupt.is_retryable());
        assert!(corrupt.to_string().contains("segment x"));
    }

    #[test]
    fn corrupt_session_maps_to_metadata_error() {
        let err = DownloadError::from(SessionError::Corrupt {
            path: PathBuf::from("s.json"),
            reason: "bad".to_string(),
        });
        assert!(matches!(err, DownloadError::MetadataCorrupt(_)));
    }

    #[tokio::test]
    async fn bad_header_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions { session_dir: dir.path().join("s"), ..EngineOptions::default() };
        let engine = DownloadEngine::new(Client::new(), options);
        let resource = ResourceDescriptor::new("http://127.0.0.1:9/x", dir.path().join("x"))
            .with_header("bad header", "v");
        let err = engine.download(&resource, 2, true, None).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidHeader(_)), "got {err}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn session_keys_are_leased_once() {
        let engine = DownloadEngine::new(Client::new(), EngineOptions::default());
        let lease = engine.acquire("k").unwrap();
        assert!(matches!(engine.acquire("k"), Err(DownloadError::SessionBusy(_))));
        drop(lease);
        assert!(engine.acquire("k").is_ok());
    }
}
