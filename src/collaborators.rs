//! Interfaces to the services around the core: turning an identifier into
//! stream URLs, and muxing downloaded streams into one output file.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no media found for {0}")]
    NotFound(String),
    #[error("requested quality is not available for {0}")]
    QualityUnavailable(String),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("no input streams to mux")]
    NoInputs,
    #[error("{0}")]
    Unsupported(String),
    #[error("muxer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// User preferences passed through to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityPreferences {
    pub video_quality: String,
    pub audio_quality: String,
    pub codec: String,
}

/// Result of resolving an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub title: String,
    pub video_url: String,
    /// `None` for progressive streams carrying both tracks.
    pub audio_url: Option<String>,
    /// Headers the CDN expects (referer, user agent).
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
pub trait VideoResolver: Send + Sync {
    async fn resolve(&self, identifier: &str, prefs: &QualityPreferences) -> Result<ResolvedMedia, ResolveError>;
}

#[async_trait]
pub trait Muxer: Send + Sync {
    /// Combine zero, one or two local inputs into `output`. Inputs are
    /// deleted on success.
    async fn mux(&self, video: Option<&Path>, audio: Option<&Path>, output: &Path) -> Result<(), MuxError>;
}

/// One stream offered by a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEntry {
    Video { url: String, quality: String, codec: String },
    Audio { url: String, quality: String },
}

/// Everything a catalog knows about one identifier. Entries are listed best
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCatalog {
    pub title: String,
    /// A single file with audio and video interleaved; no selection needed.
    pub progressive: Option<String>,
    pub entries: Vec<StreamEntry>,
}

/// Pick the video matching quality and codec and the audio matching
/// quality. If either is missing, fall back to the best listed pair.
pub fn select_streams(
    catalog: &StreamCatalog,
    prefs: &QualityPreferences,
) -> Result<(String, Option<String>), ResolveError> {
    if let Some(url) = &catalog.progressive {
        return Ok((url.clone(), None));
    }

    let mut video = None;
    let mut audio = None;
    for entry in &catalog.entries {
        match entry {
            StreamEntry::Video { url, quality, codec } => {
                if video.is_none()
                    && quality.eq_ignore_ascii_case(&prefs.video_quality)
                    && codec.eq_ignore_ascii_case(&prefs.codec)
                {
                    video = Some(url.clone());
                }
            }
            StreamEntry::Audio { url, quality } => {
                if audio.is_none() && quality.eq_ignore_ascii_case(&prefs.audio_quality) {
                    audio = Some(url.clone());
                }
            }
        }
    }
    if let (Some(video), Some(audio)) = (video, audio) {
        return Ok((video, Some(audio)));
    }

    tracing::warn!("{}: requested quality/codec unavailable, using best streams", catalog.title);
    let best_video = catalog.entries.iter().find_map(|e| match e {
        StreamEntry::Video { url, .. } => Some(url.clone()),
        StreamEntry::Audio { .. } => None,
    });
    let best_audio = catalog.entries.iter().find_map(|e| match e {
        StreamEntry::Audio { url, .. } => Some(url.clone()),
        StreamEntry::Video { .. } => None,
    });
    match best_video {
        Some(video) => Ok((video, best_audio)),
        None => Err(ResolveError::QualityUnavailable(catalog.title.clone())),
    }
}

/// Treats the identifier itself as a direct media URL.
#[derive(Debug, Clone, Default)]
pub struct DirectResolver {
    pub headers: BTreeMap<String, String>,
}

#[async_trait]
impl VideoResolver for DirectResolver {
    async fn resolve(&self, identifier: &str, _prefs: &QualityPreferences) -> Result<ResolvedMedia, ResolveError> {
        let parsed = url::Url::parse(identifier.trim())
            .map_err(|_| ResolveError::InvalidIdentifier(identifier.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ResolveError::InvalidIdentifier(identifier.to_string()));
        }
        let title = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(|s| match s.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => s.to_string(),
            })
            .unwrap_or_else(|| parsed.host_str().unwrap_or("download").to_string());
        Ok(ResolvedMedia {
            title,
            video_url: parsed.to_string(),
            audio_url: None,
            headers: self.headers.clone(),
        })
    }
}

/// Resolves identifiers against catalogs registered up front.
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    catalogs: HashMap<String, StreamCatalog>,
}

impl CatalogResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: impl Into<String>, catalog: StreamCatalog) {
        self.catalogs.insert(identifier.into(), catalog);
    }
}

#[async_trait]
impl VideoResolver for CatalogResolver {
    async fn resolve(&self, identifier: &str, prefs: &QualityPreferences) -> Result<ResolvedMedia, ResolveError> {
        let catalog = self
            .catalogs
            .get(identifier)
            .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))?;
        let (video_url, audio_url) = select_streams(catalog, prefs)?;
        Ok(ResolvedMedia {
            title: catalog.title.clone(),
            video_url,
            audio_url,
            headers: BTreeMap::new(),
        })
    }
}

/// Runs `ffmpeg` with stream copy.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    pub program: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self { program: PathBuf::from("ffmpeg") }
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, video: Option<&Path>, audio: Option<&Path>, output: &Path) -> Result<(), MuxError> {
        let inputs: Vec<&Path> = video.into_iter().chain(audio).collect();
        if inputs.is_empty() {
            return Err(MuxError::NoInputs);
        }
        ensure_parent(output).await?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-y").arg("-loglevel").arg("error");
        for input in &inputs {
            cmd.arg("-i").arg(input);
        }
        cmd.arg("-c").arg("copy").arg(output);
        tracing::debug!("running {:?}", cmd);
        let out = cmd.output().await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            return Err(MuxError::Failed { status: out.status.to_string(), stderr: tail });
        }
        for input in inputs {
            if let Err(e) = tokio::fs::remove_file(input).await {
                tracing::warn!("could not remove mux input {}: {}", input.display(), e);
            }
        }
        Ok(())
    }
}

/// Moves a single input into place. For direct downloads that need no
/// container work.
#[derive(Debug, Clone, Default)]
pub struct MoveMuxer;

#[async_trait]
impl Muxer for MoveMuxer {
    async fn mux(&self, video: Option<&Path>, audio: Option<&Path>, output: &Path) -> Result<(), MuxError> {
        let input = match (video, audio) {
            (Some(_), Some(_)) => {
                return Err(MuxError::Unsupported("cannot combine two streams without ffmpeg".to_string()))
            }
            (Some(path), None) | (None, Some(path)) => path,
            (None, None) => return Err(MuxError::NoInputs),
        };
        ensure_parent(output).await?;
        if tokio::fs::rename(input, output).await.is_err() {
            // Cross-device: copy then delete.
            tokio::fs::copy(input, output).await?;
            tokio::fs::remove_file(input).await?;
        }
        Ok(())
    }
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

/// Make a title safe to use as a file name: characters the file system
/// rejects and whitespace become `_`, runs collapse, and the result is
/// capped at 200 characters.
pub fn sanitize_filename(name: &str) -> String {
    let options = ::sanitize_filename::Options { windows: true, truncate: true, replacement: "_" };
    let cleaned = ::sanitize_filename::sanitize_with_options(name, options);

    let mut out = String::with_capacity(cleaned.len());
    for c in cleaned.chars() {
        let c = if c.is_whitespace() { '_' } else { c };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed: String = out.trim_matches('_').chars().take(200).collect();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prefs() -> QualityPreferences {
        QualityPreferences {
            video_quality: "1080P".into(),
            audio_quality: "192K".into(),
            codec: "H264".into(),
        }
    }

    fn catalog() -> StreamCatalog {
        StreamCatalog {
            title: "clip".into(),
            progressive: None,
            entries: vec![
                StreamEntry::Video { url: "v4k".into(), quality: "4K".into(), codec: "H265".into() },
                StreamEntry::Video { url: "v1080-265".into(), quality: "1080P".into(), codec: "H265".into() },
                StreamEntry::Video { url: "v1080-264".into(), quality: "1080P".into(), codec: "H264".into() },
                StreamEntry::Audio { url: "a320".into(), quality: "320K".into() },
                StreamEntry::Audio { url: "a192".into(), quality: "192K".into() },
            ],
        }
    }

    #[test]
    fn selects_matching_streams() {
        let (video, audio) = select_streams(&catalog(), &prefs()).unwrap();
        assert_eq!(video, "v1080-264");
        assert_eq!(audio.as_deref(), Some("a192"));
    }

    #[test]
    fn falls_back_to_best_streams() {
        let mut p = prefs();
        p.codec = "AV1".into();
        let (video, audio) = select_streams(&catalog(), &p).unwrap();
        assert_eq!(video, "v4k");
        assert_eq!(audio.as_deref(), Some("a320"));
    }

    #[test]
    fn progressive_needs_no_selection() {
        let mut c = catalog();
        c.progressive = Some("flv".into());
        assert_eq!(select_streams(&c, &prefs()).unwrap(), ("flv".to_string(), None));
    }

    #[test]
    fn empty_catalog_is_unavailable() {
        let c = StreamCatalog { title: "x".into(), progressive: None, entries: vec![] };
        assert!(matches!(select_streams(&c, &prefs()), Err(ResolveError::QualityUnavailable(_))));
    }

    #[tokio::test]
    async fn direct_resolver_titles_from_path() {
        let r = DirectResolver::default();
        let media = r.resolve("https://cdn.test/media/My%20Clip.mp4?sig=1", &prefs()).await.unwrap();
        assert_eq!(media.title, "My%20Clip");
        assert!(media.audio_url.is_none());
        assert!(matches!(
            r.resolve("not a url", &prefs()).await,
            Err(ResolveError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            r.resolve("ftp://cdn.test/x", &prefs()).await,
            Err(ResolveError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn catalog_resolver_reports_unknown_ids() {
        let mut r = CatalogResolver::new();
        r.insert("BV1", catalog());
        assert_eq!(r.resolve("BV1", &prefs()).await.unwrap().video_url, "v1080-264");
        assert!(matches!(r.resolve("BV2", &prefs()).await, Err(ResolveError::NotFound(_))));
    }

    #[tokio::test]
    async fn move_muxer_moves_single_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.m4s");
        std::fs::write(&input, b"data").unwrap();
        let output = dir.path().join("out/final.mp4");

        MoveMuxer.mux(Some(&input), None, &output).await.unwrap();
        assert!(!input.exists());
        assert_eq!(std::fs::read(&output).unwrap(), b"data");

        assert!(matches!(MoveMuxer.mux(None, None, &output).await, Err(MuxError::NoInputs)));
        assert!(matches!(
            MoveMuxer.mux(Some(&output), Some(&output), &output).await,
            Err(MuxError::Unsupported(_))
        ));
    }

    #[test]
    fn sanitizes_titles() {
        assert_eq!(sanitize_filename("a/b:c  d?"), "a_b_c_d");
        assert_eq!(sanitize_filename("  ***  "), "untitled");
        assert_eq!(sanitize_filename("正常标题"), "正常标题");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
        assert_eq!(sanitize_filename("con"), "untitled");
        assert_eq!(sanitize_filename("tab\there\n"), "tab_here");
    }
}
