use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::downloader::EngineOptions;
use crate::models::TaskConfig;
use crate::orchestrator::OrchestratorOptions;
use crate::retry::RetryPolicy;

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per request (including the first).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// `[quality]` section: default stream preferences for new tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub video: String,
    pub audio: String,
    pub codec: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            video: "1080P".to_string(),
            audio: "192K".to_string(),
            codec: "H264".to_string(),
        }
    }
}

/// Application configuration loaded from a TOML file. Missing keys take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Number of tasks downloading at once.
    pub max_concurrent_downloads: usize,
    /// Parallel segments per stream.
    pub threads: usize,
    pub download_dir: PathBuf,
    /// Raw streams are kept here until muxed.
    pub cache_dir: PathBuf,
    pub session_dir: PathBuf,
    /// Task journal; no persistence when unset.
    pub database_path: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Minimum spacing of progress updates per task.
    pub progress_interval_ms: u64,
    /// How long the dispatcher sleeps when nothing could be started.
    pub idle_interval_ms: u64,
    pub keep_partial_on_failure: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub retry: RetryConfig,
    pub quality: QualityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            threads: 4,
            download_dir: PathBuf::from("downloads"),
            cache_dir: PathBuf::from("cache"),
            session_dir: PathBuf::from(".vdm-sessions"),
            database_path: None,
            request_timeout_secs: 60,
            progress_interval_ms: 300,
            idle_interval_ms: 1000,
            keep_partial_on_failure: true,
            log_level: "info".to_string(),
            log_file: None,
            retry: RetryConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// Load configuration from disk, creating a default file if none exists.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let default_cfg = AppConfig::default();
            let toml = toml::to_string_pretty(&default_cfg)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, toml)?;
            tracing::info!("created default config at {}", path.display());
            return Ok(default_cfg);
        }
        Self::load(path)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            session_dir: self.session_dir.clone(),
            retry: self.retry.policy(),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            retain_on_failure: self.keep_partial_on_failure,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            idle_interval: Duration::from_millis(self.idle_interval_ms.max(1)),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    /// Per-task defaults for tasks submitted under this configuration.
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            video_quality: self.quality.video.clone(),
            audio_quality: self.quality.audio.clone(),
            codec: self.quality.codec.clone(),
            audio_only: false,
            download_dir: self.download_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            threads: self.threads.max(1),
            resume: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.progress_interval_ms, 300);
        assert!(cfg.keep_partial_on_failure);
        assert!(cfg.database_path.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml = r#"
            max_concurrent_downloads = 1
            threads = 8

            [retry]
            max_attempts = 2
        "#;
        let cfg: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 1);
        assert_eq!(cfg.threads, 8);
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 250);
        assert_eq!(cfg.quality, QualityConfig::default());
        assert_eq!(cfg.task_config().threads, 8);
    }

    #[test]
    fn derives_component_options() {
        let mut cfg = AppConfig::default();
        cfg.keep_partial_on_failure = false;
        cfg.retry.max_attempts = 0;
        let engine = cfg.engine_options();
        assert!(!engine.retain_on_failure);
        assert_eq!(engine.retry.max_attempts, 1);
        assert_eq!(engine.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.orchestrator_options().progress_interval, Duration::from_millis(300));
    }

    #[test]
    fn load_or_init_writes_defaults_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/vdm.toml");
        let first = AppConfig::load_or_init(&path).unwrap();
        assert!(path.exists());

        fs::write(&path, "threads = 2\n").unwrap();
        let second = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(first.threads, 4);
        assert_eq!(second.threads, 2);
    }

    #[test]
    fn rejects_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "threads = \"many\"").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
