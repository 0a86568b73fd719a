// src/orchestrator.rs

use crate::collaborators::{sanitize_filename, Muxer, MuxError, QualityPreferences, ResolveError, VideoResolver};
use crate::downloader::{DownloadEngine, DownloadError};
use crate::models::{ResourceDescriptor, TaskId, TaskRecord, TaskRequest, TaskStatus};
use crate::progress::ProgressFn;
use crate::scheduler::Scheduler;
use crate::state_manager::{StateError, TaskStore};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Why a task pipeline failed. The message ends up on the task record.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("resolve failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("{stream} stream download failed: {source}")]
    Download {
        stream: &'static str,
        #[source]
        source: DownloadError,
    },
    #[error("mux failed: {0}")]
    Mux(#[from] MuxError),
    #[error("task pipeline panicked")]
    Panicked,
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Sleep between admission rounds when nothing changes.
    pub idle_interval: Duration,
    /// Minimum spacing between progress updates of one task.
    pub progress_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(1000),
            progress_interval: Duration::from_millis(300),
        }
    }
}

/// Drives admitted tasks through resolve, download and mux, and reports the
/// outcome back to the scheduler.
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    engine: Arc<DownloadEngine>,
    resolver: Arc<dyn VideoResolver>,
    muxer: Arc<dyn Muxer>,
    store: Option<TaskStore>,
    options: OrchestratorOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Pause,
    Resume,
    Cancel,
}

/// A running orchestrator loop.
pub struct OrchestratorHandle {
    orchestrator: Arc<Orchestrator>,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        engine: Arc<DownloadEngine>,
        resolver: Arc<dyn VideoResolver>,
        muxer: Arc<dyn Muxer>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            scheduler,
            engine,
            resolver,
            muxer,
            store: None,
            options,
        }
    }

    /// Journal task records to `store`.
    pub fn with_store(mut self, store: TaskStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn submit(&self, request: TaskRequest) -> TaskId {
        self.scheduler.submit(request)
    }

    /// Load the journal into the scheduler. Returns the number of records
    /// read.
    pub async fn restore(&self) -> Result<usize, StateError> {
        let Some(store) = &self.store else { return Ok(0) };
        let records = store.load_all_tasks().await?;
        let count = records.len();
        self.scheduler.restore(records);
        self.flush().await;
        Ok(count)
    }

    /// Persist records changed since the last flush.
    pub async fn flush(&self) {
        if let Err(e) = self.try_flush().await {
            tracing::error!("failed to journal task records: {}", e);
        }
    }

    pub async fn try_flush(&self) -> Result<(), StateError> {
        let Some(store) = &self.store else { return Ok(()) };
        let dirty = self.scheduler.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        store.save_tasks(&dirty).await
    }

    /// Pause, resume or cancel one task and journal the change. `Ok(false)`
    /// means the task is unknown or its status does not allow the action.
    pub async fn control(&self, id: TaskId, action: TaskAction) -> Result<bool, StateError> {
        let applied = match action {
            TaskAction::Pause => self.scheduler.pause(id),
            TaskAction::Resume => self.scheduler.resume(id),
            TaskAction::Cancel => self.scheduler.cancel(id),
        };
        if applied {
            self.try_flush().await?;
        }
        Ok(applied)
    }

    /// Spawn the admission loop.
    pub fn start(self: Arc<Self>) -> OrchestratorHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.clone().run(token.clone()));
        tracing::info!("orchestrator started (limit {})", self.scheduler.limit());
        OrchestratorHandle { orchestrator: self, token, join }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut workers = JoinSet::new();
        loop {
            while let Some(task) = self.scheduler.next() {
                let this = self.clone();
                workers.spawn(async move { this.run_task(task).await });
            }
            self.flush().await;

            tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("task worker ended abnormally: {}", e);
                    }
                }
                _ = tokio::time::sleep(self.options.idle_interval) => {}
            }
        }

        let interrupted = workers.len();
        workers.abort_all();
        while workers.join_next().await.is_some() {}

        for record in self.scheduler.list() {
            if record.status == TaskStatus::Downloading && self.scheduler.requeue(record.id) {
                tracing::info!("task {} interrupted, returned to queue", record.id);
            }
        }
        self.flush().await;
        tracing::info!("orchestrator stopped ({} in-flight tasks interrupted)", interrupted);
    }

    async fn run_task(self: Arc<Self>, task: TaskRecord) {
        let id = task.id;
        let outcome = AssertUnwindSafe(self.process_task(&task))
            .catch_unwind()
            .await
            .unwrap_or(Err(TaskError::Panicked));

        let result = match outcome {
            Ok(output) => {
                tracing::info!("task {} saved to {}", id, output.display());
                self.scheduler.complete(id, true, None)
            }
            Err(e) => {
                tracing::error!("task {} failed: {}", id, e);
                self.scheduler.complete(id, false, Some(e.to_string()))
            }
        };
        if let Err(e) = result {
            tracing::warn!("could not record outcome of task {}: {}", id, e);
        }
        self.flush().await;
    }

    /// resolve -> download each stream into the cache -> mux into the
    /// download directory.
    async fn process_task(&self, task: &TaskRecord) -> Result<PathBuf, TaskError> {
        let config = &task.config;
        let prefs = QualityPreferences {
            video_quality: config.video_quality.clone(),
            audio_quality: config.audio_quality.clone(),
            codec: config.codec.clone(),
        };
        let media = self.resolver.resolve(&task.input, &prefs).await?;
        tracing::debug!("task {} resolved to {:?}", task.id, media.title);

        let audio_only = config.audio_only && media.audio_url.is_some();
        if config.audio_only && !audio_only {
            tracing::warn!(
                "task {}: {:?} has no separate audio stream, keeping the combined stream",
                task.id,
                media.title
            );
        }
        let streams: Vec<(&'static str, String)> = match (&media.audio_url, audio_only) {
            (Some(audio), true) => vec![("audio", audio.clone())],
            _ => {
                let mut streams = vec![("video", media.video_url.clone())];
                if let Some(audio) = &media.audio_url {
                    streams.push(("audio", audio.clone()));
                }
                streams
            }
        };

        let throttle = Arc::new(ProgressThrottle::new(self.options.progress_interval));
        let total = streams.len();
        let mut video_path = None;
        let mut audio_path = None;
        for (k, (stream, url)) in streams.into_iter().enumerate() {
            let cache_file = config.cache_dir.join(format!("{}.{}.m4s", task.id, stream));
            let mut resource = ResourceDescriptor::new(url, &cache_file);
            resource.headers = media.headers.clone();

            let progress = self.progress_fn(task.id, k, total, throttle.clone());
            let threads = config.threads.max(1);
            self.engine
                .download(&resource, threads, config.resume, Some(progress))
                .await
                .map_err(|source| TaskError::Download { stream, source })?;

            match stream {
                "audio" => audio_path = Some(cache_file),
                _ => video_path = Some(cache_file),
            }
        }

        let extension = if audio_only { "m4a" } else { "mp4" };
        let output = config
            .download_dir
            .join(format!("{}.{}", sanitize_filename(&media.title), extension));
        self.muxer
            .mux(video_path.as_deref(), audio_path.as_deref(), &output)
            .await?;
        Ok(output)
    }

    /// Map the progress of stream `index` of `total` onto the whole task.
    fn progress_fn(&self, id: TaskId, index: usize, total: usize, throttle: Arc<ProgressThrottle>) -> ProgressFn {
        let scheduler = self.scheduler.clone();
        let total = total.max(1) as f64;
        Arc::new(move |percent: f64| {
            let overall = ((index as f64) * 100.0 + percent) / total;
            if let Some(value) = throttle.offer(overall) {
                scheduler.update_progress(id, value);
            }
        })
    }
}

impl OrchestratorHandle {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Wait until no task is pending or downloading.
    pub async fn wait_idle(&self) {
        while !self.orchestrator.scheduler.is_idle() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Stop admitting, abort in-flight tasks (their sessions stay on disk),
    /// put them back in the queue and flush the journal.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            tracing::error!("orchestrator loop ended abnormally: {}", e);
        }
    }
}

/// Drops progress values that go backwards or arrive within `interval` of
/// the last one passed. 100 always passes.
pub struct ProgressThrottle {
    interval: Duration,
    state: Mutex<(Option<Instant>, f64)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new((None, -1.0)),
        }
    }

    pub fn offer(&self, percent: f64) -> Option<f64> {
        let percent = percent.clamp(0.0, 100.0);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (last_at, last_value) = *state;
        if percent <= last_value {
            return None;
        }
        let due = match last_at {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if !due && percent < 100.0 {
            return None;
        }
        *state = (Some(Instant::now()), percent);
        Some(percent)
    }
}
