pub mod collaborators;
pub mod config;
pub mod downloader;
pub mod fetcher;
pub mod integrity;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod state_manager;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::collaborators::{
        CatalogResolver, DirectResolver, FfmpegMuxer, MoveMuxer, Muxer, QualityPreferences, StreamCatalog,
        StreamEntry, VideoResolver,
    };
    pub use crate::config::AppConfig;
    pub use crate::downloader::{DownloadEngine, DownloadError, DownloadReport, EngineOptions};
    pub use crate::models::{ResourceDescriptor, TaskConfig, TaskId, TaskRecord, TaskRequest, TaskStatus, TaskSummary};
    pub use crate::orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorOptions, TaskAction};
    pub use crate::scheduler::Scheduler;
    pub use crate::state_manager::TaskStore;
}
