// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use vdm::logging;
use vdm::prelude::*;
use vdm::progress::ProgressFn;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

/// Chunked, resumable media downloader.
#[derive(Debug, Parser)]
#[command(name = "vdm")]
#[command(about = "Chunked, resumable media downloader with a priority task queue", long_about = None)]
struct Cli {
    /// TOML configuration file; created with defaults if missing.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download one URL straight to a file.
    Fetch {
        url: String,
        /// Destination file.
        #[arg(short, long)]
        output: PathBuf,
        /// Parallel segments (defaults to the configured `threads`).
        #[arg(short, long)]
        threads: Option<usize>,
        /// Discard any previous partial session.
        #[arg(long)]
        no_resume: bool,
        /// Expected SHA-256 of the whole file, hex encoded.
        #[arg(long)]
        sha256: Option<String>,
        /// Extra request header, `Name: value`. May be repeated.
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Queue inputs as tasks and process them until the queue is drained.
    Run {
        /// Media URLs.
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Move the single downloaded stream into place instead of running ffmpeg.
        #[arg(long)]
        no_mux: bool,
        /// Download only the audio stream.
        #[arg(long)]
        audio_only: bool,
        /// Priority of the queued tasks; higher runs first.
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// List every task in the journal.
    List,

    /// Show one task from the journal.
    Status { id: TaskId },

    /// Hold a queued task back.
    Pause { id: TaskId },

    /// Put a paused task back in the queue.
    Resume { id: TaskId },

    /// Drop a queued or paused task.
    Cancel { id: TaskId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => AppConfig::load_or_init(path)?,
        None => AppConfig::default(),
    };
    logging::init_logging(&cfg.log_level, cfg.log_file.as_deref())?;
    tracing::debug!("loaded config: {:?}", cfg);

    let client = Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("building HTTP client")?;
    let engine = Arc::new(DownloadEngine::new(client, cfg.engine_options()));

    match cli.command {
        Command::Fetch { url, output, threads, no_resume, sha256, headers } => {
            let mut resource = ResourceDescriptor::new(url, output);
            for header in &headers {
                let Some((name, value)) = header.split_once(':') else {
                    bail!("header {:?} is not in `Name: value` form", header);
                };
                resource = resource.with_header(name.trim(), value.trim());
            }
            if let Some(digest) = sha256 {
                resource = resource.with_sha256(digest);
            }

            let progress: ProgressFn = Arc::new(|percent: f64| {
                eprint!("\r{:>6.2}%", percent);
                let _ = std::io::stderr().flush();
            });
            let threads = threads.unwrap_or(cfg.threads).max(1);
            let report = engine.download(&resource, threads, !no_resume, Some(progress)).await;
            eprintln!();
            let report = report?;
            println!(
                "Saved {} ({} bytes, {} segments, {} bytes fetched{})",
                resource.destination.display(),
                report.size,
                report.segments,
                report.fetched,
                if report.resumed { ", resumed" } else { "" }
            );
        }
        Command::Run { inputs, no_mux, audio_only, priority } => {
            let scheduler = Arc::new(Scheduler::new(cfg.max_concurrent_downloads));
            let muxer: Arc<dyn Muxer> = if no_mux { Arc::new(MoveMuxer) } else { Arc::new(FfmpegMuxer::default()) };
            let mut orchestrator = Orchestrator::new(
                scheduler.clone(),
                engine,
                Arc::new(DirectResolver::default()),
                muxer,
                cfg.orchestrator_options(),
            );
            if let Some(db_path) = &cfg.database_path {
                orchestrator = orchestrator.with_store(TaskStore::open(db_path).await?);
            }
            let orchestrator = Arc::new(orchestrator);
            let restored = orchestrator.restore().await?;
            if restored > 0 {
                println!("Restored {} tasks from the journal", restored);
            }

            let mut task_config = cfg.task_config();
            task_config.audio_only = audio_only;
            for input in inputs {
                let id = orchestrator.submit(TaskRequest::new(input.clone(), task_config.clone()).priority(priority));
                println!("Queued {} as {}", input, id);
            }

            let handle = orchestrator.clone().start();
            tokio::select! {
                _ = handle.wait_idle() => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted, stopping (partial downloads are kept for resume)...");
                }
            }
            handle.stop().await;

            let summaries = scheduler.summaries();
            print_summaries(&summaries);
            let failed = summaries.iter().filter(|t| t.status == TaskStatus::Failed).count();
            if failed > 0 {
                bail!("{} task(s) failed", failed);
            }
        }
        Command::List => {
            let mut tasks = open_journal(&cfg).await?.load_all_tasks().await?;
            tasks.sort_by_key(|t| t.created_at);
            if tasks.is_empty() {
                println!("No tasks");
            }
            print_summaries(&tasks.iter().map(TaskRecord::summary).collect::<Vec<_>>());
        }
        Command::Status { id } => {
            let tasks = open_journal(&cfg).await?.load_all_tasks().await?;
            let Some(task) = tasks.into_iter().find(|t| t.id == id) else {
                bail!("no task {} in the journal", id);
            };
            println!("id:        {}", task.id);
            println!("input:     {}", task.input);
            println!("status:    {}", task.status);
            println!("progress:  {:.2}%", task.progress);
            println!("priority:  {}", task.priority);
            println!("created:   {}", task.created_at);
            if let Some(at) = task.started_at {
                println!("started:   {}", at);
            }
            if let Some(at) = task.completed_at {
                println!("finished:  {}", at);
            }
            if let Some(error) = &task.error {
                println!("error:     {}", error);
            }
        }
        Command::Pause { id } => control(&cfg, engine, id, TaskAction::Pause).await?,
        Command::Resume { id } => control(&cfg, engine, id, TaskAction::Resume).await?,
        Command::Cancel { id } => control(&cfg, engine, id, TaskAction::Cancel).await?,
    }

    Ok(())
}

async fn open_journal(cfg: &AppConfig) -> Result<TaskStore> {
    let Some(db_path) = &cfg.database_path else {
        bail!("no database_path configured; task commands need the journal");
    };
    Ok(TaskStore::open(db_path).await?)
}

/// Load the journal, apply one transition and write it back.
async fn control(cfg: &AppConfig, engine: Arc<DownloadEngine>, id: TaskId, action: TaskAction) -> Result<()> {
    let orchestrator = Orchestrator::new(
        Arc::new(Scheduler::new(cfg.max_concurrent_downloads)),
        engine,
        Arc::new(DirectResolver::default()),
        Arc::new(MoveMuxer),
        cfg.orchestrator_options(),
    )
    .with_store(open_journal(cfg).await?);
    orchestrator.restore().await?;

    let Some(task) = orchestrator.scheduler().get(id) else {
        bail!("no task {} in the journal", id);
    };
    let (verb, done) = match action {
        TaskAction::Pause => ("pause", "paused"),
        TaskAction::Resume => ("resume", "resumed"),
        TaskAction::Cancel => ("cancel", "cancelled"),
    };
    if !orchestrator.control(id, action).await? {
        bail!("cannot {} task {} while it is {}", verb, id, task.status);
    }
    println!("Task {} {}", id, done);
    Ok(())
}

fn print_summaries(tasks: &[TaskSummary]) {
    for task in tasks {
        let status = task.status.to_string();
        match &task.error {
            Some(error) => println!("{} {:<11} {:>6.2}%  {}  ({})", task.id, status, task.progress, task.input, error),
            None => println!("{} {:<11} {:>6.2}%  {}", task.id, status, task.progress, task.input),
        }
    }
}
