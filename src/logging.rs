use anyhow::Result;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging. `RUST_LOG` overrides `level`. With a
/// `file`, output is appended there without colours; if the file cannot be
/// opened, or none is given, it goes to stderr.
pub fn init_logging(level: &str, file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let opened = file.map(|path| (path, open_log_file(path)));
    match opened {
        Some((path, Ok(file))) => {
            // `&File` implements `Write`, so one shared handle serves every event.
            let writer = BoxMakeWriter::new(Arc::new(file));
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
            tracing::info!("vdm logging initialized at {}", path.display());
        }
        Some((path, Err(e))) => {
            init_stderr(env_filter)?;
            tracing::warn!("cannot open log file {} ({}), logging to stderr", path.display(), e);
        }
        None => init_stderr(env_filter)?,
    }
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(path)
}

fn init_stderr(env_filter: EnvFilter) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// `info` becomes `warn,vdm=info`: dependencies stay quiet unless asked.
fn filter_directive(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        "warn,vdm=info".to_string()
    } else if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("warn,vdm={}", level)
    }
}
