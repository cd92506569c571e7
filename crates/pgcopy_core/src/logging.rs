//! Console and audit-file logging for the pgcopy binary.
//!
//! Every process writes its own `audit_<YYYYmmdd_HHMMSS>.log` alongside the
//! console output, so one file holds exactly one run. Events carry the span
//! context they were emitted in (`run{run_id=…}:route{…}:copy{table=…}`).
//!
//! Library code never installs a subscriber; the binary calls [`init_logging`]
//! once and holds the returned guard.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a log filter.
pub const LOG_ENV: &str = "PGCOPY_LOG";

/// What to log and where.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory receiving the per-run audit file; `None` logs to the console only.
    pub audit_dir: Option<PathBuf>,
    /// Filter overriding `PGCOPY_LOG` and `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { audit_dir: Some(log_dir()), filter: None }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    pub fn without_audit_file(mut self) -> Self {
        self.audit_dir = None;
        self
    }
}

/// Keeps the audit writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    audit_file: Option<PathBuf>,
    _worker_guard: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// The audit file of this run, if one could be opened.
    pub fn audit_file(&self) -> Option<&Path> {
        self.audit_file.as_deref()
    }
}

/// Install the global subscriber. If the audit file cannot be opened the run
/// continues with console output only.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let audit = match config.audit_dir.as_deref().map(open_audit_file) {
        Some(Ok(audit)) => Some(audit),
        Some(Err(e)) => {
            eprintln!("Warning: failed to open audit log: {e}. Using console only.");
            None
        }
        None => None,
    };

    let (audit_file, writer, guard) = match audit {
        Some((path, writer, guard)) => (Some(path), Some(writer), Some(guard)),
        None => (None, None, None),
    };

    let console = fmt::layer().with_target(false).with_ansi(atty::is(atty::Stream::Stdout));
    let audit_layer = writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false));

    tracing_subscriber::registry()
        .with(build_env_filter(config.filter.as_deref()))
        .with(console)
        .with(audit_layer)
        .init();

    LoggingGuard { audit_file, _worker_guard: guard }
}

/// File name stem for a run started at `started`.
pub fn audit_file_stem(started: DateTime<Local>) -> String {
    format!("audit_{}", started.format("%Y%m%d_%H%M%S"))
}

fn open_audit_file(
    dir: &Path,
) -> Result<(PathBuf, NonBlocking, WorkerGuard), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;

    let stem = audit_file_stem(Local::now());
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(stem.as_str())
        .filename_suffix("log")
        .build(dir)?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((dir.join(format!("{stem}.log")), writer, guard))
}

/// Priority: explicit filter, then `PGCOPY_LOG`, then `RUST_LOG`, then the default.
fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Chunk-level detail in debug builds, run and table summaries in release.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,pgcopy=debug,pgcopy_core=debug,tokio_postgres=warn,russh=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,tokio_postgres=warn,russh=warn"
    }
}

/// `<local data dir>/pgcopy/logs`.
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("pgcopy").join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_audit_file_stem_uses_start_time() {
        let started = Local.with_ymd_and_hms(2025, 10, 7, 1, 23, 45).unwrap();
        assert_eq!(audit_file_stem(started), "audit_20251007_012345");
    }

    #[test]
    fn test_audit_file_is_created_per_run() {
        let dir = tempdir().unwrap();
        let audit_dir = dir.path().join("logs");

        let (path, _writer, guard) = open_audit_file(&audit_dir).unwrap();
        drop(guard);

        assert!(path.exists());
        assert_eq!(path.parent(), Some(audit_dir.as_path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("audit_") && name.ends_with(".log"));
    }

    #[test]
    fn test_console_only_config() {
        let config = LogConfig::new().with_filter("warn").without_audit_file();
        assert!(config.audit_dir.is_none());
        assert_eq!(config.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(default_log_filter()).is_ok());
    }

    #[test]
    fn test_log_dir_is_namespaced() {
        assert!(log_dir().ends_with("pgcopy/logs"));
    }
}
