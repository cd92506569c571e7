//! pgcopy - copy PostgreSQL tables through an SSH bastion into remote databases.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use pgcopy_core::config::ReplicatorConfig;
use pgcopy_core::logging::{init_logging, LogConfig};
use pgcopy_core::models::DispatchReport;
use pgcopy_core::services::pipeline::Pipeline;
use pgcopy_core::services::secrets::{FileSecretStore, KeychainSecretStore, SecretStore};
use pgcopy_core::services::tunnel::fingerprint_from_openssh_public_key;

/// Exit code when some tables were not copied completely.
const EXIT_PARTIAL: u8 = 2;

/// Exit code for fatal errors.
const EXIT_FATAL: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "pgcopy", version, about = "Copy PostgreSQL tables through an SSH bastion")]
struct Cli {
    /// Log filter (overrides PGCOPY_LOG and RUST_LOG).
    #[arg(long, global = true)]
    log_filter: Option<String>,

    /// Directory for the per-run audit log (default: <local data dir>/pgcopy/logs).
    #[arg(long, global = true, conflicts_with = "no_audit_log")]
    log_dir: Option<PathBuf>,

    /// Log to the console only.
    #[arg(long, global = true)]
    no_audit_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy every configured table.
    Run {
        #[command(flatten)]
        inputs: InputArgs,

        /// Rows per applied chunk (overrides config).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Maximum rows fetched per table (overrides config).
        #[arg(long)]
        row_limit: Option<u64>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Open the tunnel only and forward until Ctrl-C.
    Tunnel {
        #[command(flatten)]
        inputs: InputArgs,
    },

    /// Print the pinned-fingerprint form of an OpenSSH public key.
    Fingerprint {
        /// OpenSSH public key file (e.g. ssh_host_ed25519_key.pub).
        #[arg(long)]
        public_key: PathBuf,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Config file path (default: <config dir>/pgcopy/pgcopy.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON secrets file (default: <config dir>/pgcopy/secrets.json).
    #[arg(long, conflicts_with = "keychain")]
    secrets: Option<PathBuf>,

    /// Read secrets from the OS keychain.
    #[arg(long)]
    keychain: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new();
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_audit_dir(dir);
    }
    if cli.no_audit_log {
        log_config = log_config.without_audit_file();
    }
    let logging = init_logging(log_config);
    if let Some(path) = logging.audit_file() {
        tracing::debug!(audit_file = %path.display(), "Audit log opened");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match runtime.block_on(execute(cli.command)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "pgcopy failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn execute(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run { inputs, batch_size, row_limit, json } => {
            let mut config = load_config(inputs.config.as_deref())?;
            if let Some(batch_size) = batch_size {
                config.copy.batch_size = batch_size;
            }
            if row_limit.is_some() {
                config.copy.row_limit = row_limit;
            }
            config.validate()?;

            let store = open_store(&inputs)?;
            let cancel = cancel_on_ctrl_c();

            tracing::info!(
                routes = config.routes.len(),
                batch_size = config.copy.batch_size,
                secrets = store.name(),
                "Starting pgcopy run"
            );

            let report = Pipeline::run(&config, store.as_ref(), cancel).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            Ok(if report.all_succeeded() { ExitCode::SUCCESS } else { ExitCode::from(EXIT_PARTIAL) })
        }

        Command::Tunnel { inputs } => {
            let config = load_config(inputs.config.as_deref())?;
            let store = open_store(&inputs)?;
            let cancel = CancellationToken::new();

            let tunnel = Pipeline::open_tunnel(&config, store.as_ref(), cancel.clone()).await?;
            println!("Forwarding {} -> source database (Ctrl-C to stop)", tunnel.forward.local_addr());

            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupt received, closing tunnel");
            tunnel.close().await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Fingerprint { public_key } => {
            let line = std::fs::read_to_string(&public_key)
                .with_context(|| format!("Failed to read {}", public_key.display()))?;
            println!("{}", fingerprint_from_openssh_public_key(line.trim())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ReplicatorConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => ReplicatorConfig::default_path().context("Could not determine config directory")?,
    };
    ReplicatorConfig::load(&path).with_context(|| format!("Loading {}", path.display()))
}

fn open_store(inputs: &InputArgs) -> Result<Box<dyn SecretStore>> {
    if inputs.keychain {
        return Ok(Box::new(KeychainSecretStore::new()));
    }

    let path = match &inputs.secrets {
        Some(path) => path.clone(),
        None => dirs::config_dir()
            .context("Could not determine config directory")?
            .join("pgcopy")
            .join("secrets.json"),
    };
    let store = FileSecretStore::open(&path).with_context(|| format!("Loading {}", path.display()))?;
    Ok(Box::new(store))
}

/// A token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current chunk");
            token.cancel();
        }
    });
    cancel
}

fn print_report(report: &DispatchReport) {
    for table in &report.tables {
        match (&table.outcome, &table.error) {
            (Some(outcome), _) => println!(
                "{} {}/{} {}: {} ({}/{} rows, {} chunks failed)",
                if outcome.succeeded() { "✓" } else { "✗" },
                table.host,
                table.database,
                table.table,
                outcome.status.as_str(),
                outcome.rows_applied,
                outcome.rows_attempted,
                outcome.chunks_failed,
            ),
            (None, error) => println!(
                "✗ {}/{} {}: {}",
                table.host,
                table.database,
                table.table,
                error.as_deref().unwrap_or("not copied"),
            ),
        }
    }
    println!("{} succeeded, {} failed", report.succeeded_count(), report.failed_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from(["pgcopy", "run", "--config", "a.toml", "--keychain", "--batch-size", "50"]);
        match cli.command {
            Command::Run { inputs, batch_size, row_limit, json } => {
                assert_eq!(inputs.config.as_deref(), Some(Path::new("a.toml")));
                assert!(inputs.keychain);
                assert_eq!(batch_size, Some(50));
                assert_eq!(row_limit, None);
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_secrets_and_keychain_conflict() {
        let result = Cli::try_parse_from(["pgcopy", "run", "--secrets", "s.json", "--keychain"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_dir_and_console_only_conflict() {
        let cli = Cli::parse_from(["pgcopy", "--log-dir", "/tmp/pgcopy-logs", "fingerprint", "--public-key", "k.pub"]);
        assert_eq!(cli.log_dir.as_deref(), Some(Path::new("/tmp/pgcopy-logs")));

        let result = Cli::try_parse_from(["pgcopy", "--log-dir", "x", "--no-audit-log", "fingerprint", "--public-key", "k.pub"]);
        assert!(result.is_err());
    }
}
