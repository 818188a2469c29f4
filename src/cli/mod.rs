//! Command-line interface for the backup agent.
//!
//! Every command reads the agent configuration, runs one pass and prints a
//! summary, either as text or as JSON with `--json`.

use crate::config::AgentConfig;
use crate::logging::LogFormat;
use crate::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod full;
pub mod inspect;
pub mod kv;

/// NovaPcSuite backup agent: incremental key/value and full file backup
#[derive(Parser)]
#[command(name = "nova-backup-agent")]
#[command(about = "Incremental key/value and domain-scoped full backup for one application")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Agent configuration file
    #[arg(short, long, global = true, env = "NOVA_BACKUP_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Walk every domain into a tar archive
    FullBackup(full::FullBackupArgs),
    /// Restore a tar archive produced by full-backup
    FullRestore(full::FullRestoreArgs),
    /// Run one incremental key/value backup pass
    KvBackup(kv::KvBackupArgs),
    /// Restore a key/value data set
    KvRestore(kv::KvRestoreArgs),
    /// Describe the chunks of a state file
    InspectState(inspect::InspectStateArgs),
}

impl Cli {
    /// Load the configuration named on the command line, or the default one
    pub fn load_config(&self) -> Result<AgentConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => AgentConfig::default_path()?,
        };
        AgentConfig::load(&path)
    }
}

/// Envelope printed after every pass
#[derive(Debug, Serialize)]
pub struct Summary<T: Serialize> {
    pub session: Uuid,
    pub package: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: T,
}

impl<T: Serialize> Summary<T> {
    pub fn new(session: Uuid, package: &str, started_at: DateTime<Utc>, report: T) -> Self {
        Self {
            session,
            package: package.to_string(),
            started_at,
            finished_at: Utc::now(),
            report,
        }
    }

    /// Print as pretty JSON, or hand the report to `text` for a human summary
    pub fn print(&self, json: bool, text: impl FnOnce(&T)) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
        } else {
            println!("Session {} for {}", self.session, self.package);
            text(&self.report);
            let elapsed = self.finished_at - self.started_at;
            println!("  Elapsed: {} ms", elapsed.num_milliseconds());
        }
        Ok(())
    }
}

/// Path written while a pass is in flight, renamed into place on success
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Move every partial output into place
pub(crate) fn commit_outputs(outputs: &[&Path]) -> Result<()> {
    for path in outputs {
        fs::rename(partial_path(path), path)?;
    }
    Ok(())
}

/// Remove partial outputs after a failed pass
pub(crate) fn discard_outputs(outputs: &[&Path]) {
    for path in outputs {
        let _ = fs::remove_file(partial_path(path));
    }
}
