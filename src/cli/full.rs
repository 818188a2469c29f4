//! full-backup and full-restore commands.

use super::{commit_outputs, discard_outputs, partial_path, Summary};
use crate::codec::{TarArchiveReader, TarArchiveWriter};
use crate::config::AgentConfig;
use crate::restore::FullRestore;
use crate::scheme::SchemeCache;
use crate::walker::{FullBackup, QuotaObserver};
use crate::Result;
use chrono::Utc;
use clap::Args;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::warn;

#[derive(Args)]
pub struct FullBackupArgs {
    /// Archive to write
    #[arg(short, long)]
    pub output: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct FullRestoreArgs {
    /// Archive to restore
    #[arg(short, long)]
    pub input: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Logs quota overruns; the CLI never rolls a backup back
struct WarnOnQuota;

impl QuotaObserver for WarnOnQuota {
    fn on_quota_exceeded(&mut self, measured_bytes: u64, quota_bytes: u64) {
        warn!(
            "Backup of {} bytes exceeds the quota of {} bytes",
            measured_bytes, quota_bytes
        );
    }
}

pub fn run_backup(args: FullBackupArgs, config: &AgentConfig) -> Result<()> {
    let started_at = Utc::now();
    let resolver = config.resolver()?;
    let xml = config.load_scheme_xml()?;
    let mut schemes = SchemeCache::new();
    let session = schemes.session_id();
    let scheme = schemes.get_or_insert_with(&config.package, || xml);

    let outputs = [args.output.as_path()];
    let result = (|| -> Result<_> {
        let file = File::create(partial_path(&args.output))?;
        let mut writer = TarArchiveWriter::new(BufWriter::new(file));
        let options = config.full_backup_options();
        let outcome = FullBackup::new(&config.package, &resolver, scheme, options)
            .run(&mut writer, &mut WarnOnQuota)?;
        writer.finish()?.flush()?;
        Ok(outcome)
    })();

    let outcome = match result {
        Ok(outcome) => {
            commit_outputs(&outputs)?;
            outcome
        }
        Err(e) => {
            discard_outputs(&outputs);
            return Err(e);
        }
    };

    Summary::new(session, &config.package, started_at, outcome).print(args.json, |outcome| {
        println!("  Archive: {}", args.output.display());
        println!("  Files: {}", outcome.stats.files);
        println!("  Directories: {}", outcome.stats.directories);
        println!("  Bytes: {}", outcome.stats.bytes);
        if outcome.quota_exceeded {
            println!("  Quota exceeded");
        }
    })
}

pub fn run_restore(args: FullRestoreArgs, config: &AgentConfig) -> Result<()> {
    let started_at = Utc::now();
    let resolver = config.resolver()?;
    let xml = config.load_scheme_xml()?;
    let mut schemes = SchemeCache::new();
    let session = schemes.session_id();
    let scheme = schemes.get_or_insert_with(&config.package, || xml);

    let mut reader = TarArchiveReader::new(BufReader::new(File::open(&args.input)?));
    let stats = FullRestore::new(&config.package, &resolver, scheme).run(&mut reader)?;

    Summary::new(session, &config.package, started_at, stats).print(args.json, |stats| {
        println!("  Archive: {}", args.input.display());
        println!("  Files restored: {}", stats.files);
        println!("  Directories restored: {}", stats.directories);
        println!("  Entries skipped: {}", stats.skipped);
    })
}
