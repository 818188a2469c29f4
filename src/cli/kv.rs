//! kv-backup and kv-restore commands.

use super::{commit_outputs, discard_outputs, partial_path, Summary};
use crate::codec::{EntityReader, EntityWriter};
use crate::config::AgentConfig;
use crate::Result;
use chrono::Utc;
use clap::Args;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Args)]
pub struct KvBackupArgs {
    /// State file written by the previous pass
    #[arg(long)]
    pub old_state: Option<PathBuf>,

    /// State file to write for the next pass
    #[arg(long)]
    pub new_state: PathBuf,

    /// Entity stream to write
    #[arg(short, long)]
    pub output: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct KvRestoreArgs {
    /// Entity stream to restore
    #[arg(short, long)]
    pub input: PathBuf,

    /// State file to write for the next backup pass
    #[arg(long)]
    pub new_state: PathBuf,

    /// Version of the application that produced the data set
    #[arg(long, default_value_t = 1)]
    pub app_version: i64,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_backup(args: KvBackupArgs, config: &AgentConfig) -> Result<()> {
    let started_at = Utc::now();
    let mut dispatcher = config.dispatcher()?;

    let outputs = [args.output.as_path(), args.new_state.as_path()];
    let result = (|| -> Result<_> {
        let mut old = args
            .old_state
            .as_ref()
            .filter(|path| path.exists())
            .map(|path| File::open(path).map(BufReader::new))
            .transpose()?;
        let mut data = EntityWriter::new(BufWriter::new(File::create(partial_path(&args.output))?));
        let mut new_state = File::create(partial_path(&args.new_state))?;

        let report = dispatcher.perform_backup(
            old.as_mut().map(|r| r as &mut dyn Read),
            &mut data,
            &mut new_state,
        )?;
        let entities = data.entities_written();
        data.finish()?.flush()?;
        new_state.sync_all()?;
        Ok((report, entities))
    })();

    let (report, entities) = match result {
        Ok(done) => {
            commit_outputs(&outputs)?;
            done
        }
        Err(e) => {
            discard_outputs(&outputs);
            return Err(e);
        }
    };

    Summary::new(Uuid::new_v4(), &config.package, started_at, report).print(args.json, |report| {
        println!("  Helpers: {}", report.invocation_order().join(", "));
        println!("  Entities written: {}", entities);
        if !report.skipped_chunks.is_empty() {
            println!("  Stale state chunks dropped: {}", report.skipped_chunks.join(", "));
        }
    })
}

pub fn run_restore(args: KvRestoreArgs, config: &AgentConfig) -> Result<()> {
    let started_at = Utc::now();
    let mut dispatcher = config.dispatcher()?;

    let outputs = [args.new_state.as_path()];
    let result = (|| -> Result<_> {
        let mut input = EntityReader::new(BufReader::new(File::open(&args.input)?));
        let mut new_state = File::create(partial_path(&args.new_state))?;
        let report = dispatcher.perform_restore(&mut input, args.app_version, &mut new_state)?;
        new_state.sync_all()?;
        Ok(report)
    })();

    let report = match result {
        Ok(report) => {
            commit_outputs(&outputs)?;
            report
        }
        Err(e) => {
            discard_outputs(&outputs);
            return Err(e);
        }
    };

    Summary::new(Uuid::new_v4(), &config.package, started_at, report).print(args.json, |report| {
        for (prefix, count) in &report.delivered {
            println!("  {}: {} entities", prefix, count);
        }
        println!("  Dropped: {}", report.dropped);
        println!("  State written for: {}", report.state_written.join(", "));
    })
}
