//! NovaPcSuite backup agent
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use nova_backup_agent::cli::{full, inspect, kv, Cli, Commands};
use nova_backup_agent::logging::{init_file_logging, init_logging};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match &cli.log_file {
        Some(path) => init_file_logging(path, cli.verbose)?,
        None => init_logging(cli.verbose, cli.log_format)?,
    }

    let config = cli.load_config();
    match cli.command {
        // listing chunks works without a config; decoding their bodies needs one
        Commands::InspectState(args) => inspect::run(args, config.ok().as_ref())?,
        Commands::FullBackup(args) => full::run_backup(args, &config?)?,
        Commands::FullRestore(args) => full::run_restore(args, &config?)?,
        Commands::KvBackup(args) => kv::run_backup(args, &config?)?,
        Commands::KvRestore(args) => kv::run_restore(args, &config?)?,
    }

    Ok(())
}
