//! Logging initialisation for the command-line front end.

use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Output format for console logging
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_filter(verbose: bool) -> EnvFilter {
    // RUST_LOG wins over the built-in defaults
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("nova_backup_agent=debug")
        } else {
            EnvFilter::new("nova_backup_agent=info")
        }
    })
}

pub fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.with_file(true).with_line_number(true).init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

pub fn init_file_logging(log_file: &Path, verbose: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}
