//! inspect-state command: list the chunks of a key/value state file.

use crate::codec::{ChunkHeader, ChunkReader};
use crate::config::{AgentConfig, HelperConfig};
use crate::helpers::blob::read_checksum_state;
use crate::helpers::file::{read_file_state, FileRecord};
use crate::helpers::ChecksumRecord;
use crate::Result;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::PathBuf;
use tracing::warn;

#[derive(Args)]
pub struct InspectStateArgs {
    /// State file to inspect
    pub state: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ChunkContents {
    Blob { records: Vec<ChecksumRecord> },
    Files { records: BTreeMap<String, FileRecord> },
    /// No configured helper owns this prefix
    Opaque,
}

#[derive(Debug, Serialize)]
pub struct ChunkSummary {
    #[serde(flatten)]
    pub header: ChunkHeader,
    pub contents: ChunkContents,
}

/// Decode every chunk, interpreting bodies by the configured helper kind
pub fn describe_state<R: Read>(
    input: R,
    config: Option<&AgentConfig>,
) -> Result<Vec<ChunkSummary>> {
    let mut reader = ChunkReader::new(input);
    let mut chunks = Vec::new();

    loop {
        let header = match reader.read_next() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) => {
                warn!("Unreadable chunk header, stopping: {}", e);
                break;
            }
        };

        let mut body = Vec::new();
        reader.chunk_body(header.size).read_to_end(&mut body)?;
        if (body.len() as u64) < header.size {
            warn!("State file ends inside chunk '{}'", header.prefix);
            break;
        }

        let kind = config.and_then(|c| c.helpers.iter().find(|h| h.prefix() == header.prefix));
        let contents = match kind {
            Some(HelperConfig::Blob { .. }) => {
                let mut records: Vec<ChecksumRecord> =
                    read_checksum_state(Some(&mut Cursor::new(body)))
                        .into_iter()
                        .map(|(key, checksum)| ChecksumRecord { key, checksum })
                        .collect();
                records.sort_by(|a, b| a.key.cmp(&b.key));
                ChunkContents::Blob { records }
            }
            Some(HelperConfig::Files { .. }) => ChunkContents::Files {
                records: read_file_state(Some(&mut Cursor::new(body))),
            },
            None => ChunkContents::Opaque,
        };
        chunks.push(ChunkSummary { header, contents });
    }
    Ok(chunks)
}

pub fn run(args: InspectStateArgs, config: Option<&AgentConfig>) -> Result<()> {
    let chunks = describe_state(BufReader::new(File::open(&args.state)?), config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!("State file: {}", args.state.display());
    for chunk in &chunks {
        println!("  [{}] {} bytes", chunk.header.prefix, chunk.header.size);
        match &chunk.contents {
            ChunkContents::Blob { records } => {
                for record in records {
                    println!("    {} crc={:#010x}", record.key, record.checksum);
                }
            }
            ChunkContents::Files { records } => {
                for (name, record) in records {
                    println!(
                        "    {} size={} mode={:o} mtime_ms={}",
                        name, record.size, record.mode, record.mtime_ms
                    );
                }
            }
            ChunkContents::Opaque => println!("    (no configured helper)"),
        }
    }
    Ok(())
}
