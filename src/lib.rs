//! # NovaPcSuite backup agent
//!
//! Incremental backup dispatch and domain-scoped full backup for one
//! application's data.
//!
//! ## Features
//!
//! - **Helper dispatch**: several key/value producers share one entity
//!   stream and one chunked state file
//! - **Checksum diffing**: configuration blobs are only resent when the CRC32
//!   of their compressed form changes
//! - **Domain walker**: breadth-first tar backup of an app's data domains
//!   under include/exclude rules declared in a backup scheme
//! - **Contained restore**: restored paths never leave their domain root
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nova_backup_agent::codec::EntityWriter;
//! use nova_backup_agent::dispatcher::HelperDispatcher;
//! use nova_backup_agent::helpers::FileBackupHelper;
//! use std::io::Cursor;
//!
//! # fn main() -> nova_backup_agent::Result<()> {
//! let mut dispatcher = HelperDispatcher::new();
//! dispatcher.add_helper("notes", Box::new(FileBackupHelper::new("/data/notes", ["drafts.txt"])))?;
//!
//! let mut data = EntityWriter::new(Vec::new());
//! let mut state = Cursor::new(Vec::new());
//! let report = dispatcher.perform_backup(None, &mut data, &mut state)?;
//! println!("Helpers run: {:?}", report.invocation_order());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod helpers;
pub mod logging;
pub mod paths;
pub mod restore;
pub mod scheme;
pub mod walker;

// Re-export commonly used types
pub use config::AgentConfig;
pub use dispatcher::HelperDispatcher;
pub use domain::{AppDataLayout, Domain, DomainResolver};
pub use error::{Error, Result};
pub use helpers::{BackupHelper, BlobBackupHelper, FileBackupHelper};
pub use scheme::{BackupScheme, SchemeCache};
pub use walker::{FullBackup, TreeWalker};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
