//! Agent configuration loaded from TOML.
//!
//! ```toml
//! package = "com.example.notes"
//! shared_volumes = ["/storage/emulated/0"]
//! backup_scheme = "/etc/novapcsuite/notes-backup.xml"
//! quota_bytes = 26214400
//!
//! [layout]
//! data_dir = "/data/user/0/com.example.notes"
//! device_data_dir = "/data/user_de/0/com.example.notes"
//!
//! [[helpers]]
//! kind = "files"
//! prefix = "notes"
//! dir = "/data/user/0/com.example.notes/files"
//! files = ["drafts.txt"]
//!
//! [[helpers]]
//! kind = "blob"
//! prefix = "prefs"
//! keys = { theme = "/data/user/0/com.example.notes/theme.json" }
//! ```

use crate::dispatcher::HelperDispatcher;
use crate::domain::{AppDataLayout, DomainResolver};
use crate::helpers::{BlobBackupHelper, FileBackupHelper, FileBlobSource};
use crate::walker::FullBackupOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_DIR: &str = "novapcsuite";
const CONFIG_FILE: &str = "backup-agent.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub package: String,
    pub layout: AppDataLayout,
    #[serde(default)]
    pub shared_volumes: Vec<PathBuf>,
    #[serde(default)]
    pub backup_scheme: Option<PathBuf>,
    #[serde(default)]
    pub extra_excludes: Vec<PathBuf>,
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default)]
    pub helpers: Vec<HelperConfig>,
}

/// One key/value helper registered with the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HelperConfig {
    Files {
        prefix: String,
        dir: PathBuf,
        files: Vec<String>,
    },
    Blob {
        prefix: String,
        #[serde(default = "default_blob_version")]
        version: i32,
        keys: BTreeMap<String, PathBuf>,
    },
}

fn default_blob_version() -> i32 {
    1
}

impl HelperConfig {
    pub fn prefix(&self) -> &str {
        match self {
            HelperConfig::Files { prefix, .. } | HelperConfig::Blob { prefix, .. } => prefix,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded configuration for {} from {}", config.package, path.display());
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| Error::Configuration {
            reason: "could not determine config directory".to_string(),
        })?;
        Ok(base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.package.is_empty() {
            return Err(config_error("package name is empty"));
        }
        for (name, path) in [
            ("layout.data_dir", &self.layout.data_dir),
            ("layout.device_data_dir", &self.layout.device_data_dir),
        ] {
            if !path.is_absolute() {
                return Err(config_error(format!("{} must be absolute: {}", name, path.display())));
            }
        }

        let mut seen = HashSet::new();
        for helper in &self.helpers {
            let prefix = helper.prefix();
            if prefix.is_empty() || prefix.contains(crate::codec::KEY_PREFIX_SEPARATOR) {
                return Err(config_error(format!("invalid helper prefix '{}'", prefix)));
            }
            if !seen.insert(prefix) {
                return Err(config_error(format!("helper prefix '{}' configured twice", prefix)));
            }
        }
        Ok(())
    }

    /// Contents of the configured backup scheme, if any
    pub fn load_scheme_xml(&self) -> Result<Option<String>> {
        self.backup_scheme
            .as_deref()
            .map(fs::read_to_string)
            .transpose()
            .map_err(Error::from)
    }

    pub fn resolver(&self) -> Result<DomainResolver> {
        DomainResolver::new(&self.layout, self.shared_volumes.clone())
    }

    pub fn full_backup_options(&self) -> FullBackupOptions {
        FullBackupOptions {
            extra_excludes: self.extra_excludes.clone(),
            quota_bytes: self.quota_bytes,
        }
    }

    /// Build a dispatcher with every configured helper registered
    pub fn dispatcher(&self) -> Result<HelperDispatcher> {
        let mut dispatcher = HelperDispatcher::new();
        for helper in &self.helpers {
            match helper {
                HelperConfig::Files { prefix, dir, files } => {
                    let helper = FileBackupHelper::new(dir, files.iter().cloned());
                    dispatcher.add_helper(prefix.as_str(), Box::new(helper))?;
                }
                HelperConfig::Blob { prefix, version, keys } => {
                    let source = FileBlobSource::new(keys.clone());
                    let helper = BlobBackupHelper::new(*version, keys.keys().cloned(), source)?;
                    dispatcher.add_helper(prefix.as_str(), Box::new(helper))?;
                }
            }
        }
        Ok(dispatcher)
    }
}

fn config_error(reason: impl Into<String>) -> Error {
    Error::Configuration {
        reason: reason.into(),
    }
}
