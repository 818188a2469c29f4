//! Domain tokens and their on-disk roots.
//!
//! Every path handed out by [`DomainResolver`] is canonical (symlinks in
//! its existing prefix resolved), so exclude and containment checks can
//! compare paths directly.

use crate::paths::canonicalize_lenient;
use crate::Result;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

pub const ROOT_TREE_TOKEN: &str = "r";
pub const FILES_TREE_TOKEN: &str = "f";
pub const DATABASE_TREE_TOKEN: &str = "db";
pub const SHAREDPREFS_TREE_TOKEN: &str = "sp";
pub const CACHE_TREE_TOKEN: &str = "c";
pub const NO_BACKUP_TREE_TOKEN: &str = "nb";
pub const DEVICE_ROOT_TREE_TOKEN: &str = "d_r";
pub const DEVICE_FILES_TREE_TOKEN: &str = "d_f";
pub const DEVICE_DATABASE_TREE_TOKEN: &str = "d_db";
pub const DEVICE_SHAREDPREFS_TREE_TOKEN: &str = "d_sp";
pub const DEVICE_CACHE_TREE_TOKEN: &str = "d_c";
pub const DEVICE_NO_BACKUP_TREE_TOKEN: &str = "d_nb";
pub const MANAGED_EXTERNAL_TREE_TOKEN: &str = "ef";
pub const SHARED_PREFIX: &str = "shared/";

const FILES_DIR: &str = "files";
const DATABASES_DIR: &str = "databases";
const SHARED_PREFS_DIR: &str = "shared_prefs";
const CACHE_DIR: &str = "cache";
const CODE_CACHE_DIR: &str = "code_cache";
const NO_BACKUP_DIR: &str = "no_backup";

/// Symbolic filesystem subtree of one application
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    Root,
    Files,
    Database,
    SharedPrefs,
    Cache,
    NoBackup,
    DeviceRoot,
    DeviceFiles,
    DeviceDatabase,
    DeviceSharedPrefs,
    DeviceCache,
    DeviceNoBackup,
    ManagedExternal,
    /// Index into the live list of mounted shared volumes
    SharedVolume(usize),
}

impl Domain {
    /// Order in which a full backup visits domains
    pub const BACKUP_ORDER: [Domain; 9] = [
        Domain::Root,
        Domain::DeviceRoot,
        Domain::Files,
        Domain::DeviceFiles,
        Domain::Database,
        Domain::DeviceDatabase,
        Domain::SharedPrefs,
        Domain::DeviceSharedPrefs,
        Domain::ManagedExternal,
    ];

    pub fn token(&self) -> String {
        self.to_string()
    }

    pub fn from_token(token: &str) -> Option<Self> {
        let domain = match token {
            ROOT_TREE_TOKEN => Domain::Root,
            FILES_TREE_TOKEN => Domain::Files,
            DATABASE_TREE_TOKEN => Domain::Database,
            SHAREDPREFS_TREE_TOKEN => Domain::SharedPrefs,
            CACHE_TREE_TOKEN => Domain::Cache,
            NO_BACKUP_TREE_TOKEN => Domain::NoBackup,
            DEVICE_ROOT_TREE_TOKEN => Domain::DeviceRoot,
            DEVICE_FILES_TREE_TOKEN => Domain::DeviceFiles,
            DEVICE_DATABASE_TREE_TOKEN => Domain::DeviceDatabase,
            DEVICE_SHAREDPREFS_TREE_TOKEN => Domain::DeviceSharedPrefs,
            DEVICE_CACHE_TREE_TOKEN => Domain::DeviceCache,
            DEVICE_NO_BACKUP_TREE_TOKEN => Domain::DeviceNoBackup,
            MANAGED_EXTERNAL_TREE_TOKEN => Domain::ManagedExternal,
            other => {
                let index = other.strip_prefix(SHARED_PREFIX)?;
                return index.parse().ok().map(Domain::SharedVolume);
            }
        };
        Some(domain)
    }

    /// Map a `domain="..."` value from a backup scheme
    pub fn from_xml_domain(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Domain::Files),
            "database" => Some(Domain::Database),
            "root" => Some(Domain::Root),
            "sharedpref" => Some(Domain::SharedPrefs),
            "device_file" => Some(Domain::DeviceFiles),
            "device_database" => Some(Domain::DeviceDatabase),
            "device_root" => Some(Domain::DeviceRoot),
            "device_sharedpref" => Some(Domain::DeviceSharedPrefs),
            "external" => Some(Domain::ManagedExternal),
            _ => None,
        }
    }

    pub fn is_database(&self) -> bool {
        matches!(self, Domain::Database | Domain::DeviceDatabase)
    }

    pub fn is_shared_prefs(&self) -> bool {
        matches!(self, Domain::SharedPrefs | Domain::DeviceSharedPrefs)
    }

    pub fn is_no_backup(&self) -> bool {
        matches!(self, Domain::NoBackup | Domain::DeviceNoBackup)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Domain::Root => ROOT_TREE_TOKEN,
            Domain::Files => FILES_TREE_TOKEN,
            Domain::Database => DATABASE_TREE_TOKEN,
            Domain::SharedPrefs => SHAREDPREFS_TREE_TOKEN,
            Domain::Cache => CACHE_TREE_TOKEN,
            Domain::NoBackup => NO_BACKUP_TREE_TOKEN,
            Domain::DeviceRoot => DEVICE_ROOT_TREE_TOKEN,
            Domain::DeviceFiles => DEVICE_FILES_TREE_TOKEN,
            Domain::DeviceDatabase => DEVICE_DATABASE_TREE_TOKEN,
            Domain::DeviceSharedPrefs => DEVICE_SHAREDPREFS_TREE_TOKEN,
            Domain::DeviceCache => DEVICE_CACHE_TREE_TOKEN,
            Domain::DeviceNoBackup => DEVICE_NO_BACKUP_TREE_TOKEN,
            Domain::ManagedExternal => MANAGED_EXTERNAL_TREE_TOKEN,
            Domain::SharedVolume(index) => return write!(f, "{}{}", SHARED_PREFIX, index),
        };
        f.write_str(token)
    }
}

// serialized as its token so domains can key JSON maps
impl Serialize for Domain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where an application keeps its data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDataLayout {
    /// Credential-encrypted data root
    pub data_dir: PathBuf,
    /// Device-encrypted data root
    pub device_data_dir: PathBuf,
    #[serde(default)]
    pub external_files_dir: Option<PathBuf>,
    #[serde(default)]
    pub native_library_dir: Option<PathBuf>,
}

/// Source of the currently mounted shared volumes, queried on every lookup
pub trait VolumeSource {
    fn mounted_volumes(&self) -> Vec<PathBuf>;
}

impl VolumeSource for Vec<PathBuf> {
    fn mounted_volumes(&self) -> Vec<PathBuf> {
        self.clone()
    }
}

/// Resolves domain tokens to canonical directories for one application
pub struct DomainResolver {
    roots: BTreeMap<Domain, PathBuf>,
    code_cache_dirs: [PathBuf; 2],
    native_library_dir: Option<PathBuf>,
    volumes: Box<dyn VolumeSource>,
}

impl DomainResolver {
    pub fn new(layout: &AppDataLayout, volumes: impl VolumeSource + 'static) -> Result<Self> {
        let ce = canonicalize_lenient(&layout.data_dir)?;
        let de = canonicalize_lenient(&layout.device_data_dir)?;

        let mut roots = BTreeMap::new();
        for (base, root, subdirs) in [
            (
                &ce,
                Domain::Root,
                [
                    (Domain::Files, FILES_DIR),
                    (Domain::Database, DATABASES_DIR),
                    (Domain::SharedPrefs, SHARED_PREFS_DIR),
                    (Domain::Cache, CACHE_DIR),
                    (Domain::NoBackup, NO_BACKUP_DIR),
                ],
            ),
            (
                &de,
                Domain::DeviceRoot,
                [
                    (Domain::DeviceFiles, FILES_DIR),
                    (Domain::DeviceDatabase, DATABASES_DIR),
                    (Domain::DeviceSharedPrefs, SHARED_PREFS_DIR),
                    (Domain::DeviceCache, CACHE_DIR),
                    (Domain::DeviceNoBackup, NO_BACKUP_DIR),
                ],
            ),
        ] {
            roots.insert(root, base.clone());
            for (domain, name) in subdirs {
                roots.insert(domain, canonicalize_lenient(&base.join(name))?);
            }
        }
        if let Some(external) = &layout.external_files_dir {
            roots.insert(Domain::ManagedExternal, canonicalize_lenient(external)?);
        }

        let code_cache_dirs = [
            canonicalize_lenient(&ce.join(CODE_CACHE_DIR))?,
            canonicalize_lenient(&de.join(CODE_CACHE_DIR))?,
        ];
        let native_library_dir = layout
            .native_library_dir
            .as_deref()
            .map(canonicalize_lenient)
            .transpose()?;

        Ok(Self {
            roots,
            code_cache_dirs,
            native_library_dir,
            volumes: Box::new(volumes),
        })
    }

    /// Canonical root of a token, or `None` for unknown tokens and shared
    /// volume indices that are not currently mounted
    pub fn token_to_directory_path(&self, token: &str) -> Option<PathBuf> {
        self.directory_for(Domain::from_token(token)?)
    }

    pub fn directory_for(&self, domain: Domain) -> Option<PathBuf> {
        match domain {
            Domain::SharedVolume(index) => {
                let volume = self.volumes.mounted_volumes().into_iter().nth(index);
                if volume.is_none() {
                    debug!("Shared volume {} is not mounted", index);
                }
                canonicalize_lenient(&volume?).ok()
            }
            other => self.roots.get(&other).cloned(),
        }
    }

    /// Directories never traversed except when their own domain is open
    pub fn system_excludes(&self) -> BTreeSet<PathBuf> {
        let mut excludes: BTreeSet<PathBuf> = self
            .roots
            .iter()
            .filter(|(domain, _)| {
                !matches!(domain, Domain::Root | Domain::DeviceRoot | Domain::ManagedExternal)
            })
            .map(|(_, path)| path.clone())
            .collect();
        excludes.extend(self.code_cache_dirs.iter().cloned());
        excludes.extend(self.native_library_dir.iter().cloned());
        excludes
    }
}
