//! Full-backup traversal of an application's domains.

use crate::codec::{ArchiveEntry, ArchiveOutput, EntryKind, MeasuringOutput};
use crate::domain::{Domain, DomainResolver};
use crate::paths::canonicalize_lenient;
use crate::scheme::{BackupScheme, ParsedScheme};
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};

/// Told when a measured backup would not fit its destination
pub trait QuotaObserver {
    fn on_quota_exceeded(&mut self, _measured_bytes: u64, _quota_bytes: u64) {}
}

/// Observer that lets every backup proceed
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreQuota;

impl QuotaObserver for IgnoreQuota {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

impl WalkStats {
    fn absorb(&mut self, other: WalkStats) {
        self.files += other.files;
        self.directories += other.directories;
        self.bytes += other.bytes;
    }
}

/// Breadth-first traversal of one domain subtree
pub struct TreeWalker<'a> {
    package: &'a str,
}

impl<'a> TreeWalker<'a> {
    pub fn new(package: &'a str) -> Self {
        Self { package }
    }

    /// Walk `start`, which lies under `domain_root`, handing every surviving
    /// regular file and directory to `output`.
    ///
    /// Symlinks and special files are skipped. Paths in either exclude set
    /// are pruned together with everything below them. A missing `start`
    /// is not an error, and nothing outside `domain_root` is ever listed.
    pub fn walk_tree(
        &self,
        domain: Domain,
        domain_root: &Path,
        start: &Path,
        manifest_excludes: &BTreeSet<PathBuf>,
        system_excludes: &BTreeSet<PathBuf>,
        output: &mut dyn ArchiveOutput,
    ) -> Result<WalkStats> {
        let mut stats = WalkStats::default();
        let token = domain.token();

        let start = canonicalize_lenient(start)?;
        if !start.starts_with(domain_root) {
            warn!(
                "Walk start {} is outside domain root {}, skipping",
                start.display(),
                domain_root.display()
            );
            return Ok(stats);
        }
        let mut queue = VecDeque::from([start]);

        while let Some(path) = queue.pop_front() {
            if manifest_excludes.contains(&path) || system_excludes.contains(&path) {
                debug!("Pruning excluded {}", path.display());
                continue;
            }

            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} does not exist, skipping", path.display());
                    continue;
                }
                Err(e) => {
                    warn!("Unable to stat {}: {}", path.display(), e);
                    continue;
                }
            };
            let file_type = metadata.file_type();
            if !file_type.is_file() && !file_type.is_dir() {
                debug!("Skipping special file {}", path.display());
                continue;
            }

            let Ok(relative) = path.strip_prefix(domain_root) else {
                warn!(
                    "{} is outside domain root {}, skipping",
                    path.display(),
                    domain_root.display()
                );
                continue;
            };

            if file_type.is_dir() {
                match fs::read_dir(&path) {
                    Ok(entries) => {
                        let mut children: Vec<PathBuf> =
                            entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
                        children.sort();
                        queue.extend(children);
                    }
                    Err(e) => warn!("Unable to list {}: {}", path.display(), e),
                }
            }

            let entry = ArchiveEntry::from_metadata(self.package, &token, relative, &metadata);
            stats.bytes += output.encode_file(&entry, &path)?;
            match entry.kind {
                EntryKind::File => stats.files += 1,
                EntryKind::Directory => stats.directories += 1,
            }
        }

        Ok(stats)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FullBackupOptions {
    /// Directories excluded in every domain, on top of the system set
    pub extra_excludes: Vec<PathBuf>,
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FullBackupOutcome {
    pub stats: WalkStats,
    pub measured_bytes: Option<u64>,
    pub quota_exceeded: bool,
}

/// Drives the tree walker over every domain of one application
pub struct FullBackup<'a> {
    package: &'a str,
    resolver: &'a DomainResolver,
    scheme: &'a BackupScheme,
    options: FullBackupOptions,
}

impl<'a> FullBackup<'a> {
    pub fn new(
        package: &'a str,
        resolver: &'a DomainResolver,
        scheme: &'a BackupScheme,
        options: FullBackupOptions,
    ) -> Self {
        Self {
            package,
            resolver,
            scheme,
            options,
        }
    }

    /// Back up every domain into `output`.
    ///
    /// With a quota configured, a measuring pass runs first and reports to
    /// `observer` if the result exceeds it; the real pass runs regardless.
    pub fn run(
        &self,
        output: &mut dyn ArchiveOutput,
        observer: &mut dyn QuotaObserver,
    ) -> Result<FullBackupOutcome> {
        let span = span!(Level::INFO, "full_backup", package = self.package);
        let _enter = span.enter();

        let parsed = self.scheme.maybe_parse(self.resolver)?;
        let mut outcome = FullBackupOutcome::default();

        if let Some(quota) = self.options.quota_bytes {
            let mut measure = MeasuringOutput::default();
            self.backup_domains(parsed, &mut measure)?;
            let measured = measure.total_bytes();
            info!(
                "Measured {} bytes in {} entries against quota {}",
                measured,
                measure.entries(),
                quota
            );
            outcome.measured_bytes = Some(measured);
            if measured > quota {
                outcome.quota_exceeded = true;
                observer.on_quota_exceeded(measured, quota);
            }
        }

        outcome.stats = self.backup_domains(parsed, output)?;
        info!(
            "Backed up {} files and {} directories ({} bytes)",
            outcome.stats.files, outcome.stats.directories, outcome.stats.bytes
        );
        Ok(outcome)
    }

    fn backup_domains(
        &self,
        parsed: &ParsedScheme,
        output: &mut dyn ArchiveOutput,
    ) -> Result<WalkStats> {
        let walker = TreeWalker::new(self.package);
        let mut stats = WalkStats::default();

        let mut traversal_excludes = self.resolver.system_excludes();
        let extra: BTreeSet<PathBuf> = self
            .options
            .extra_excludes
            .iter()
            .map(|p| canonicalize_lenient(p))
            .collect::<io::Result<_>>()?;
        traversal_excludes.extend(extra.iter().cloned());

        for domain in Domain::BACKUP_ORDER {
            let Some(root) = self.resolver.directory_for(domain) else {
                continue;
            };
            if !extra.contains(&root) {
                traversal_excludes.remove(&root);
            }

            let starts: Vec<PathBuf> = if !parsed.has_includes() {
                vec![root.clone()]
            } else {
                parsed
                    .includes_for(domain)
                    .map(|paths| paths.iter().cloned().collect())
                    .unwrap_or_default()
            };
            for start in &starts {
                stats.absorb(walker.walk_tree(
                    domain,
                    &root,
                    start,
                    &parsed.excludes,
                    &traversal_excludes,
                    output,
                )?);
            }

            // closed again so later domains never walk back into it
            traversal_excludes.insert(root);
        }
        Ok(stats)
    }
}
