//! Application-declared include/exclude rules.
//!
//! ```xml
//! <full-backup-content>
//!     <include domain="database" path="orders.db"/>
//!     <exclude domain="file" path="tmp"/>
//! </full-backup-content>
//! ```
//!
//! A missing scheme means "include everything". A declared scheme that
//! breaks the tag or attribute rules is a hard error; individual rules
//! with an unknown domain or a suspicious path are skipped.

use crate::domain::{Domain, DomainResolver};
use crate::paths::canonicalize_lenient;
use crate::{Error, Result};
use once_cell::unsync::OnceCell;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xmltree::{Element, XMLNode};

pub const SCHEME_ROOT_TAG: &str = "full-backup-content";
const INCLUDE_TAG: &str = "include";
const EXCLUDE_TAG: &str = "exclude";
const MAX_ATTRIBUTES: usize = 2;

/// Canonical include paths per domain plus one flat exclude set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedScheme {
    pub includes: BTreeMap<Domain, BTreeSet<PathBuf>>,
    pub excludes: BTreeSet<PathBuf>,
}

impl ParsedScheme {
    pub fn has_includes(&self) -> bool {
        !self.includes.is_empty()
    }

    pub fn includes_for(&self, domain: Domain) -> Option<&BTreeSet<PathBuf>> {
        self.includes.get(&domain)
    }

    /// Whether a restore destination may be written
    pub fn is_eligible(&self, destination: &Path) -> bool {
        if self.excludes.contains(destination) {
            debug!("{} is excluded by the backup scheme", destination.display());
            return false;
        }
        if self.has_includes() && !self.covers(destination) {
            debug!("{} is not covered by any include", destination.display());
            return false;
        }
        true
    }

    /// An include covers a path if it names it, or names a directory above it
    fn covers(&self, destination: &Path) -> bool {
        self.includes.values().flatten().any(|include| {
            if include.is_dir() {
                destination.starts_with(include)
            } else {
                destination == include
            }
        })
    }
}

/// Parse a backup scheme against one application's domain roots
pub fn parse_scheme(xml: &str, resolver: &DomainResolver) -> Result<ParsedScheme> {
    let root = Element::parse(Cursor::new(xml.as_bytes()))?;
    if root.name != SCHEME_ROOT_TAG {
        return Err(Error::scheme(format!(
            "root tag must be <{}>, found <{}>",
            SCHEME_ROOT_TAG, root.name
        )));
    }

    let mut parsed = ParsedScheme::default();
    collect_rules(&root, resolver, &mut parsed)?;
    Ok(parsed)
}

fn collect_rules(
    parent: &Element,
    resolver: &DomainResolver,
    parsed: &mut ParsedScheme,
) -> Result<()> {
    for child in &parent.children {
        let XMLNode::Element(rule) = child else {
            continue;
        };
        let is_include = match rule.name.as_str() {
            INCLUDE_TAG => true,
            EXCLUDE_TAG => false,
            other => {
                return Err(Error::scheme(format!(
                    "<{}> is not a valid tag, expected <{}> or <{}>",
                    other, INCLUDE_TAG, EXCLUDE_TAG
                )))
            }
        };
        if rule.attributes.len() > MAX_ATTRIBUTES {
            return Err(Error::scheme(format!(
                "<{}> carries {} attributes, at most {} allowed",
                rule.name,
                rule.attributes.len(),
                MAX_ATTRIBUTES
            )));
        }

        add_rule(rule, is_include, resolver, parsed);
        collect_rules(rule, resolver, parsed)?;
    }
    Ok(())
}

fn add_rule(
    rule: &Element,
    is_include: bool,
    resolver: &DomainResolver,
    parsed: &mut ParsedScheme,
) {
    let domain_name = rule.attributes.get("domain").map(String::as_str).unwrap_or("");
    let Some(domain) = Domain::from_xml_domain(domain_name) else {
        info!("Unrecognized domain '{}' in backup scheme, skipping", domain_name);
        return;
    };
    let Some(domain_root) = resolver.directory_for(domain) else {
        info!("Domain '{}' has no directory for this app, skipping", domain_name);
        return;
    };

    let declared = rule.attributes.get("path").map(String::as_str).unwrap_or("");
    let Some(canonical) = canonical_rule_path(&domain_root, declared) else {
        warn!("Rejecting backup scheme path '{}'", declared);
        return;
    };
    if !canonical.starts_with(&domain_root) {
        warn!("Backup scheme path '{}' resolves outside its domain, skipping", declared);
        return;
    }

    let mut paths = vec![canonical.clone()];
    if !canonical.is_dir() {
        if domain.is_database() {
            paths.push(with_suffix(&canonical, "-journal"));
            paths.push(with_suffix(&canonical, "-wal"));
        } else if domain.is_shared_prefs() && !declared.ends_with(".xml") {
            paths.push(with_suffix(&canonical, ".xml"));
        }
    }

    if is_include {
        parsed.includes.entry(domain).or_default().extend(paths);
    } else {
        parsed.excludes.extend(paths);
    }
}

fn canonical_rule_path(domain_root: &Path, declared: &str) -> Option<PathBuf> {
    if declared.contains("..") || declared.contains("//") {
        return None;
    }
    let relative = declared.trim_start_matches('/');
    canonicalize_lenient(&domain_root.join(relative)).ok()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// One application's scheme source, parsed on first use
#[derive(Debug)]
pub struct BackupScheme {
    package: String,
    xml: Option<String>,
    parsed: OnceCell<ParsedScheme>,
}

impl BackupScheme {
    pub fn new(package: impl Into<String>, xml: Option<String>) -> Self {
        Self {
            package: package.into(),
            xml,
            parsed: OnceCell::new(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn is_declared(&self) -> bool {
        self.xml.is_some()
    }

    /// Parse once and cache; failures are not cached
    pub fn maybe_parse(&self, resolver: &DomainResolver) -> Result<&ParsedScheme> {
        self.parsed.get_or_try_init(|| match &self.xml {
            Some(xml) => {
                let parsed = parse_scheme(xml, resolver)?;
                debug!(
                    "Parsed backup scheme for {}: {} include domains, {} excludes",
                    self.package,
                    parsed.includes.len(),
                    parsed.excludes.len()
                );
                Ok(parsed)
            }
            None => Ok(ParsedScheme::default()),
        })
    }

    /// Restore eligibility; a scheme that fails to parse admits nothing
    pub fn is_eligible(&self, resolver: &DomainResolver, destination: &Path) -> bool {
        match self.maybe_parse(resolver) {
            Ok(parsed) => parsed.is_eligible(destination),
            Err(e) => {
                warn!("Backup scheme for {} is invalid: {}", self.package, e);
                false
            }
        }
    }
}

/// Parsed schemes for one backup or restore session
#[derive(Debug)]
pub struct SchemeCache {
    session: Uuid,
    schemes: HashMap<String, BackupScheme>,
}

impl SchemeCache {
    pub fn new() -> Self {
        Self {
            session: Uuid::new_v4(),
            schemes: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session
    }

    pub fn get_or_insert_with<F>(&mut self, package: &str, load: F) -> &BackupScheme
    where
        F: FnOnce() -> Option<String>,
    {
        self.schemes
            .entry(package.to_string())
            .or_insert_with(|| BackupScheme::new(package, load()))
    }

    pub fn len(&self) -> usize {
        self.schemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

impl Default for SchemeCache {
    fn default() -> Self {
        Self::new()
    }
}
