//! Installation state store - durable records of installed packages.
//!
//! Each installed keg carries an `INSTALL_RECEIPT.json` describing the
//! package, its variant, its dependency edges, the install timestamp, and the
//! file manifest. Receipts are the persistent state: they survive restarts
//! and are what `query`, upgrade impact analysis, and removal guards read.
//!
//! Atomic visibility: a receipt is written to a temporary file and renamed
//! into place, so a record either exists completely or not at all, and a
//! failed `record()` leaves prior state untouched. Writes are serialized
//! per package name and removal excludes all concurrent writes; reads never
//! take a lock.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::formula::{DependencyKind, ResolvedPackage};

const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// One dependency edge as recorded at install time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedDependency {
    pub name: String,
    pub version: String,
    pub kind: DependencyKind,
}

/// Persisted record of one installed package/version/variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    /// Fingerprint of the enabled option set
    pub variant: String,
    pub installed_on_request: bool,
    pub poured_from_bottle: bool,
    /// Unix timestamp of the successful install
    pub time: i64,
    #[serde(default)]
    pub dependencies: Vec<RecordedDependency>,
    /// Files inside the keg, relative to the keg root
    #[serde(default)]
    pub manifest: Vec<String>,
    /// Symlinks created in the install root, relative to it
    #[serde(default)]
    pub linked: Vec<String>,
}

impl InstalledRecord {
    /// Assemble a record for a completed installation; walks the keg to
    /// collect the file manifest.
    pub fn for_install(
        pkg: &ResolvedPackage,
        keg: &Path,
        install_root: &Path,
        dependencies: Vec<RecordedDependency>,
        linked: &[PathBuf],
        poured_from_bottle: bool,
    ) -> Result<Self> {
        let mut manifest = Vec::new();
        for entry in WalkDir::new(keg).follow_links(false) {
            let entry = entry.map_err(|e| EngineError::Other(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(keg) {
                manifest.push(rel.display().to_string());
            }
        }
        manifest.sort();

        let linked = linked
            .iter()
            .filter_map(|p| p.strip_prefix(install_root).ok())
            .map(|p| p.display().to_string())
            .collect();

        Ok(Self {
            name: pkg.name.clone(),
            version: pkg.version.clone(),
            variant: pkg.variant_fingerprint(),
            installed_on_request: pkg.requested,
            poured_from_bottle,
            time: Utc::now().timestamp(),
            dependencies,
            manifest,
            linked,
        })
    }
}

/// Durable, per-name-serialized record store rooted at an install prefix
pub struct StateStore {
    install_root: PathBuf,
    /// One write lock per package name; created on first write
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Held shared by `record`, exclusively by `remove`, so the dependents
    /// check and the delete see a stable receipt set.
    gate: RwLock<()>,
}

impl StateStore {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            locks: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
        }
    }

    fn cellar_dir(&self) -> PathBuf {
        self.install_root.join("cellar")
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Commit a record. The keg directory must already exist; the receipt is
    /// written next to its contents and renamed into place.
    pub fn record(&self, record: &InstalledRecord) -> Result<()> {
        let _shared = self.gate.read().expect("gate poisoned");
        let lock = self.name_lock(&record.name);
        let _guard = lock.lock().expect("name lock poisoned");

        let keg = self.cellar_dir().join(&record.name).join(&record.version);
        if !keg.is_dir() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "no keg at {} to record against",
                keg.display()
            )));
        }

        let json = serde_json::to_string_pretty(record)?;
        let tmp = keg.join(format!(".{RECEIPT_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, keg.join(RECEIPT_FILE))?;
        Ok(())
    }

    /// Query the newest installed record for a name. Lock-free.
    pub fn query(&self, name: &str) -> Result<InstalledRecord> {
        let formula_dir = self.cellar_dir().join(name);
        if !formula_dir.is_dir() {
            return Err(EngineError::NotFound(name.to_string()));
        }

        let mut versions: Vec<String> = fs::read_dir(&formula_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|v| !v.starts_with('.'))
            .collect();
        versions.sort_by(|a, b| compare_versions(a, b));

        // Newest version with a committed receipt; kegs mid-install have none
        for version in versions.iter().rev() {
            let receipt = formula_dir.join(version).join(RECEIPT_FILE);
            if let Ok(contents) = fs::read_to_string(&receipt) {
                return Ok(serde_json::from_str(&contents)?);
            }
        }

        Err(EngineError::NotFound(name.to_string()))
    }

    /// All committed records, ordered by name
    pub fn list(&self) -> Result<Vec<InstalledRecord>> {
        let cellar = self.cellar_dir();
        if !cellar.is_dir() {
            return Ok(vec![]);
        }

        let mut names: Vec<String> = fs::read_dir(&cellar)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();

        let mut records = Vec::new();
        for name in names {
            if let Ok(record) = self.query(&name) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Installed packages whose recorded dependency edges reference `name`
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>> {
        let mut dependents = Vec::new();
        for record in self.list()? {
            if record.dependencies.iter().any(|d| d.name == name) {
                dependents.push(record.name);
            }
        }
        Ok(dependents)
    }

    /// Remove a package: refused while other installed packages reference it
    /// through recorded dependency edges.
    pub fn remove(&self, name: &str) -> Result<InstalledRecord> {
        // Exclusive: no record may land between the dependents check and the
        // delete.
        let _exclusive = self.gate.write().expect("gate poisoned");

        let record = self.query(name)?;

        let dependents = self.dependents_of(name)?;
        if !dependents.is_empty() {
            return Err(EngineError::RemoveBlocked {
                name: name.to_string(),
                dependents,
            });
        }

        // Drop the symlinks first so nothing dangles while the keg goes away
        for link in &record.linked {
            let path = self.install_root.join(link);
            if path.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&path);
            }
        }
        fs::remove_dir_all(self.cellar_dir().join(name))?;
        Ok(record)
    }
}

/// Numeric-then-lexicographic version comparison (`1.10` > `1.9`)
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let a_parts: Vec<u32> = a.split('.').filter_map(|s| s.parse().ok()).collect();
    let b_parts: Vec<u32> = b.split('.').filter_map(|s| s.parse().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
