//! Artifact decision engine: bottle or source build, plus integrity checks.
//!
//! For each node the policy is: exact platform-tag bottle first, then any
//! bottle the [`CompatibilityPolicy`](crate::platform::CompatibilityPolicy)
//! accepts, otherwise a source build. Hash verification is a pure function
//! over file contents and is parallelized across a plan with rayon.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::formula::{CellarClass, Formula};
use crate::platform::{CompatibilityPolicy, PlatformFingerprint};

/// A bottle selected for installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedBottle {
    pub tag: String,
    pub sha256: String,
    pub cellar: CellarClass,
    pub rebuild: u32,
}

/// Outcome of the bottle-vs-source decision for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactDecision {
    Bottle(SelectedBottle),
    SourceBuild,
}

impl ArtifactDecision {
    pub fn is_bottle(&self) -> bool {
        matches!(self, ArtifactDecision::Bottle(_))
    }
}

/// Decide how to install one formula on the given platform.
///
/// Pure over the formula metadata: the decision never looks at the
/// filesystem, so it can run for a whole plan before any archive exists.
pub fn decide(
    formula: &Formula,
    platform: &PlatformFingerprint,
    policy: &dyn CompatibilityPolicy,
) -> ArtifactDecision {
    let exact = platform.bottle_tag();
    if let Some(entry) = formula.bottles.get(&exact) {
        return ArtifactDecision::Bottle(SelectedBottle {
            tag: exact,
            sha256: entry.sha256.clone(),
            cellar: entry.cellar.clone(),
            rebuild: entry.rebuild,
        });
    }

    // BTreeMap order keeps the fallback choice deterministic
    for (tag, entry) in &formula.bottles {
        if policy.compatible(platform, tag, &entry.cellar) {
            return ArtifactDecision::Bottle(SelectedBottle {
                tag: tag.clone(),
                sha256: entry.sha256.clone(),
                cellar: entry.cellar.clone(),
                rebuild: entry.rebuild,
            });
        }
    }

    ArtifactDecision::SourceBuild
}

/// Conventional cache filename for a bottle archive,
/// `<name>--<version>.<tag>.bottle.tar.gz`. The fetch layer (external) is
/// expected to place archives under this name.
pub fn bottle_archive_path(
    cache_dir: &Path,
    name: &str,
    version: &str,
    tag: &str,
) -> PathBuf {
    cache_dir.join(format!("{name}--{version}.{tag}.bottle.tar.gz"))
}

/// Streaming SHA-256 of a file
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify an archive against its declared hash. A mismatch is always fatal
/// and never retried here; installation must not proceed past it.
pub fn verify_archive(name: &str, path: &Path, expected: &str) -> Result<()> {
    let actual = file_sha256(path)?;
    if actual != expected {
        return Err(EngineError::IntegrityViolation {
            name: name.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Verify many archives in parallel; fails with the first violation in
/// input order.
pub fn verify_all(archives: &[(String, PathBuf, String)]) -> Result<()> {
    let results: Vec<Result<()>> = archives
        .par_iter()
        .map(|(name, path, expected)| verify_archive(name, path, expected))
        .collect();

    for result in results {
        result?;
    }
    Ok(())
}
