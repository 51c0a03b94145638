//! Formula data model consumed by the engine.
//!
//! A [`Formula`] is the immutable, already-deserialized form of one package
//! recipe: identity, declared version, source locator with its integrity hash,
//! dependency declarations, named build options, precomputed bottle table, and
//! build steps. The engine never parses recipe syntax itself; a loading front
//! end hands it these values (JSON is the interchange form, see
//! [`crate::index::FormulaIndex::load_dir`]).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::platform::PlatformFingerprint;

/// Relation kind of a dependency declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Needed only while building from source
    Build,
    /// Needed by the installed artifact at runtime
    Runtime,
    /// Needed only by the formula's smoke test
    Test,
    /// Pulled in only when the named option is enabled
    Optional,
}

/// Platform predicate attached to dependencies and build steps.
///
/// All present fields must match the fingerprint for the predicate to hold;
/// an absent field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPredicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Minimum toolchain major version (e.g. clang build 1205 analogue)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_toolchain: Option<u32>,
}

impl PlatformPredicate {
    pub fn matches(&self, platform: &PlatformFingerprint) -> bool {
        if self.os.as_ref().is_some_and(|os| os != &platform.os) {
            return false;
        }
        if self.arch.as_ref().is_some_and(|arch| arch != &platform.arch) {
            return false;
        }
        if self
            .min_toolchain
            .is_some_and(|min| platform.toolchain_version < min)
        {
            return false;
        }
        true
    }
}

/// One dependency declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: DependencyKind,
    /// For `kind: optional`, the option that pulls this dependency in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    /// Platform condition; absent means unconditional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<PlatformPredicate>,
}

fn default_kind() -> DependencyKind {
    DependencyKind::Runtime
}

impl Dependency {
    pub fn applies_to(&self, platform: &PlatformFingerprint) -> bool {
        self.on.as_ref().is_none_or(|p| p.matches(platform))
    }
}

/// A named build option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Enabled unless the request says otherwise
    #[serde(default)]
    pub default: bool,
}

/// Source locator plus integrity hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub sha256: String,
}

/// Cellar relocation class of a bottle: whether it tolerates being
/// unpacked under an install root other than the one it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellarClass {
    /// Relocatable: usable from any install root on the same architecture
    Any,
    /// Relocatable and needing no post-install path rewriting
    AnySkipRelocation,
    /// Built against one fixed cellar path; only usable there
    #[serde(untagged)]
    Fixed(String),
}

impl Default for CellarClass {
    fn default() -> Self {
        CellarClass::Any
    }
}

impl CellarClass {
    pub fn relocatable(&self) -> bool {
        matches!(self, CellarClass::Any | CellarClass::AnySkipRelocation)
    }
}

/// One entry in a formula's bottle table, keyed by platform tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleEntry {
    pub sha256: String,
    #[serde(default)]
    pub cellar: CellarClass,
    /// Incremented when a bottle is rebuilt without a version change
    #[serde(default)]
    pub rebuild: u32,
}

/// Declared toolchain compatibility window, checked before any build step runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolchainSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<u32>,
    /// Toolchain names this formula fails with outright
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

/// One build/install step: an argv, optional working directory relative to
/// the build root, extra environment entries, and a platform predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<PlatformPredicate>,
}

impl BuildStep {
    pub fn applies_to(&self, platform: &PlatformFingerprint) -> bool {
        self.on.as_ref().is_none_or(|p| p.matches(platform))
    }
}

/// Declarative package recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: String,
    /// Formula revision, appended as `_N` to the effective version when > 0
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Package names this formula cannot be installed alongside
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub options: Vec<BuildOption>,
    /// Bottle table: platform tag -> checksum + relocation class
    #[serde(default)]
    pub bottles: BTreeMap<String, BottleEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<ToolchainSpec>,
    #[serde(default)]
    pub build: Vec<BuildStep>,
}

impl Formula {
    /// Declared version with the revision suffix applied (`1.0.0_1` style)
    pub fn effective_version(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    /// Options enabled by default
    pub fn default_options(&self) -> BTreeSet<String> {
        self.options
            .iter()
            .filter(|o| o.default)
            .map(|o| o.name.clone())
            .collect()
    }

    /// Dependencies that participate in install resolution on this platform:
    /// build and runtime always, optional only when its option is enabled,
    /// test never.
    pub fn install_dependencies(
        &self,
        platform: &PlatformFingerprint,
        enabled_options: &BTreeSet<String>,
    ) -> Vec<&Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.applies_to(platform))
            .filter(|d| match d.kind {
                DependencyKind::Build | DependencyKind::Runtime => true,
                DependencyKind::Test => false,
                DependencyKind::Optional => d
                    .option
                    .as_ref()
                    .is_some_and(|opt| enabled_options.contains(opt)),
            })
            .collect()
    }
}

/// A formula bound to a concrete version and option set, valid within one
/// resolution session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub options: BTreeSet<String>,
    /// Whether the user asked for this package directly
    pub requested: bool,
}

impl ResolvedPackage {
    /// Short fingerprint of the enabled option set, used to key variants
    pub fn variant_fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for opt in &self.options {
            hasher.update(opt.as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        format!("{:x}", digest)[..12].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(os: &str, arch: &str, toolchain: u32) -> PlatformFingerprint {
        PlatformFingerprint {
            os: os.to_string(),
            arch: arch.to_string(),
            os_series: "test".to_string(),
            toolchain: "cc".to_string(),
            toolchain_version: toolchain,
        }
    }

    #[test]
    fn test_effective_version_revision() {
        let mut f: Formula = serde_json::from_str(r#"{"name":"x","version":"1.2.3"}"#).unwrap();
        assert_eq!(f.effective_version(), "1.2.3");
        f.revision = 2;
        assert_eq!(f.effective_version(), "1.2.3_2");
    }

    #[test]
    fn test_cellar_class_parsing() {
        let any: BottleEntry =
            serde_json::from_str(r#"{"sha256":"ab","cellar":"any"}"#).unwrap();
        assert_eq!(any.cellar, CellarClass::Any);

        let skip: BottleEntry =
            serde_json::from_str(r#"{"sha256":"ab","cellar":"any_skip_relocation"}"#).unwrap();
        assert_eq!(skip.cellar, CellarClass::AnySkipRelocation);

        let fixed: BottleEntry =
            serde_json::from_str(r#"{"sha256":"ab","cellar":"/opt/mashtun/cellar"}"#).unwrap();
        assert_eq!(
            fixed.cellar,
            CellarClass::Fixed("/opt/mashtun/cellar".to_string())
        );
        assert!(!fixed.cellar.relocatable());
    }

    #[test]
    fn test_platform_predicate() {
        let pred = PlatformPredicate {
            os: Some("linux".to_string()),
            arch: None,
            min_toolchain: Some(10),
        };
        assert!(pred.matches(&platform("linux", "x86_64", 12)));
        assert!(!pred.matches(&platform("linux", "x86_64", 9)));
        assert!(!pred.matches(&platform("macos", "arm64", 12)));
    }

    #[test]
    fn test_install_dependencies_filtering() {
        let formula: Formula = serde_json::from_str(
            r#"{
                "name": "demo",
                "version": "1.0",
                "dependencies": [
                    {"name": "cmake", "kind": "build"},
                    {"name": "zlib"},
                    {"name": "check", "kind": "test"},
                    {"name": "ssl", "kind": "optional", "option": "with-ssl"},
                    {"name": "gcc", "on": {"os": "linux"}}
                ]
            }"#,
        )
        .unwrap();

        let linux = platform("linux", "x86_64", 12);
        let none = BTreeSet::new();
        let names: Vec<&str> = formula
            .install_dependencies(&linux, &none)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["cmake", "zlib", "gcc"]);

        let mut with_ssl = BTreeSet::new();
        with_ssl.insert("with-ssl".to_string());
        let names: Vec<&str> = formula
            .install_dependencies(&linux, &with_ssl)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["cmake", "zlib", "ssl", "gcc"]);

        let macos = platform("macos", "arm64", 12);
        let names: Vec<&str> = formula
            .install_dependencies(&macos, &none)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["cmake", "zlib"]);
    }

    #[test]
    fn test_variant_fingerprint_stable() {
        let mut a = ResolvedPackage {
            name: "x".to_string(),
            version: "1.0".to_string(),
            options: BTreeSet::new(),
            requested: true,
        };
        let empty = a.variant_fingerprint();
        a.options.insert("with-ssl".to_string());
        let with_ssl = a.variant_fingerprint();
        assert_ne!(empty, with_ssl);
        assert_eq!(with_ssl, a.variant_fingerprint());
        assert_eq!(with_ssl.len(), 12);
    }
}
