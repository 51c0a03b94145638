//! Platform fingerprinting and the bottle compatibility relation.
//!
//! A bottle is keyed by a platform tag like `arm64_sequoia` or `x86_64_linux`:
//! `<arch>_<os series>`. The fingerprint additionally carries the detected
//! toolchain and its major version, which the build executor checks against
//! per-formula compatibility windows before the first step runs.
//!
//! Which non-exact tags are acceptable is policy, not mechanism: the engine
//! takes a [`CompatibilityPolicy`] and ships [`DefaultPolicy`], which accepts
//! the universal `all` tag and relocatable bottles built for the same
//! architecture.

#[cfg(target_os = "macos")]
use anyhow::Context;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::process::Command;

use crate::formula::CellarClass;

/// Tuple identifying a build target: OS, architecture, OS series used in
/// bottle tags, and the compiler toolchain ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFingerprint {
    pub os: String,
    pub arch: String,
    /// OS release series as used in bottle tags (`sequoia`, `linux`, ...)
    pub os_series: String,
    /// Toolchain name (`clang`, `gcc`, ...)
    pub toolchain: String,
    /// Toolchain major version
    pub toolchain_version: u32,
}

impl PlatformFingerprint {
    /// The exact bottle tag for this platform, `<arch>_<os_series>`
    pub fn bottle_tag(&self) -> String {
        format!("{}_{}", self.arch, self.os_series)
    }

    /// Detect the host platform
    pub fn host() -> Result<Self> {
        // Bottle tags say "arm64", not "aarch64"
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            other => other,
        }
        .to_string();

        let os = std::env::consts::OS.to_string();
        let os_series = detect_os_series()?;
        let (toolchain, toolchain_version) = detect_toolchain();

        Ok(Self {
            os,
            arch,
            os_series,
            toolchain,
            toolchain_version,
        })
    }
}

impl std::fmt::Display for PlatformFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} {})",
            self.bottle_tag(),
            self.toolchain,
            self.toolchain_version
        )
    }
}

#[cfg(target_os = "macos")]
fn detect_os_series() -> Result<String> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .context("Failed to run sw_vers")?;

    let version = String::from_utf8(output.stdout)
        .context("Invalid UTF-8 in sw_vers output")?
        .trim()
        .to_string();

    let major: u32 = version
        .split('.')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Ok(match major {
        26 => "tahoe",
        15 => "sequoia",
        14 => "sonoma",
        13 => "ventura",
        12 => "monterey",
        11 => "big_sur",
        _ => "sonoma",
    }
    .to_string())
}

#[cfg(not(target_os = "macos"))]
fn detect_os_series() -> Result<String> {
    Ok(std::env::consts::OS.to_string())
}

/// Detect the default C toolchain and its major version.
///
/// Falls back to ("cc", 0) when no compiler answers; the executor then fails
/// any formula declaring a minimum version, which is the safe direction.
fn detect_toolchain() -> (String, u32) {
    for name in ["clang", "gcc", "cc"] {
        let Ok(output) = Command::new(name).arg("-dumpversion").output() else {
            continue;
        };
        if !output.status.success() {
            continue;
        }
        let version = String::from_utf8_lossy(&output.stdout);
        let major = version
            .trim()
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        return (name.to_string(), major);
    }
    ("cc".to_string(), 0)
}

/// Pluggable relation deciding whether a non-exact bottle tag is usable on a
/// host. Exact-tag matches never reach the policy.
pub trait CompatibilityPolicy: Send + Sync {
    fn compatible(&self, host: &PlatformFingerprint, tag: &str, cellar: &CellarClass) -> bool;
}

/// Default compatibility relation: the universal `all` tag always works, and
/// relocatable bottles (`any` cellar classes) work across OS series on the
/// same architecture and OS.
#[derive(Debug, Default)]
pub struct DefaultPolicy;

impl CompatibilityPolicy for DefaultPolicy {
    fn compatible(&self, host: &PlatformFingerprint, tag: &str, cellar: &CellarClass) -> bool {
        if tag == "all" {
            return true;
        }
        if !cellar.relocatable() {
            return false;
        }
        // arm64_sonoma is usable on arm64_sequoia, but never across arches
        // and never across operating systems. Arch and series can both
        // contain underscores (x86_64, big_sur), so parse by arch prefix.
        match tag.strip_prefix(&format!("{}_", host.arch)) {
            Some(series) => series.contains("linux") == (host.os == "linux"),
            None => false,
        }
    }
}
