//! Build executor: runs installation recipes in an isolated environment.
//!
//! Source builds run each predicate-tagged step of the formula through an
//! [`EnvOverlay`] (fixed PATH, scoped variables) with stdout/stderr captured
//! into a single diagnostic log. Toolchain compatibility is enforced before
//! the first step runs. The whole build observes a wall-clock budget and a
//! cancellation token; either kills the child process and leaves nothing in
//! the cellar. Bottles skip the steps entirely and are unpacked directly.
//!
//! In both cases post-install fixups run before the state store sees the keg:
//! embedded placeholder paths are rewritten for the actual install root and
//! the keg's public directories are symlinked into the root.

use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tar::Archive;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::formula::{BuildStep, Formula, ResolvedPackage};
use crate::platform::PlatformFingerprint;

/// Placeholder bottles embed for the install root; rewritten at install time
pub const PLACEHOLDER_PREFIX: &str = "@@MASHTUN_PREFIX@@";
/// Placeholder for the cellar directory
pub const PLACEHOLDER_CELLAR: &str = "@@MASHTUN_CELLAR@@";

/// Directories under a keg that get symlinked into the install root
const LINKABLE_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc"];

/// Per-run execution settings
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root everything installs under; the cellar lives at `<root>/cellar`
    pub install_root: PathBuf,
    /// Where the (external) fetch layer leaves bottle archives
    pub bottle_cache: PathBuf,
    /// Wall-clock budget per build
    pub timeout: Duration,
    /// Maximum concurrently building nodes
    pub max_parallel: usize,
}

impl BuildConfig {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let install_root = install_root.into();
        let bottle_cache = install_root.join("cache");
        Self {
            install_root,
            bottle_cache,
            timeout: Duration::from_secs(3600),
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.install_root.join("cellar")
    }

    fn staging_dir(&self) -> PathBuf {
        self.install_root.join(".staging")
    }
}

/// Explicit environment for toolchain invocations: a fixed PATH plus scoped
/// variables, applied on top of a cleared process environment so nothing
/// ambient leaks into builds.
#[derive(Debug, Clone)]
pub struct EnvOverlay {
    pub path: Vec<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

impl EnvOverlay {
    /// Overlay for one source build
    pub fn for_build(
        pkg: &ResolvedPackage,
        keg: &Path,
        config: &BuildConfig,
        platform: &PlatformFingerprint,
    ) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(
            "PREFIX".to_string(),
            config.install_root.display().to_string(),
        );
        vars.insert("KEG".to_string(), keg.display().to_string());
        vars.insert("FORMULA_NAME".to_string(), pkg.name.clone());
        vars.insert("FORMULA_VERSION".to_string(), pkg.version.clone());
        vars.insert("CC".to_string(), platform.toolchain.clone());
        if !pkg.options.is_empty() {
            let opts: Vec<&str> = pkg.options.iter().map(String::as_str).collect();
            vars.insert("FORMULA_OPTIONS".to_string(), opts.join(","));
        }
        // HOME points into the build tree so tools writing dotfiles stay
        // inside the sandbox directory.
        vars.insert("HOME".to_string(), keg.display().to_string());

        Self {
            path: vec![
                config.install_root.join("bin"),
                PathBuf::from("/usr/bin"),
                PathBuf::from("/bin"),
                PathBuf::from("/usr/sbin"),
                PathBuf::from("/sbin"),
            ],
            vars,
        }
    }

    /// Apply to a command: clear the inherited environment first
    pub fn apply(&self, cmd: &mut Command) {
        let path: Vec<String> = self.path.iter().map(|p| p.display().to_string()).collect();
        cmd.env_clear();
        cmd.env("PATH", path.join(":"));
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// Cancellation signal for in-flight builds. Cancelling terminates the
/// running toolchain process; the node's keg and record are never committed.
#[derive(Clone)]
pub struct CancelToken {
    rx: tokio::sync::watch::Receiver<bool>,
}

/// Sender half held by whoever may abort the run
pub struct CancelHandle {
    tx: tokio::sync::watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever otherwise
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; never resolve
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Enforce the formula's declared toolchain window against the detected
/// toolchain. Runs before the first build step, never mid-build.
pub fn check_toolchain(formula: &Formula, platform: &PlatformFingerprint) -> Result<()> {
    let Some(spec) = &formula.toolchain else {
        return Ok(());
    };

    if spec.excluded.iter().any(|t| t == &platform.toolchain) {
        return Err(EngineError::ToolchainIncompatible {
            name: formula.name.clone(),
            reason: format!("formula fails with {}", platform.toolchain),
        });
    }
    if let Some(min) = spec.min_version {
        if platform.toolchain_version < min {
            return Err(EngineError::ToolchainIncompatible {
                name: formula.name.clone(),
                reason: format!(
                    "requires {} >= {min}, found {}",
                    platform.toolchain, platform.toolchain_version
                ),
            });
        }
    }
    if let Some(max) = spec.max_version {
        if platform.toolchain_version > max {
            return Err(EngineError::ToolchainIncompatible {
                name: formula.name.clone(),
                reason: format!(
                    "requires {} <= {max}, found {}",
                    platform.toolchain, platform.toolchain_version
                ),
            });
        }
    }
    Ok(())
}

enum StepResult {
    Finished(std::process::Output),
    TimedOut,
    Cancelled,
}

async fn run_step(
    step: &BuildStep,
    workdir: &Path,
    overlay: &EnvOverlay,
    remaining: Duration,
    cancel: &CancelToken,
) -> Result<StepResult> {
    let Some((program, args)) = step.command.split_first() else {
        return Err(EngineError::Other(anyhow::anyhow!(
            "build step has an empty command"
        )));
    };

    let dir = match &step.dir {
        Some(sub) => workdir.join(sub),
        None => workdir.to_path_buf(),
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    overlay.apply(&mut cmd);
    for (key, value) in &step.env {
        cmd.env(key, value);
    }

    let child = cmd.spawn()?;

    // Dropping the losing wait future kills the child (kill_on_drop)
    tokio::select! {
        output = child.wait_with_output() => Ok(StepResult::Finished(output?)),
        _ = tokio::time::sleep(remaining) => Ok(StepResult::TimedOut),
        _ = cancel.cancelled() => Ok(StepResult::Cancelled),
    }
}

/// Run a formula's build steps and install the result into the cellar.
///
/// The keg is assembled in a staging directory and only renamed into the
/// cellar after every step succeeded, so a failed or cancelled build leaves
/// the cellar untouched. Returns the keg path and the captured build log.
pub async fn build_from_source(
    formula: &Formula,
    pkg: &ResolvedPackage,
    config: &BuildConfig,
    platform: &PlatformFingerprint,
    cancel: &CancelToken,
) -> Result<(PathBuf, String)> {
    check_toolchain(formula, platform)?;

    let staging = config
        .staging_dir()
        .join(format!("{}-{}", pkg.name, pkg.version));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    let workdir = staging.join("build");
    let keg_stage = staging.join("keg");
    fs::create_dir_all(&workdir)?;
    fs::create_dir_all(&keg_stage)?;

    let overlay = EnvOverlay::for_build(pkg, &keg_stage, config, platform);
    let deadline = Instant::now() + config.timeout;
    let mut log = String::new();

    let steps: Vec<&BuildStep> = formula
        .build
        .iter()
        .filter(|s| s.applies_to(platform))
        .collect();

    for step in steps {
        log.push_str(&format!("==> {}\n", step.command.join(" ")));

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let _ = fs::remove_dir_all(&staging);
            return Err(EngineError::BuildFailed {
                name: pkg.name.clone(),
                log,
                timed_out: true,
            });
        }

        match run_step(step, &workdir, &overlay, remaining, cancel).await? {
            StepResult::Finished(output) => {
                log.push_str(&String::from_utf8_lossy(&output.stdout));
                log.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    tracing::debug!("step failed for {}: {}", pkg.name, output.status);
                    let _ = fs::remove_dir_all(&staging);
                    return Err(EngineError::BuildFailed {
                        name: pkg.name.clone(),
                        log,
                        timed_out: false,
                    });
                }
            }
            StepResult::TimedOut => {
                log.push_str("(build exceeded wall-clock budget, process killed)\n");
                let _ = fs::remove_dir_all(&staging);
                return Err(EngineError::BuildFailed {
                    name: pkg.name.clone(),
                    log,
                    timed_out: true,
                });
            }
            StepResult::Cancelled => {
                let _ = fs::remove_dir_all(&staging);
                return Err(EngineError::Cancelled(pkg.name.clone()));
            }
        }
    }

    // Commit the staged keg into the cellar
    let keg = config.cellar_dir().join(&pkg.name).join(&pkg.version);
    if let Some(parent) = keg.parent() {
        fs::create_dir_all(parent)?;
    }
    if keg.exists() {
        fs::remove_dir_all(&keg)?;
    }
    fs::rename(&keg_stage, &keg)?;
    let _ = fs::remove_dir_all(&staging);

    Ok((keg, log))
}

/// Unpack a verified bottle archive and commit it to the cellar, skipping
/// build steps.
///
/// Archives lay out `<name>/<version>/...`; the extracted version directory
/// may carry a rebuild suffix (`1.0.0_1`), so locate it after unpacking. The
/// archive is extracted into a staging directory and only a complete keg is
/// renamed into the cellar, as source builds do.
pub fn pour_bottle(
    archive_path: &Path,
    name: &str,
    version: &str,
    config: &BuildConfig,
) -> Result<PathBuf> {
    let staging = config.staging_dir().join(format!("{name}-{version}.pour"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let file = fs::File::open(archive_path)?;
    let decompressor = GzDecoder::new(file);
    let mut archive = Archive::new(decompressor);
    if let Err(err) = archive.unpack(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err.into());
    }

    let Some(source) = poured_version_dir(&staging.join(name), version) else {
        let _ = fs::remove_dir_all(&staging);
        return Err(EngineError::Other(anyhow::anyhow!(
            "bottle for {name} did not contain {version}"
        )));
    };
    let Some(dir_name) = source.file_name() else {
        let _ = fs::remove_dir_all(&staging);
        return Err(EngineError::Other(anyhow::anyhow!(
            "bottle for {name} unpacked to an unusable path"
        )));
    };

    let target_dir = config.cellar_dir().join(name);
    fs::create_dir_all(&target_dir)?;
    let keg = target_dir.join(dir_name);
    if keg.exists() {
        fs::remove_dir_all(&keg)?;
    }
    fs::rename(&source, &keg)?;
    let _ = fs::remove_dir_all(&staging);
    Ok(keg)
}

/// The extracted version directory: exact name preferred, else the highest
/// rebuild-suffixed candidate (`<version>_N`).
fn poured_version_dir(formula_dir: &Path, version: &str) -> Option<PathBuf> {
    let exact = formula_dir.join(version);
    if exact.exists() {
        return Some(exact);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(formula_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| {
                    n.strip_prefix(version)
                        .and_then(|rest| rest.strip_prefix('_'))
                        .is_some_and(|rev| rev.chars().all(|c| c.is_ascii_digit()))
                })
        })
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Post-install fixups: placeholder rewriting plus symlinking the keg's
/// public directories into the install root. Returns the created links.
pub fn apply_fixups(
    keg: &Path,
    config: &BuildConfig,
    skip_relocation: bool,
) -> Result<Vec<PathBuf>> {
    if !skip_relocation {
        relocate_placeholders(keg, config)?;
    }
    link_keg(keg, &config.install_root)
}

/// Rewrite embedded placeholder paths to the actual install root. Files are
/// scanned and rewritten in parallel; each file is independent.
fn relocate_placeholders(keg: &Path, config: &BuildConfig) -> Result<()> {
    let prefix = config.install_root.display().to_string();
    let cellar = config.cellar_dir().display().to_string();

    let files: Vec<PathBuf> = WalkDir::new(keg)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    let results: Vec<Result<()>> = files
        .par_iter()
        .map(|path| relocate_file(path, &prefix, &cellar))
        .collect();

    for result in results {
        result?;
    }
    Ok(())
}

fn relocate_file(path: &Path, prefix: &str, cellar: &str) -> Result<()> {
    let contents = fs::read(path)?;
    if !contains(&contents, PLACEHOLDER_PREFIX.as_bytes())
        && !contains(&contents, PLACEHOLDER_CELLAR.as_bytes())
    {
        return Ok(());
    }

    let rewritten = replace_bytes(
        &replace_bytes(&contents, PLACEHOLDER_CELLAR.as_bytes(), cellar.as_bytes()),
        PLACEHOLDER_PREFIX.as_bytes(),
        prefix.as_bytes(),
    );
    fs::write(path, rewritten)?;
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Symlink the keg's linkable directories into the install root using
/// relative links (`<root>/bin/x -> ../cellar/name/version/bin/x`).
fn link_keg(keg: &Path, install_root: &Path) -> Result<Vec<PathBuf>> {
    let mut linked = Vec::new();

    for dir_name in LINKABLE_DIRS {
        let source_dir = keg.join(dir_name);
        if !source_dir.is_dir() {
            continue;
        }
        let target_dir = install_root.join(dir_name);
        fs::create_dir_all(&target_dir)?;
        link_directory(&source_dir, &target_dir, install_root, &mut linked)?;
    }

    Ok(linked)
}

fn link_directory(
    source: &Path,
    target: &Path,
    install_root: &Path,
    linked: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());

        if source_path.is_dir() {
            fs::create_dir_all(&target_path)?;
            link_directory(&source_path, &target_path, install_root, linked)?;
            continue;
        }

        // Relative link so the whole root stays movable
        let relative = relative_link(&source_path, &target_path, install_root);
        if target_path.symlink_metadata().is_ok() {
            if fs::read_link(&target_path).map(|t| t == relative).unwrap_or(false) {
                continue; // already linked correctly
            }
            fs::remove_file(&target_path)?;
        }
        std::os::unix::fs::symlink(&relative, &target_path)?;
        linked.push(target_path);
    }
    Ok(())
}

fn relative_link(source: &Path, target: &Path, install_root: &Path) -> PathBuf {
    let Ok(source_rel) = source.strip_prefix(install_root) else {
        return source.to_path_buf();
    };
    let Ok(target_rel) = target.strip_prefix(install_root) else {
        return source.to_path_buf();
    };
    let ups = target_rel.components().count().saturating_sub(1);
    let mut path = PathBuf::new();
    for _ in 0..ups {
        path.push("..");
    }
    path.join(source_rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn platform(toolchain: &str, version: u32) -> PlatformFingerprint {
        PlatformFingerprint {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            os_series: "linux".to_string(),
            toolchain: toolchain.to_string(),
            toolchain_version: version,
        }
    }

    fn pkg(name: &str) -> ResolvedPackage {
        ResolvedPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            options: BTreeSet::new(),
            requested: true,
        }
    }

    fn formula(json: serde_json::Value) -> Formula {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_toolchain_minimum_checked_before_build() {
        let f = formula(serde_json::json!({
            "name": "x", "version": "1.0",
            "toolchain": {"min_version": 10},
        }));
        let err = check_toolchain(&f, &platform("gcc", 9)).unwrap_err();
        assert!(matches!(err, EngineError::ToolchainIncompatible { .. }));
        assert!(check_toolchain(&f, &platform("gcc", 10)).is_ok());
    }

    #[test]
    fn test_toolchain_exclusions() {
        let f = formula(serde_json::json!({
            "name": "x", "version": "1.0",
            "toolchain": {"excluded": ["gcc"]},
        }));
        assert!(check_toolchain(&f, &platform("gcc", 13)).is_err());
        assert!(check_toolchain(&f, &platform("clang", 15)).is_ok());
    }

    #[test]
    fn test_env_overlay_is_scoped() {
        let config = BuildConfig::new("/tmp/mashtun-root");
        let overlay = EnvOverlay::for_build(
            &pkg("demo"),
            Path::new("/tmp/mashtun-root/.staging/demo-1.0.0/keg"),
            &config,
            &platform("gcc", 13),
        );
        assert_eq!(overlay.vars["PREFIX"], "/tmp/mashtun-root");
        assert_eq!(overlay.vars["FORMULA_NAME"], "demo");
        assert_eq!(overlay.vars["CC"], "gcc");
        assert!(overlay.path.iter().any(|p| p.ends_with("bin")));
    }

    #[tokio::test]
    async fn test_build_success_commits_keg() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let f = formula(serde_json::json!({
            "name": "demo", "version": "1.0.0",
            "build": [
                {"command": ["sh", "-c", "mkdir -p \"$KEG/bin\" && echo ok > \"$KEG/bin/demo\""]}
            ],
        }));
        let (_, cancel) = cancel_pair();

        let (keg, log) =
            build_from_source(&f, &pkg("demo"), &config, &platform("gcc", 13), &cancel)
                .await
                .unwrap();
        assert!(keg.join("bin/demo").exists());
        assert!(log.contains("==> sh -c"));
        assert!(keg.starts_with(config.cellar_dir()));
        assert!(!config.staging_dir().join("demo-1.0.0").exists());
    }

    #[tokio::test]
    async fn test_failed_step_leaves_no_keg_and_carries_log() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let f = formula(serde_json::json!({
            "name": "demo", "version": "1.0.0",
            "build": [
                {"command": ["sh", "-c", "echo diagnostics && exit 3"]}
            ],
        }));
        let (_, cancel) = cancel_pair();

        let err = build_from_source(&f, &pkg("demo"), &config, &platform("gcc", 13), &cancel)
            .await
            .unwrap_err();
        match err {
            EngineError::BuildFailed { log, timed_out, .. } => {
                assert!(log.contains("diagnostics"));
                assert!(!timed_out);
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
        assert!(!config.cellar_dir().join("demo").exists());
    }

    #[tokio::test]
    async fn test_timeout_is_build_failed_with_timeout_reason() {
        let root = tempfile::tempdir().unwrap();
        let mut config = BuildConfig::new(root.path());
        config.timeout = Duration::from_millis(100);
        let f = formula(serde_json::json!({
            "name": "slow", "version": "1.0.0",
            "build": [{"command": ["sleep", "30"]}],
        }));
        let (_, cancel) = cancel_pair();

        let err = build_from_source(&f, &pkg("slow"), &config, &platform("gcc", 13), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BuildFailed { timed_out: true, .. }
        ));
        assert!(!config.cellar_dir().join("slow").exists());
    }

    #[tokio::test]
    async fn test_cancellation_kills_build() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let f = formula(serde_json::json!({
            "name": "victim", "version": "1.0.0",
            "build": [{"command": ["sleep", "30"]}],
        }));
        let (handle, cancel) = cancel_pair();

        let victim = pkg("victim");
        let plat = platform("gcc", 13);
        let build = build_from_source(&f, &victim, &config, &plat, &cancel);
        tokio::pin!(build);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => handle.cancel(),
            _ = &mut build => panic!("build should still be running"),
        }
        let err = build.await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(name) if name == "victim"));
        assert!(!config.cellar_dir().join("victim").exists());
    }

    #[tokio::test]
    async fn test_steps_filtered_by_platform_predicate() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let f = formula(serde_json::json!({
            "name": "cond", "version": "1.0.0",
            "build": [
                {"command": ["sh", "-c", "mkdir -p \"$KEG\" && touch \"$KEG/common\""]},
                {"command": ["sh", "-c", "touch \"$KEG/mac-only\""], "on": {"os": "macos"}},
                {"command": ["sh", "-c", "touch \"$KEG/linux-only\""], "on": {"os": "linux"}}
            ],
        }));
        let (_, cancel) = cancel_pair();

        let (keg, _) =
            build_from_source(&f, &pkg("cond"), &config, &platform("gcc", 13), &cancel)
                .await
                .unwrap();
        assert!(keg.join("common").exists());
        assert!(keg.join("linux-only").exists());
        assert!(!keg.join("mac-only").exists());
    }

    fn bottle_archive(dir: &Path, name: &str, version_dir: &str) -> PathBuf {
        use flate2::{Compression, write::GzEncoder};

        let content = dir.join("content").join(name).join(version_dir).join("bin");
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join(name), "bottled\n").unwrap();

        let path = dir.join(format!("{name}.bottle.tar.gz"));
        let encoder = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all(
                PathBuf::from(name).join(version_dir),
                dir.join("content").join(name).join(version_dir),
            )
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_pour_commits_keg_and_cleans_staging() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let scratch = tempfile::tempdir().unwrap();
        let archive = bottle_archive(scratch.path(), "demo", "1.0.0");

        let keg = pour_bottle(&archive, "demo", "1.0.0", &config).unwrap();
        assert_eq!(keg, config.cellar_dir().join("demo/1.0.0"));
        assert!(keg.join("bin/demo").exists());
        assert!(!config.staging_dir().join("demo-1.0.0.pour").exists());
    }

    #[test]
    fn test_pour_handles_rebuild_suffix() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let scratch = tempfile::tempdir().unwrap();
        let archive = bottle_archive(scratch.path(), "demo", "2.1.0_3");

        let keg = pour_bottle(&archive, "demo", "2.1.0", &config).unwrap();
        assert_eq!(keg, config.cellar_dir().join("demo/2.1.0_3"));
        assert!(keg.join("bin/demo").exists());
    }

    #[test]
    fn test_failed_pour_leaves_cellar_untouched() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("mangled.bottle.tar.gz");
        fs::write(&archive, b"this is not a gzip stream").unwrap();

        assert!(pour_bottle(&archive, "mangled", "1.0.0", &config).is_err());
        assert!(!config.cellar_dir().join("mangled").exists());
    }

    #[test]
    fn test_placeholder_relocation() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let keg = config.cellar_dir().join("demo/1.0.0");
        fs::create_dir_all(keg.join("lib")).unwrap();
        let pc = keg.join("lib/demo.pc");
        fs::write(&pc, format!("prefix={PLACEHOLDER_PREFIX}\nlibdir={PLACEHOLDER_CELLAR}/demo/1.0.0/lib\n")).unwrap();

        relocate_placeholders(&keg, &config).unwrap();

        let rewritten = fs::read_to_string(&pc).unwrap();
        assert!(rewritten.contains(&format!("prefix={}", config.install_root.display())));
        assert!(!rewritten.contains("@@"));
    }

    #[test]
    fn test_link_keg_creates_relative_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::new(root.path());
        let keg = config.cellar_dir().join("demo/1.0.0");
        fs::create_dir_all(keg.join("bin")).unwrap();
        fs::write(keg.join("bin/demo"), "#!/bin/sh\n").unwrap();

        let linked = apply_fixups(&keg, &config, true).unwrap();
        assert_eq!(linked.len(), 1);

        let link = config.install_root.join("bin/demo");
        let target = fs::read_link(&link).unwrap();
        assert!(target.is_relative());
        assert!(link.exists(), "symlink must resolve");
    }
}
