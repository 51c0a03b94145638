//! mashtun - dependency resolution and build-orchestration engine.
//!
//! The engine consumes immutable formula declarations, resolves a consistent
//! set of package versions and variants, orders them into a build DAG,
//! decides per node whether a precompiled bottle can substitute for a source
//! build, executes installations with environment isolation, and persists
//! installed-package records. The `mash` binary is a thin front end over
//! [`Engine`].

pub mod artifact;
pub mod engine;
pub mod error;
pub mod executor;
pub mod formula;
pub mod graph;
pub mod index;
pub mod platform;
pub mod resolve;
pub mod store;

pub use engine::{Engine, InstallPlan, NodeOutcome};
pub use error::{EngineError, Result};
pub use executor::{BuildConfig, CancelToken, cancel_pair};
pub use formula::{Formula, ResolvedPackage};
pub use index::FormulaIndex;
pub use platform::{CompatibilityPolicy, DefaultPolicy, PlatformFingerprint};
pub use resolve::Request;
pub use store::{InstalledRecord, StateStore};
