use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Duplicate formula name in index: {0}")]
    DuplicateFormula(String),

    #[error("No satisfying assignment: {}", constraints.join("; "))]
    ResolutionConflict { constraints: Vec<String> },

    #[error("Dependency cycle detected: {}", members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    #[error("Integrity violation for {name}: expected sha256 {expected}, got {actual}")]
    IntegrityViolation {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Build failed for {name}{}", if *timed_out { " (timed out)" } else { "" })]
    BuildFailed {
        name: String,
        log: String,
        timed_out: bool,
    },

    #[error("Build cancelled for {0}")]
    Cancelled(String),

    #[error("Toolchain incompatible for {name}: {reason}")]
    ToolchainIncompatible { name: String, reason: String },

    #[error("Cannot remove {name}: required by {}", dependents.join(", "))]
    RemoveBlocked {
        name: String,
        dependents: Vec<String>,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// The log captured from a failed build, if any.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            EngineError::BuildFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
