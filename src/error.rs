use camino::Utf8PathBuf;
use thiserror::Error;

/// Problems with the shape of the workflow itself. All of these are detected
/// before a single command is submitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Target id must not be empty")]
    EmptyId,

    #[error("Target id '{0}' must not contain path separators or be '.' or '..'")]
    InvalidId(String),

    #[error("Target '{0}' is registered more than once")]
    DuplicateTarget(String),

    #[error("Output '{path}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Target '{target}' reads '{path}', which does not exist and no target produces it")]
    DanglingInput { target: String, path: Utf8PathBuf },

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("Selection '{0}' does not match any target")]
    EmptySelection(String),

    #[error("Invalid selection pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl ConfigError {
    /// Target ids named by this error, in the order they appear.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            ConfigError::DuplicateTarget(id)
            | ConfigError::UnknownTarget(id)
            | ConfigError::InvalidId(id) => vec![id],
            ConfigError::DuplicateOutput { first, second, .. } => vec![first, second],
            ConfigError::Cycle(ids) => ids.iter().map(String::as_str).collect(),
            ConfigError::DanglingInput { target, .. } => vec![target],
            _ => vec![],
        }
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Invalid memory amount '{0}'")]
    Memory(String),

    #[error("Invalid walltime '{0}', expected [D-]HH:MM:SS")]
    Walltime(String),
}

/// Raised when a pipeline factory fails while stamping out targets for one
/// parameter record.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Factory for '{0}':\n{1}")]
    Userland(String, anyhow::Error),

    #[error("Factory for '{0}': {1}")]
    Config(String, ConfigError),
}

/// Misuse of a [`Plan`](crate::Plan) while feeding back outcomes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Target '{0}' is not part of this plan")]
    NotPlanned(String),

    #[error("Target '{0}' was reported before it was dispatched")]
    NotDispatched(String),

    #[error("Target '{0}' was already reported")]
    AlreadyComplete(String),
}

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("Error in workflow configuration.\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Error while accessing the file system.\n{0}")]
    Io(#[from] std::io::Error),
}
