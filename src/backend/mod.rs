//! The boundary to whatever actually executes a command.
//!
//! The engine hands a [`Job`] to a [`Backend`] and gets an [`Outcome`] back.
//! It imposes no retry policy of its own; a failed outcome is reported and
//! blocks the downstream targets, nothing more.

mod local;
mod slurm;

use std::fmt::{self, Display};
use std::process::ExitStatus;

use camino::Utf8Path;
use serde::Serialize;

use crate::core::Resources;

pub use local::Local;
pub use slurm::Slurm;

/// Everything a backend needs to execute one target.
#[derive(Debug, Clone, Copy)]
pub struct Job<'a> {
    pub id: &'a str,
    pub command: &'a str,
    pub resources: &'a Resources,
    /// Directory the command runs in; relative paths are relative to it.
    pub workdir: &'a Utf8Path,
}

/// How a failed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exit {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exit code {code}"),
            Exit::Signal(signal) => write!(f, "signal {signal}"),
            Exit::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Result of handing a single target to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// The command ran and did not succeed.
    Failed { exit: Exit },
    /// The command could not be handed over at all.
    SubmissionError { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn submission_error(message: impl Into<String>) -> Self {
        Outcome::SubmissionError {
            message: message.into(),
        }
    }

    pub(crate) fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return Outcome::Succeeded;
        }

        if let Some(code) = status.code() {
            return Outcome::Failed {
                exit: Exit::Code(code),
            };
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Outcome::Failed {
                    exit: Exit::Signal(signal),
                };
            }
        }

        Outcome::Failed { exit: Exit::Unknown }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Failed { exit } => write!(f, "failed ({exit})"),
            Outcome::SubmissionError { message } => write!(f, "submission error: {message}"),
        }
    }
}

/// Executes or submits resource-annotated commands.
///
/// Implementations must be safe to call from several threads at once; the
/// runner may submit all targets of a batch concurrently.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the job to completion and reports how it went.
    fn submit(&self, job: &Job<'_>) -> Outcome;
}

/// Resource hints as environment variables, for commands that want them.
pub(crate) fn resource_env(job: &Job<'_>) -> Vec<(&'static str, String)> {
    let mut env = vec![("KILN_TARGET", job.id.to_string())];
    let resources = job.resources;

    if let Some(memory) = resources.memory {
        env.push(("KILN_MEMORY", memory.to_string()));
    }
    if let Some(cores) = resources.cores {
        env.push(("KILN_CORES", cores.to_string()));
    }
    if let Some(walltime) = resources.walltime {
        env.push(("KILN_WALLTIME", walltime.to_string()));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Memory, Resources};

    #[test]
    fn test_resource_env() {
        let resources = Resources {
            memory: Some(Memory::gib(64)),
            cores: Some(8),
            ..Default::default()
        };
        let job = Job {
            id: "calc_tagging",
            command: "true",
            resources: &resources,
            workdir: Utf8Path::new("."),
        };

        let env = resource_env(&job);

        assert!(env.contains(&("KILN_TARGET", "calc_tagging".to_string())));
        assert!(env.contains(&("KILN_MEMORY", "64G".to_string())));
        assert!(env.contains(&("KILN_CORES", "8".to_string())));
        assert!(!env.iter().any(|(k, _)| *k == "KILN_WALLTIME"));
    }

    #[test]
    fn test_outcome_json() {
        let failed = Outcome::Failed { exit: Exit::Code(2) };

        assert_eq!(
            serde_json::to_string(&failed).unwrap(),
            r#"{"status":"failed","exit":{"code":2}}"#
        );
        assert_eq!(failed.to_string(), "failed (exit code 2)");
    }
}
