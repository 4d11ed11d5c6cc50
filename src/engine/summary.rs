use std::fmt::{self, Display, Write};
use std::time::Duration;

use console::style;
use serde::Serialize;

use crate::backend::Outcome;
use crate::blueprint::Workflow;
use crate::engine::StaleReason;

/// What happened to a single target during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Status {
    /// Outputs were up to date, nothing was submitted.
    SkippedFresh,
    RanSucceeded,
    RanFailed { outcome: Outcome },
    /// Never submitted because an upstream target failed.
    BlockedByUpstreamFailure { upstream: String },
    /// Outside the selection, or the run ended before it was dispatched.
    NotReached,
}

impl Status {
    fn label(&self) -> &'static str {
        match self {
            Status::SkippedFresh => "skipped-fresh",
            Status::RanSucceeded => "ran-succeeded",
            Status::RanFailed { .. } => "ran-failed",
            Status::BlockedByUpstreamFailure { .. } => "blocked-by-upstream-failure",
            Status::NotReached => "not-reached",
        }
    }

    fn color(&self) -> &'static str {
        match self {
            Status::SkippedFresh => "#ADD8E6",
            Status::RanSucceeded => "#90EE90",
            Status::RanFailed { .. } => "#F08080",
            Status::BlockedByUpstreamFailure { .. } => "#FFD580",
            Status::NotReached => "#D3D3D3",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::RanFailed { outcome } => write!(f, "{} ({outcome})", self.label()),
            Status::BlockedByUpstreamFailure { upstream } => {
                write!(f, "{} ('{upstream}')", self.label())
            }
            _ => f.write_str(self.label()),
        }
    }
}

static NOT_REACHED: Status = Status::NotReached;

/// One line of the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: String,
    #[serde(flatten)]
    pub status: Status,
    /// Why the target was scheduled, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StaleReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

/// Per-target report of a run, in registration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub entries: Vec<Entry>,
    pub elapsed: Duration,
}

impl Summary {
    pub fn get(&self, id: &str) -> Option<&Status> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &entry.status)
    }

    pub fn count(&self, predicate: impl Fn(&Status) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.status)).count()
    }

    /// Ids of every target that was submitted.
    pub fn ran(&self) -> Vec<&str> {
        self.ids(|status| {
            matches!(status, Status::RanSucceeded | Status::RanFailed { .. })
        })
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids(|status| matches!(status, Status::RanFailed { .. }))
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.ids(|status| matches!(status, Status::BlockedByUpstreamFailure { .. }))
    }

    /// No target failed or was blocked.
    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && self.blocked().is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn ids(&self, predicate: impl Fn(&Status) -> bool) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| predicate(&e.status))
            .map(|e| e.id.as_str())
            .collect()
    }

    /// Renders the workflow as a Mermaid diagram, color-coded by status.
    ///
    /// * **Blue**: Skipped, outputs were fresh
    /// * **Green**: Ran and succeeded
    /// * **Red**: Ran and failed
    /// * **Orange**: Blocked by a failure upstream
    /// * **Grey**: Not reached
    pub fn render_mermaid(&self, workflow: &Workflow) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for (index, target) in workflow.targets().iter().enumerate() {
            let name = target.id().replace('"', "\\\"");
            let status = self.get(target.id()).unwrap_or(&NOT_REACHED);

            let extra = match self.entries.iter().find(|e| e.id == target.id()) {
                Some(Entry {
                    duration: Some(duration),
                    ..
                }) => format!("{duration:.2?}"),
                _ => status.label().to_string(),
            };

            writeln!(f, "    {index}[\"{name}\\n{extra}\"]").unwrap();
            writeln!(f, "    style {index} fill:{}", status.color()).unwrap();
        }

        for (source, target, path) in workflow.graph().edges() {
            writeln!(f, "    {source} -- \"{path}\" --> {target}").unwrap();
        }

        f
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.entries.iter().map(|e| e.id.len()).max().unwrap_or(0);

        for entry in &self.entries {
            let status = match &entry.status {
                Status::SkippedFresh => style(entry.status.to_string()).blue(),
                Status::RanSucceeded => style(entry.status.to_string()).green(),
                Status::RanFailed { .. } => style(entry.status.to_string()).red(),
                Status::BlockedByUpstreamFailure { .. } => style(entry.status.to_string()).yellow(),
                Status::NotReached => style(entry.status.to_string()).dim(),
            };
            writeln!(f, "{:<width$}  {status}", entry.id)?;
        }

        write!(
            f,
            "{} ran, {} failed, {} blocked, {} fresh ({:.2?})",
            self.ran().len(),
            self.failed().len(),
            self.blocked().len(),
            self.count(|s| *s == Status::SkippedFresh),
            self.elapsed
        )
    }
}
