use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::Target;
use crate::graph::DependencyGraph;
use crate::io::FileProbe;

/// Why a target has to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    /// A declared output does not exist.
    MissingOutput { path: Utf8PathBuf },
    /// The oldest output is older than the newest input.
    InputNewer {
        input: Utf8PathBuf,
        output: Utf8PathBuf,
    },
    /// An upstream producer is going to run, so the inputs are about to change.
    UpstreamStale { upstream: String },
    /// Sinks have nothing to compare against and always run.
    NoOutputs,
}

impl Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::MissingOutput { path } => write!(f, "output '{path}' is missing"),
            StaleReason::InputNewer { input, output } => {
                write!(f, "input '{input}' is newer than output '{output}'")
            }
            StaleReason::UpstreamStale { upstream } => write!(f, "upstream '{upstream}' will run"),
            StaleReason::NoOutputs => write!(f, "target has no outputs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale(_))
    }
}

/// Decides, target by target, whether outputs are up to date.
///
/// File timestamps are queried lazily and remembered only for the lifetime
/// of one evaluator, which lives for a single planning pass.
pub(crate) struct Evaluator<'a> {
    targets: &'a [Target],
    graph: &'a DependencyGraph,
    probe: &'a dyn FileProbe,
    seen: HashMap<&'a Utf8Path, Option<SystemTime>>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        targets: &'a [Target],
        graph: &'a DependencyGraph,
        probe: &'a dyn FileProbe,
    ) -> Self {
        Self {
            targets,
            graph,
            probe,
            seen: HashMap::new(),
        }
    }

    pub(crate) fn mtime(&mut self, path: &'a Utf8Path) -> io::Result<Option<SystemTime>> {
        if let Some(time) = self.seen.get(path) {
            return Ok(*time);
        }
        let time = self.probe.modified(path)?;
        self.seen.insert(path, time);
        Ok(time)
    }

    /// Checks a target's own files: missing outputs first, then outputs
    /// older than inputs.
    fn direct(&mut self, index: usize) -> io::Result<Option<StaleReason>> {
        let targets = self.targets;
        let target = &targets[index];

        let mut oldest: Option<(SystemTime, &'a Utf8Path)> = None;
        for path in target.outputs() {
            match self.mtime(path)? {
                None => return Ok(Some(StaleReason::MissingOutput { path: path.clone() })),
                Some(time) => {
                    if oldest.is_none_or(|(t, _)| time < t) {
                        oldest = Some((time, path.as_path()));
                    }
                }
            }
        }

        let Some((out_time, out_path)) = oldest else {
            return Ok(None);
        };

        let mut newest: Option<(SystemTime, &'a Utf8Path)> = None;
        for path in target.inputs() {
            if let Some(time) = self.mtime(path)?
                && newest.is_none_or(|(t, _)| time > t)
            {
                newest = Some((time, path.as_path()));
            }
        }

        match newest {
            Some((in_time, in_path)) if out_time < in_time => Ok(Some(StaleReason::InputNewer {
                input: in_path.to_path_buf(),
                output: out_path.to_path_buf(),
            })),
            _ => Ok(None),
        }
    }

    /// Evaluates every target in `scope` in topological order. The scope must
    /// be closed under dependencies.
    pub(crate) fn evaluate(
        &mut self,
        scope: &BTreeSet<usize>,
    ) -> io::Result<BTreeMap<usize, Freshness>> {
        let mut result: BTreeMap<usize, Freshness> = BTreeMap::new();

        for &index in self.graph.topological() {
            if !scope.contains(&index) {
                continue;
            }

            let freshness = if let Some(reason) = self.direct(index)? {
                Freshness::Stale(reason)
            } else if let Some(upstream) = self
                .graph
                .dependencies(index)
                .into_iter()
                .find(|dep| result.get(dep).is_some_and(Freshness::is_stale))
            {
                Freshness::Stale(StaleReason::UpstreamStale {
                    upstream: self.targets[upstream].id().to_string(),
                })
            } else if self.targets[index].is_sink() {
                Freshness::Stale(StaleReason::NoOutputs)
            } else {
                Freshness::Fresh
            };

            tracing::debug!(id = self.targets[index].id(), ?freshness, "evaluated");
            result.insert(index, freshness);
        }

        Ok(result)
    }
}
