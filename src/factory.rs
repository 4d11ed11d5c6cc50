//! Stamping out the same sub-pipeline once per parameter record.
//!
//! A [`Factory`] is a pure function from a parameter record to a list of
//! [`Target`]s. It is invoked once per record by
//! [`Blueprint::instantiate`](crate::Blueprint::instantiate); the only thing
//! shared between invocations is the [`Namespace`] convention used to keep
//! ids and paths apart.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Target;

/// One record of the parameter source: a study, a sample, a chromosome...
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Namespace identifier, unique across the records of one instantiation.
    pub name: String,
    /// Source files this instance reads.
    #[serde(default)]
    pub sources: Vec<Utf8PathBuf>,
    /// Free-form extra arguments spliced into the rendered commands.
    #[serde(default)]
    pub extra: String,
}

impl Params {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn source(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    pub fn extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }
}

/// Anything that can name the instance it parameterizes.
pub trait Namespaced {
    fn namespace(&self) -> Namespace<'_>;
}

impl Namespaced for Params {
    fn namespace(&self) -> Namespace<'_> {
        Namespace::new(&self.name)
    }
}

/// The id and path convention for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace<'a> {
    name: &'a str,
}

impl<'a> Namespace<'a> {
    pub fn new(name: &'a str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    /// `compute_weights` becomes `compute_weights_s1`.
    pub fn id(&self, base: &str) -> String {
        format!("{base}_{}", self.name)
    }

    /// `files/sumstats` becomes `files/sumstats/s1`.
    pub fn dir(&self, root: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        root.as_ref().join(self.name)
    }
}

/// A pipeline factory.
///
/// Implemented for every `Fn(&P) -> anyhow::Result<Vec<Target>>`, so plain
/// functions and closures work directly.
pub trait Factory<P> {
    fn build(&self, params: &P) -> anyhow::Result<Vec<Target>>;
}

impl<P, F> Factory<P> for F
where
    F: Fn(&P) -> anyhow::Result<Vec<Target>>,
{
    fn build(&self, params: &P) -> anyhow::Result<Vec<Target>> {
        self(params)
    }
}

/// Immutable record of what one factory call registered, used to feed a
/// single aggregating target afterwards instead of accumulating state in
/// the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub namespace: String,
    pub targets: Vec<Registered>,
}

/// One target registered by a factory call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registered {
    pub id: String,
    pub outputs: Vec<Utf8PathBuf>,
}

impl Instance {
    pub(crate) fn new(namespace: &str, targets: &[Target]) -> Self {
        Self {
            namespace: namespace.to_string(),
            targets: targets
                .iter()
                .map(|t| Registered {
                    id: t.id().to_string(),
                    outputs: t.outputs().to_vec(),
                })
                .collect(),
        }
    }

    /// Every output registered by this instance.
    pub fn outputs(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.targets.iter().flat_map(|t| t.outputs.iter())
    }

    /// Outputs of the target with the given id, empty if there is none.
    pub fn outputs_of(&self, id: &str) -> &[Utf8PathBuf] {
        self.targets
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.outputs.as_slice())
            .unwrap_or_default()
    }
}
