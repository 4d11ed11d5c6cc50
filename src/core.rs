//! The data model: [`Target`] definitions and their advisory [`Resources`].

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::{ConfigError, ResourceError};
use crate::io::normalize_path;

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// A memory ceiling in bytes.
///
/// Parsed from the shorthand commonly found in workflow definitions, e.g.
/// `"64g"`, `"512MB"` or `"2t"`. Units are binary (`1g` is 1024³ bytes), plain
/// numbers are bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Memory(u64);

impl Memory {
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    pub fn as_bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for Memory {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_lowercase();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);

        let amount: u64 = digits
            .parse()
            .map_err(|_| ResourceError::Memory(s.to_string()))?;

        let scale = match unit.trim() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            "t" | "tb" | "tib" => TIB,
            _ => return Err(ResourceError::Memory(s.to_string())),
        };

        amount
            .checked_mul(scale)
            .map(Memory)
            .ok_or_else(|| ResourceError::Memory(s.to_string()))
    }
}

/// Scheduler notation, the largest unit that divides the amount exactly.
/// Amounts that are not a whole number of KiB are rounded up.
impl Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        match bytes {
            0 => write!(f, "0"),
            b if b % TIB == 0 => write!(f, "{}T", b / TIB),
            b if b % GIB == 0 => write!(f, "{}G", b / GIB),
            b if b % MIB == 0 => write!(f, "{}M", b / MIB),
            b => write!(f, "{}K", b.div_ceil(KIB)),
        }
    }
}

/// A wall-clock limit, written as `[D-]HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Walltime(u64);

impl Walltime {
    pub const fn seconds(secs: u64) -> Self {
        Self(secs)
    }

    pub const fn hours(hours: u64) -> Self {
        Self(hours * 3600)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl FromStr for Walltime {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || ResourceError::Walltime(s.to_string());
        let text = s.trim();

        let (days, clock) = match text.split_once('-') {
            Some((days, clock)) => (days.parse::<u64>().map_err(|_| error())?, clock),
            None => (0, text),
        };

        let parts = clock
            .split(':')
            .map(|part| part.parse::<u64>().map_err(|_| error()))
            .collect::<Result<Vec<_>, _>>()?;

        let (h, m, s) = match parts.as_slice() {
            [m] => (0, *m, 0),
            [m, s] => (0, *m, *s),
            [h, m, s] => (*h, *m, *s),
            _ => return Err(error()),
        };

        if parts.len() > 1 && (m >= 60 || s >= 60) {
            return Err(error());
        }

        days.checked_mul(86_400)
            .zip(h.checked_mul(3600))
            .zip(m.checked_mul(60))
            .and_then(|((d, h), m)| d.checked_add(h)?.checked_add(m)?.checked_add(s))
            .map(Walltime)
            .ok_or_else(error)
    }
}

impl Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.0 / 86_400;
        let h = (self.0 % 86_400) / 3600;
        let m = (self.0 % 3600) / 60;
        let s = self.0 % 60;

        if days > 0 {
            write!(f, "{days}-{h:02}:{m:02}:{s:02}")
        } else {
            write!(f, "{h:02}:{m:02}:{s:02}")
        }
    }
}

/// Advisory resource hints handed to the submission backend as-is. The engine
/// itself never looks at them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub memory: Option<Memory>,
    pub cores: Option<u32>,
    pub walltime: Option<Walltime>,
    pub account: Option<String>,
    pub queue: Option<String>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        *self == Resources::default()
    }

    /// Fills every unset hint from `defaults`. Values already present win.
    pub fn with_defaults(mut self, defaults: &Resources) -> Self {
        self.memory = self.memory.or(defaults.memory);
        self.cores = self.cores.or(defaults.cores);
        self.walltime = self.walltime.or(defaults.walltime);
        self.account = self.account.or_else(|| defaults.account.clone());
        self.queue = self.queue.or_else(|| defaults.queue.clone());
        self
    }
}

/// A single step of a workflow: a fully rendered shell command, the files it
/// reads and the files it promises to write.
///
/// Targets are immutable once built. Dependencies are never declared
/// directly; a target depends on another when one of its inputs is an output
/// of the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    id: String,
    command: String,
    inputs: Vec<Utf8PathBuf>,
    outputs: Vec<Utf8PathBuf>,
    resources: Resources,
}

impl Target {
    /// Starts the definition of a new target.
    pub fn new(id: impl Into<String>) -> TargetDef {
        TargetDef {
            id: id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: Resources::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn inputs(&self) -> &[Utf8PathBuf] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.outputs
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// A sink consumes files but produces nothing that is tracked.
    pub fn is_sink(&self) -> bool {
        self.outputs.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyId);
        }
        // ids name log and job script files
        if self.id.contains(['/', '\\', '\0']) || self.id == "." || self.id == ".." {
            return Err(ConfigError::InvalidId(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn apply_defaults(mut self, defaults: &Resources) -> Self {
        self.resources = self.resources.with_defaults(defaults);
        self
    }
}

/// Builder returned by [`Target::new`].
#[derive(Debug, Clone)]
pub struct TargetDef {
    id: String,
    inputs: Vec<Utf8PathBuf>,
    outputs: Vec<Utf8PathBuf>,
    resources: Resources,
}

impl TargetDef {
    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn inputs<P>(mut self, paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<Utf8PathBuf>,
    {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn outputs<P>(mut self, paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<Utf8PathBuf>,
    {
        self.outputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn memory(mut self, memory: Memory) -> Self {
        self.resources.memory = Some(memory);
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.resources.cores = Some(cores);
        self
    }

    pub fn walltime(mut self, walltime: Walltime) -> Self {
        self.resources.walltime = Some(walltime);
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.resources.account = Some(account.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.resources.queue = Some(queue.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Finishes the definition with the command to execute.
    pub fn run(self, command: impl Into<String>) -> Target {
        let inputs = self.inputs.iter().map(|p| normalize_path(p)).collect();

        let mut outputs: Vec<Utf8PathBuf> = Vec::with_capacity(self.outputs.len());
        for path in &self.outputs {
            let path = normalize_path(path);
            if !outputs.contains(&path) {
                outputs.push(path);
            }
        }

        Target {
            id: self.id,
            command: command.into(),
            inputs,
            outputs,
            resources: self.resources,
        }
    }
}

/// Knobs for a single invocation of the workflow.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory that relative target paths are resolved against and that
    /// commands run in.
    pub workdir: Utf8PathBuf,
    /// Glob patterns over target ids. Empty selects everything.
    pub select: Vec<String>,
    /// Submit the targets of a batch concurrently.
    pub parallel: bool,
    /// Plan and report, submit nothing.
    pub dry_run: bool,
    /// Create the parent directories of outputs before submission.
    pub create_dirs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workdir: ".".into(),
            select: Vec::new(),
            parallel: true,
            dry_run: false,
            create_dirs: true,
        }
    }
}

impl Options {
    pub fn new(workdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..Default::default()
        }
    }

    pub fn select(mut self, pattern: impl Into<String>) -> Self {
        self.select.push(pattern.into());
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_parse() {
        assert_eq!("64g".parse::<Memory>().unwrap(), Memory::gib(64));
        assert_eq!("64GB".parse::<Memory>().unwrap(), Memory::gib(64));
        assert_eq!("512m".parse::<Memory>().unwrap(), Memory::mib(512));
        assert_eq!(" 2t ".parse::<Memory>().unwrap(), Memory::gib(2048));
        assert_eq!("100".parse::<Memory>().unwrap(), Memory::bytes(100));

        assert!("g".parse::<Memory>().is_err());
        assert!("64x".parse::<Memory>().is_err());
        assert!("".parse::<Memory>().is_err());
    }

    #[test]
    fn test_memory_display() {
        assert_eq!(Memory::gib(64).to_string(), "64G");
        assert_eq!(Memory::mib(1536).to_string(), "1536M");
        assert_eq!(Memory::gib(1024).to_string(), "1T");
        assert_eq!(Memory::bytes(1000).to_string(), "1K");
    }

    #[test]
    fn test_walltime_parse() {
        assert_eq!(
            "24:00:00".parse::<Walltime>().unwrap(),
            Walltime::hours(24)
        );
        assert_eq!(
            "1-02:00:30".parse::<Walltime>().unwrap(),
            Walltime::seconds(86_400 + 7200 + 30)
        );
        assert_eq!("90".parse::<Walltime>().unwrap(), Walltime::seconds(5400));
        assert_eq!("05:10".parse::<Walltime>().unwrap(), Walltime::seconds(310));

        assert!("12:61:00".parse::<Walltime>().is_err());
        assert!("1:2:3:4".parse::<Walltime>().is_err());
        assert!("soon".parse::<Walltime>().is_err());
        assert!("999999999999999-00:00:00".parse::<Walltime>().is_err());
        assert!("9999999999999999:00:00".parse::<Walltime>().is_err());
    }

    #[test]
    fn test_walltime_display() {
        assert_eq!(Walltime::hours(24).to_string(), "24:00:00");
        assert_eq!(Walltime::seconds(86_400 + 61).to_string(), "1-00:01:01");
    }

    #[test]
    fn test_resources_defaults() {
        let defaults = Resources {
            account: Some("project".into()),
            memory: Some(Memory::gib(4)),
            ..Default::default()
        };

        let merged = Resources {
            memory: Some(Memory::gib(64)),
            ..Default::default()
        }
        .with_defaults(&defaults);

        assert_eq!(merged.memory, Some(Memory::gib(64)));
        assert_eq!(merged.account.as_deref(), Some("project"));
        assert_eq!(merged.cores, None);
    }

    #[test]
    fn test_target_builder() {
        let target = Target::new("calc_tagging")
            .inputs(["ref/ref.bed", "ref/ref.bim"])
            .outputs(["out/./tagging", "out/tagging", "out//matrix"])
            .memory(Memory::gib(64))
            .cores(8)
            .run("ldak --calc-tagging out");

        assert_eq!(target.id(), "calc_tagging");
        assert_eq!(target.inputs().len(), 2);
        assert_eq!(
            target.outputs(),
            &[Utf8PathBuf::from("out/tagging"), Utf8PathBuf::from("out/matrix")]
        );
        assert_eq!(target.resources().cores, Some(8));
        assert!(!target.is_sink());
    }

    #[test]
    fn test_empty_id_rejected() {
        let target = Target::new("  ").run("true");
        assert_eq!(target.validate(), Err(ConfigError::EmptyId));
    }

    #[test]
    fn test_path_like_id_rejected() {
        for id in ["a/b", "../escape", "..", "win\\dir"] {
            let target = Target::new(id).run("true");
            assert_eq!(target.validate(), Err(ConfigError::InvalidId(id.into())));
        }
        assert!(Target::new("calc.tagging").run("true").validate().is_ok());
    }
}
