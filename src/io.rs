//! File system access: timestamp probing, output directories and cleanup.

use std::fmt::Display;
use std::fs;
use std::io;
use std::time::{Instant, SystemTime};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Source of file existence and modification times.
///
/// Every query goes to the underlying store; nothing is remembered between
/// runs, so freshness is always recomputed from the current state.
pub trait FileProbe: Send + Sync {
    /// Returns the last modification time of a regular file, or `None` when
    /// there is no such file. Directories count as missing.
    fn modified(&self, path: &Utf8Path) -> io::Result<Option<SystemTime>>;
}

/// Probes the real file system, resolving relative paths against `root`.
#[derive(Debug, Clone)]
pub struct Disk {
    root: Utf8PathBuf,
}

impl Disk {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Default for Disk {
    fn default() -> Self {
        Self::new(".")
    }
}

impl FileProbe for Disk {
    fn modified(&self, path: &Utf8Path) -> io::Result<Option<SystemTime>> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) if meta.is_dir() => Ok(None),
            Ok(meta) => meta.modified().map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Creates the parent directory of every path. Idempotent.
pub(crate) fn ensure_parent_dirs<'a>(
    disk: &Disk,
    paths: impl IntoIterator<Item = &'a Utf8PathBuf>,
) -> io::Result<()> {
    for path in paths {
        if let Some(parent) = disk.resolve(path).parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Removes a file, returns whether anything was deleted.
pub(crate) fn remove_file(disk: &Disk, path: &Utf8Path) -> io::Result<bool> {
    match fs::remove_file(disk.resolve(path)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Normalize a path, removing things like `.`, `..` and repeated separators,
/// so that two spellings of the same file link the same targets.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) || ret.as_str().is_empty() {
                    ret.push(Utf8Component::ParentDir);
                } else if !ret.pop() && !ret.has_root() {
                    ret.push(Utf8Component::ParentDir);
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    use camino::{Utf8Path, Utf8PathBuf};

    use super::FileProbe;

    /// In-memory file table with synthetic timestamps.
    #[derive(Default)]
    pub(crate) struct MemoryFs {
        files: Mutex<HashMap<Utf8PathBuf, SystemTime>>,
    }

    impl MemoryFs {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Sets the file's mtime to `secs` after the epoch.
        pub(crate) fn touch(&self, path: &str, secs: u64) {
            let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
            self.files.lock().unwrap().insert(path.into(), time);
        }

        pub(crate) fn remove(&self, path: &str) {
            self.files.lock().unwrap().remove(Utf8Path::new(path));
        }
    }

    impl FileProbe for MemoryFs {
        fn modified(&self, path: &Utf8Path) -> io::Result<Option<SystemTime>> {
            Ok(self.files.lock().unwrap().get(path).copied())
        }
    }
}
