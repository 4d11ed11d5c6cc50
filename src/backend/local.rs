use std::fs::{self, File};
use std::io;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};

use super::{Backend, Job, Outcome, resource_env};

/// Runs each command as a child process on this machine.
///
/// Resource hints are not enforced, only exported to the command's
/// environment. Standard output and error go to `<log_dir>/<id>.stdout` and
/// `<log_dir>/<id>.stderr` below the working directory.
#[derive(Debug, Clone)]
pub struct Local {
    shell: String,
    log_dir: Option<Utf8PathBuf>,
}

impl Default for Local {
    fn default() -> Self {
        Self {
            shell: "sh".into(),
            log_dir: Some(".kiln/logs".into()),
        }
    }
}

impl Local {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn log_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Discard the output of commands.
    pub fn without_logs(mut self) -> Self {
        self.log_dir = None;
        self
    }

    fn open_logs(&self, job: &Job<'_>) -> io::Result<(Stdio, Stdio)> {
        let Some(dir) = &self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };

        let dir = resolve(job.workdir, dir);
        fs::create_dir_all(&dir)?;

        let stdout = File::create(dir.join(format!("{}.stdout", job.id)))?;
        let stderr = File::create(dir.join(format!("{}.stderr", job.id)))?;
        Ok((stdout.into(), stderr.into()))
    }
}

impl Backend for Local {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, job: &Job<'_>) -> Outcome {
        let (stdout, stderr) = match self.open_logs(job) {
            Ok(logs) => logs,
            Err(e) => return Outcome::submission_error(format!("cannot open log files: {e}")),
        };

        let status = Command::new(&self.shell)
            .arg("-c")
            .arg(job.command)
            .current_dir(job.workdir)
            .envs(resource_env(job))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status();

        match status {
            Ok(status) => Outcome::from_status(status),
            Err(e) => Outcome::submission_error(format!("cannot spawn '{}': {e}", self.shell)),
        }
    }
}

pub(super) fn resolve(workdir: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Exit;
    use crate::core::Resources;

    fn job<'a>(id: &'a str, command: &'a str, workdir: &'a Utf8Path, res: &'a Resources) -> Job<'a> {
        Job {
            id,
            command,
            resources: res,
            workdir,
        }
    }

    #[test]
    fn test_success_writes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let resources = Resources::default();

        let outcome = Local::new().submit(&job("hello", "echo hi; echo $KILN_TARGET > who.txt", &root, &resources));

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(fs::read_to_string(root.join(".kiln/logs/hello.stdout")).unwrap(), "hi\n");
        assert_eq!(fs::read_to_string(root.join("who.txt")).unwrap(), "hello\n");
    }

    #[test]
    fn test_exit_code_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let resources = Resources::default();

        let outcome = Local::new()
            .without_logs()
            .submit(&job("bad", "exit 3", &root, &resources));

        assert_eq!(outcome, Outcome::Failed { exit: Exit::Code(3) });
    }

    #[test]
    fn test_missing_shell_is_submission_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let resources = Resources::default();

        let outcome = Local::new()
            .shell("/definitely/not/a/shell")
            .without_logs()
            .submit(&job("x", "true", &root, &resources));

        assert!(matches!(outcome, Outcome::SubmissionError { .. }));
    }
}
