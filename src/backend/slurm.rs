use std::fmt::Write;
use std::fs;
use std::process::Command;

use camino::Utf8PathBuf;

use super::local::resolve;
use super::{Backend, Job, Outcome};

/// Submits each target to a Slurm cluster and waits for it to finish.
///
/// For every job a batch script is written to `<script_dir>/<id>.sh`, with
/// the resource hints turned into `#SBATCH` directives, and handed to
/// `sbatch --wait`.
#[derive(Debug, Clone)]
pub struct Slurm {
    sbatch: String,
    script_dir: Utf8PathBuf,
    log_dir: Utf8PathBuf,
    extra: Vec<String>,
}

impl Default for Slurm {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".into(),
            script_dir: ".kiln/jobs".into(),
            log_dir: ".kiln/logs".into(),
            extra: Vec::new(),
        }
    }
}

impl Slurm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path to the `sbatch` executable.
    pub fn sbatch(mut self, program: impl Into<String>) -> Self {
        self.sbatch = program.into();
        self
    }

    pub fn script_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    pub fn log_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Extra arguments passed to every `sbatch` call, e.g. `--qos=short`.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra.push(arg.into());
        self
    }

    /// Renders the batch script submitted for `job`.
    pub fn render_script(&self, job: &Job<'_>) -> String {
        let res = job.resources;
        let logs = resolve(job.workdir, &self.log_dir);
        let mut script = String::from("#!/bin/bash\n");

        writeln!(script, "#SBATCH --job-name={}", job.id).unwrap();
        if let Some(account) = &res.account {
            writeln!(script, "#SBATCH --account={account}").unwrap();
        }
        if let Some(queue) = &res.queue {
            writeln!(script, "#SBATCH --partition={queue}").unwrap();
        }
        if let Some(memory) = res.memory {
            writeln!(script, "#SBATCH --mem={memory}").unwrap();
        }
        if let Some(cores) = res.cores {
            writeln!(script, "#SBATCH --cpus-per-task={cores}").unwrap();
        }
        if let Some(walltime) = res.walltime {
            writeln!(script, "#SBATCH --time={walltime}").unwrap();
        }
        writeln!(script, "#SBATCH --output={logs}/{}.stdout", job.id).unwrap();
        writeln!(script, "#SBATCH --error={logs}/{}.stderr", job.id).unwrap();

        writeln!(script).unwrap();
        writeln!(script, "set -e").unwrap();
        writeln!(script, "export KILN_TARGET={}", quote(job.id)).unwrap();
        writeln!(script, "cd {}", quote(job.workdir.as_str())).unwrap();
        writeln!(script).unwrap();
        script.push_str(job.command.trim_end());
        script.push('\n');

        script
    }
}

/// Single-quotes a word for `sh`.
fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

impl Backend for Slurm {
    fn name(&self) -> &str {
        "slurm"
    }

    fn submit(&self, job: &Job<'_>) -> Outcome {
        let scripts = resolve(job.workdir, &self.script_dir);
        let logs = resolve(job.workdir, &self.log_dir);
        let path = scripts.join(format!("{}.sh", job.id));

        let written = fs::create_dir_all(&scripts)
            .and_then(|_| fs::create_dir_all(&logs))
            .and_then(|_| fs::write(&path, self.render_script(job)));

        if let Err(e) = written {
            return Outcome::submission_error(format!("cannot write job script '{path}': {e}"));
        }

        let output = Command::new(&self.sbatch)
            .args(["--parsable", "--wait"])
            .args(&self.extra)
            .arg(&path)
            .current_dir(job.workdir)
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Outcome::submission_error(format!("cannot run '{}': {e}", self.sbatch));
            }
        };

        let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if job_id.is_empty() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Outcome::submission_error(stderr.trim().to_string());
        }

        tracing::debug!(id = job.id, %job_id, "slurm job finished");
        Outcome::from_status(output.status)
    }
}
