//! Job execution inside a glidein slot

use crate::queue::{ClaimedJob, JobOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs one claimed job to completion
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// `side_dir` receives files that belong in the glidein's log bundle
    async fn execute(&self, job: &ClaimedJob, side_dir: &Path) -> Result<JobOutcome>;
}

/// Spawns the job's executable as a child process.
///
/// Stdout goes to the job's `output` file, resolved against `output_root`
/// when relative; stderr goes to `{side_dir}/{job}.err`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    output_root: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    fn output_path(&self, output: &str) -> PathBuf {
        let path = Path::new(output);
        match &self.output_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: &ClaimedJob, side_dir: &Path) -> Result<JobOutcome> {
        let stdout = match &job.spec.output {
            Some(output) => {
                let path = self.output_path(output);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("Failed to create output {}", path.display()))?;
                Stdio::from(file.into_std().await)
            }
            None => Stdio::null(),
        };
        let stderr_path = side_dir.join(format!("{}.err", job.id));
        let stderr = tokio::fs::File::create(&stderr_path)
            .await
            .with_context(|| format!("Failed to create {}", stderr_path.display()))?
            .into_std()
            .await;

        debug!(job = %job.id, executable = %job.spec.executable, "Spawning job");
        let status = Command::new(&job.spec.executable)
            .args(job.spec.argv())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await;

        Ok(match status {
            Ok(status) => match status.code() {
                Some(code) => JobOutcome::exited(code),
                None => JobOutcome::failed("terminated by signal"),
            },
            Err(e) => JobOutcome::failed(format!("failed to spawn {}: {e}", job.spec.executable)),
        })
    }
}
