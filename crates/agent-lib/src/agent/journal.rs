//! Per-glidein log directory
//!
//! Holds the `MasterLog` lifecycle journal plus per-job stderr files. The
//! whole directory becomes the log bundle at termination.

use crate::finalizer::MASTER_LOG;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the directory tree if needed
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.jobs_dir()).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory for job side files
    pub fn jobs_dir(&self) -> PathBuf {
        self.dir.join("jobs")
    }

    /// Append one timestamped line; write errors are logged, not raised
    pub async fn append(&self, line: &str) {
        let entry = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), line);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(MASTER_LOG))
                .await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(dir = %self.dir.display(), error = %e, "Failed to write MasterLog");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_lines() {
        let root = TempDir::new().unwrap();
        let journal = Journal::new(root.path().join("g-1"));
        journal.create().await.unwrap();
        journal.append("probing").await;
        journal.append("advertised").await;

        let content = std::fs::read_to_string(journal.dir().join(MASTER_LOG)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(" advertised"));
        assert!(journal.jobs_dir().is_dir());
    }
}
