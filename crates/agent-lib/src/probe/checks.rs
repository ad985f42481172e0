//! Built-in capability checks
//!
//! Each check answers one yes/no question about the host. Returning `Err`
//! means the answer could not be determined, which is not the same as `false`.

use super::CapabilityCheck;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::net::TcpStream;

/// True when any of the listed device files exists (e.g. `/dev/nvidia0`)
#[derive(Debug, Clone)]
pub struct DeviceFileCheck {
    paths: Vec<PathBuf>,
}

impl DeviceFileCheck {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CapabilityCheck for DeviceFileCheck {
    async fn check(&self) -> Result<bool> {
        for path in &self.paths {
            let exists = tokio::fs::try_exists(path)
                .await
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            if exists {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// True when a filesystem is mounted at `mount_point`.
///
/// Autofs-managed repositories (CVMFS) only show up in the mount table after
/// first access, so a listable non-empty directory also counts.
#[derive(Debug, Clone)]
pub struct MountCheck {
    mount_point: PathBuf,
    mount_table: PathBuf,
}

impl MountCheck {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            mount_table: PathBuf::from("/proc/mounts"),
        }
    }

    pub fn with_mount_table(mut self, mount_table: impl Into<PathBuf>) -> Self {
        self.mount_table = mount_table.into();
        self
    }

    fn listed_in(&self, table: &str) -> bool {
        let wanted = self.mount_point.to_string_lossy();
        table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|target| target == wanted)
    }

    async fn directory_populated(&self) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(&self.mount_point).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.mount_point.display()))
            }
        };
        Ok(entries.next_entry().await?.is_some())
    }
}

#[async_trait]
impl CapabilityCheck for MountCheck {
    async fn check(&self) -> Result<bool> {
        let table = tokio::fs::read_to_string(&self.mount_table)
            .await
            .with_context(|| format!("Failed to read {}", self.mount_table.display()))?;

        if self.listed_in(&table) {
            return Ok(true);
        }
        self.directory_populated().await
    }
}

/// True when a TCP connection to `address` can be established (e.g. GridFTP)
#[derive(Debug, Clone)]
pub struct TcpEndpointCheck {
    address: String,
}

impl TcpEndpointCheck {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl CapabilityCheck for TcpEndpointCheck {
    async fn check(&self) -> Result<bool> {
        match TcpStream::connect(&self.address).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to reach {}", self.address)),
        }
    }
}

/// Fixed answer, for capabilities asserted by site configuration
#[derive(Debug, Clone, Copy)]
pub struct StaticCheck(pub bool);

#[async_trait]
impl CapabilityCheck for StaticCheck {
    async fn check(&self) -> Result<bool> {
        Ok(self.0)
    }
}
