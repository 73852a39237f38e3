//! Access to the machine the agent runs on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{Error, Result};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Host: Send + Sync {
    /// When the host last booted.
    async fn boot_time(&self) -> Result<DateTime<Utc>>;

    async fn reboot(&self) -> Result<()>;
}

pub struct SystemHost {
    uptime_path: String,
    reboot_command: String,
}

impl SystemHost {
    pub fn new(
        uptime_path: impl Into<String>,
        reboot_command: impl Into<String>,
    ) -> Self {
        Self {
            uptime_path: uptime_path.into(),
            reboot_command: reboot_command.into(),
        }
    }
}

/// Parses the first field of `/proc/uptime`, seconds since boot.
pub fn parse_uptime(raw: &str) -> Result<Duration> {
    raw.split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| Error::MalformedUptime(raw.trim().to_string()))
}

#[async_trait]
impl Host for SystemHost {
    async fn boot_time(&self) -> Result<DateTime<Utc>> {
        let raw = tokio::fs::read_to_string(&self.uptime_path)
            .await
            .map_err(|source| Error::Uptime {
                path: self.uptime_path.clone(),
                source,
            })?;
        let uptime = parse_uptime(&raw)?;
        let uptime = chrono::Duration::from_std(uptime)
            .map_err(|_| Error::MalformedUptime(raw.trim().to_string()))?;
        Ok(Utc::now() - uptime)
    }

    async fn reboot(&self) -> Result<()> {
        let failed = |reason: String| Error::RebootCommand {
            command: self.reboot_command.clone(),
            reason,
        };
        let mut parts = self.reboot_command.split_whitespace();
        let program = parts.next().ok_or_else(|| failed("empty".into()))?;

        info!(command = %self.reboot_command, "rebooting host");
        let status = Command::new(program)
            .args(parts)
            .status()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !status.success() {
            warn!(%status, "reboot command exited unsuccessfully");
            return Err(failed(status.to_string()));
        }
        Ok(())
    }
}
