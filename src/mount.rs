//! Filesystem mount seam for the node service.
//!
//! The service talks to a [`NodeMounter`] so tests can run without touching
//! real mounts; [`SystemMounter`] shells out to mount/umount/blkid/mkfs.

use std::sync::Arc;

use tonic::Status;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::device_connectivity::Executor;

/// Result type for mount operations.
pub type MountResult<T> = Result<T, Status>;

const MOUNT_TIMEOUT_MS: u64 = 60_000;
const BLKID_TIMEOUT_MS: u64 = 30_000;
const MKFS_TIMEOUT_MS: u64 = 300_000;

#[cfg_attr(test, automock)]
pub trait NodeMounter: Send + Sync {
    /// Mount `source` on `target`. An empty `fs_type` lets the kernel pick
    /// (used for bind mounts of block devices).
    fn mount(&self, source: &str, target: &str, fs_type: &str, options: &[String])
    -> MountResult<()>;

    /// Format the device if it carries no filesystem, then mount it.
    fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> MountResult<()>;

    fn unmount(&self, target: &str) -> MountResult<()>;

    /// The filesystem type on the device, or an empty string for a blank
    /// device.
    fn get_disk_format(&self, device: &str) -> MountResult<String>;
}

/// Production mounter driving the host's mount tooling.
pub struct SystemMounter {
    executor: Arc<dyn Executor>,
}

impl SystemMounter {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    fn format_device(&self, device: &str, fs_type: &str) -> MountResult<()> {
        info!(device = %device, fs_type = %fs_type, "formatting device");

        let (command, args) = match fs_type {
            "ext2" | "ext3" | "ext4" => (
                format!("mkfs.{fs_type}"),
                // -F so mkfs does not prompt on a whole-disk device
                vec!["-F".to_string(), device.to_string()],
            ),
            "xfs" => (
                "mkfs.xfs".to_string(),
                vec!["-f".to_string(), device.to_string()],
            ),
            other => (format!("mkfs.{other}"), vec![device.to_string()]),
        };

        let output = self
            .executor
            .execute_with_timeout(MKFS_TIMEOUT_MS, &command, &args)
            .map_err(|e| {
                error!(command = %command, error = %e, "failed to execute mkfs");
                Status::internal(format!("failed to execute {command}: {e}"))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(command = %command, stderr = %stderr, "mkfs failed");
            return Err(Status::internal(format!("{command} failed: {stderr}")));
        }
        Ok(())
    }
}

impl NodeMounter for SystemMounter {
    fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> MountResult<()> {
        info!(source = %source, target = %target, fs_type = %fs_type, ?options, "mounting");

        let mut args: Vec<String> = Vec::new();
        if !fs_type.is_empty() {
            args.push("-t".to_string());
            args.push(fs_type.to_string());
        }
        if !options.is_empty() {
            args.push("-o".to_string());
            args.push(options.join(","));
        }
        args.push(source.to_string());
        args.push(target.to_string());

        let output = self
            .executor
            .execute_with_timeout(MOUNT_TIMEOUT_MS, "mount", &args)
            .map_err(|e| {
                error!(error = %e, "failed to execute mount");
                Status::internal(format!("failed to execute mount: {e}"))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "mount failed");
            return Err(Status::internal(format!("mount failed: {stderr}")));
        }
        Ok(())
    }

    fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> MountResult<()> {
        let existing = self.get_disk_format(device)?;
        if existing.is_empty() {
            self.format_device(device, fs_type)?;
        } else {
            debug!(device = %device, format = %existing, "device already formatted");
        }
        self.mount(device, target, fs_type, options)
    }

    fn unmount(&self, target: &str) -> MountResult<()> {
        info!(target = %target, "unmounting");

        let args = vec![target.to_string()];
        let output = self
            .executor
            .execute_with_timeout(MOUNT_TIMEOUT_MS, "umount", &args)
            .map_err(|e| {
                error!(error = %e, "failed to execute umount");
                Status::internal(format!("failed to execute umount: {e}"))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target, "path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(Status::internal(format!("umount failed: {stderr}")));
        }
        Ok(())
    }

    fn get_disk_format(&self, device: &str) -> MountResult<String> {
        let args = vec!["-p".to_string(), device.to_string()];
        let output = self
            .executor
            .execute_with_timeout(BLKID_TIMEOUT_MS, "blkid", &args)
            .map_err(|e| {
                error!(error = %e, "failed to execute blkid");
                Status::internal(format!("failed to check device filesystem: {e}"))
            })?;

        // blkid exits non-zero when the device has no recognizable
        // signature, which is exactly the blank-device case.
        if !output.status.success() {
            debug!(device = %device, "no filesystem signature on device");
            return Ok(String::new());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_blkid_type(&stdout))
    }
}

/// Pull `TYPE="..."` out of `blkid -p` output.
fn parse_blkid_type(blkid_output: &str) -> String {
    for token in blkid_output.split_whitespace() {
        if let Some(value) = token.strip_prefix("TYPE=") {
            return value.trim_matches('"').to_string();
        }
    }
    String::new()
}
