//! Block-device attachment and mounting.
//!
//! Images are attached to a network-block-device slot with `qemu-nbd` so the
//! forensic indexer and the mount can see a real block device. The design
//! assumes exactly one slot in use at a time; attach, index/mount, and detach
//! for a given device path must be strictly sequential. All failures here are
//! fatal: a dangling attachment or a silently ignored unmount would corrupt
//! every subsequent step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::management::lineage::path_arg;
use crate::process::ProcessRunner;
use crate::utils::path::{FDISK_TOOL, MOUNT_TOOL, QEMU_NBD_TOOL, UMOUNT_TOOL};
use crate::WindevResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A network-block-device slot that images can be attached to.
#[derive(Clone)]
pub struct NbdDevice {
    runner: Arc<dyn ProcessRunner>,
    device: String,
}

/// Mounts partition devices at a fixed host mount point.
#[derive(Clone)]
pub struct Mounter {
    runner: Arc<dyn ProcessRunner>,
    mount_point: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NbdDevice {
    /// Creates a handle for the given device slot, e.g. `/dev/nbd0`.
    pub fn new(runner: Arc<dyn ProcessRunner>, device: impl Into<String>) -> Self {
        Self {
            runner,
            device: device.into(),
        }
    }

    /// The device path of this slot.
    pub fn path(&self) -> &str {
        &self.device
    }

    /// Attaches an image to this slot.
    pub async fn attach(&self, image: &Path) -> WindevResult<()> {
        let connect_arg = format!("--connect={}", self.device);
        let image_str = path_arg(image)?;
        self.runner
            .run_checked(QEMU_NBD_TOOL, &[&connect_arg, &image_str])
            .await?;
        tracing::info!("attached {} at {}", image.display(), self.device);
        Ok(())
    }

    /// Detaches whatever is attached to this slot.
    pub async fn detach(&self) -> WindevResult<()> {
        self.runner
            .run_checked(QEMU_NBD_TOOL, &["--disconnect", &self.device])
            .await?;
        tracing::info!("detached {}", self.device);
        Ok(())
    }

    /// Logs the partition table of the attached image. Diagnostic only.
    pub async fn dump_partition_table(&self) -> WindevResult<()> {
        let output = self
            .runner
            .run_checked(FDISK_TOOL, &["-l", &self.device])
            .await?;
        tracing::info!("partition table of {}:\n{}", self.device, output.stdout_utf8());
        Ok(())
    }
}

impl Mounter {
    /// Creates a mounter targeting the given host mount point.
    pub fn new(runner: Arc<dyn ProcessRunner>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_point: mount_point.into(),
        }
    }

    /// The host mount point.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Mounts a partition device at the mount point, creating the mount
    /// point directory if absent.
    pub async fn mount(&self, partition_device: &str) -> WindevResult<()> {
        if !self.mount_point.exists() {
            tokio::fs::create_dir_all(&self.mount_point).await?;
        }

        let mount_point_str = path_arg(&self.mount_point)?;
        self.runner
            .run_checked(MOUNT_TOOL, &[partition_device, &mount_point_str])
            .await?;
        tracing::info!("mounted {} at {}", partition_device, self.mount_point.display());
        Ok(())
    }

    /// Unmounts a partition device. The caller must unmount before
    /// detaching, always, including on the error path: a held device blocks
    /// every later attach.
    pub async fn unmount(&self, partition_device: &str) -> WindevResult<()> {
        self.runner
            .run_checked(UMOUNT_TOOL, &[partition_device])
            .await?;
        tracing::info!("unmounted {}", partition_device);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
