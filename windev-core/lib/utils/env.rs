//! Utility functions for working with environment variables.

use std::path::PathBuf;

use crate::utils::path::{DEFAULT_MOUNT_POINT, DEFAULT_NBD_DEVICE};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable overriding the network-block-device slot.
pub const NBD_DEVICE_ENV_VAR: &str = "WINDEV_NBD_DEVICE";

/// Environment variable overriding the guest-partition mount point.
pub const MOUNT_POINT_ENV_VAR: &str = "WINDEV_MOUNT_POINT";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the block-device path used for attaching images.
/// If `WINDEV_NBD_DEVICE` is set, returns that path, otherwise the default.
pub fn get_nbd_device() -> String {
    std::env::var(NBD_DEVICE_ENV_VAR).unwrap_or_else(|_| DEFAULT_NBD_DEVICE.to_string())
}

/// Returns the host mount point for the guest system partition.
/// If `WINDEV_MOUNT_POINT` is set, returns that path, otherwise the default.
pub fn get_mount_point() -> PathBuf {
    std::env::var(MOUNT_POINT_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_MOUNT_POINT))
}
