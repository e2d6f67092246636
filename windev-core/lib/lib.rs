//! `windev` provisions a customized Windows development VM image from a
//! vendor-supplied evaluation appliance, then clones disposable instances
//! from it.
//!
//! # Overview
//!
//! windev drives a small fleet of external tools (qemu-img, qemu-nbd,
//! The Sleuth Kit, hivex, libvirt/virsh) to turn a flat appliance disk into a
//! reusable template image:
//!
//! - Disk-image lineage: format conversion and copy-on-write backing chains
//! - Forensic partition lookup: locating the guest's autostart directory
//!   inside an unmounted disk image
//! - Offline customization: registry policy patches applied to the mounted
//!   guest filesystem
//! - Guest command execution: issuing commands through the QEMU guest agent
//!   and collecting their output while the guest may still be booting
//!
//! # Modules
//!
//! - [`management`] - Image lineage, partition catalog, device attach/mount,
//!   registry patching, descriptor rendering, guest channel, orchestration
//! - [`process`] - Narrow external-process execution boundary
//! - [`utils`] - Path constants and environment helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod management;
pub mod process;
pub mod utils;

pub use error::*;
