//! Path and filename constants shared across the provisioning engine.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File extension of the pipeline's working image format.
pub const QCOW2_EXTENSION: &str = "qcow2";

/// File extension of the vendor appliance's flat disk image.
pub const VMDK_EXTENSION: &str = "vmdk";

/// Suffix appended to an image path to name its forensic catalog.
pub const CATALOG_DB_SUFFIX: &str = ".db";

/// The default network-block-device slot used for attaching images.
pub const DEFAULT_NBD_DEVICE: &str = "/dev/nbd0";

/// The default host mount point for the guest system partition.
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/win";

/// The guest autostart directory used to identify the system partition in
/// the forensic catalog. The trailing slash matches how the catalog stores
/// parent paths.
pub const STARTUP_DIR_PARENT_PATH: &str =
    "/ProgramData/Microsoft/Windows/Start Menu/Programs/Startup/";

/// The same autostart directory, relative to the mounted partition root.
pub const STARTUP_DIR_RELATIVE: &str =
    "ProgramData/Microsoft/Windows/Start Menu/Programs/Startup";

/// The SOFTWARE registry hive, relative to the mounted partition root.
pub const SOFTWARE_HIVE_RELATIVE: &str = "Windows/System32/config/SOFTWARE";

/// Directory-entry type of a directory in the forensic catalog's file table.
pub const CATALOG_DIR_TYPE: i64 = 3;

/// The `qemu-img` binary.
pub const QEMU_IMG_TOOL: &str = "qemu-img";

/// The `qemu-nbd` binary.
pub const QEMU_NBD_TOOL: &str = "qemu-nbd";

/// The `fdisk` binary, used for diagnostics only.
pub const FDISK_TOOL: &str = "fdisk";

/// The Sleuth Kit catalog builder.
pub const TSK_LOADDB_TOOL: &str = "tsk_loaddb";

/// The `mount` binary.
pub const MOUNT_TOOL: &str = "mount";

/// The `umount` binary.
pub const UMOUNT_TOOL: &str = "umount";

/// The hivex scripting shell used for offline registry edits.
pub const HIVEXSH_TOOL: &str = "hivexsh";

/// The libvirt CLI frontend.
pub const VIRSH_TOOL: &str = "virsh";

/// The libvirt connection URI for the system hypervisor.
pub const LIBVIRT_URI: &str = "qemu:///system";
