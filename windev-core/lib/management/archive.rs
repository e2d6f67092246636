//! Appliance archive extraction.
//!
//! Virtual appliance exports (`.ova`) are plain tar archives bundling a
//! descriptor and one or more flat disk images. Only the disk image matters
//! here: the `.vmdk` member is pulled out next to the archive so the lineage
//! pipeline can convert it.

use std::fs::File;
use std::path::{Path, PathBuf};

use tar::Archive;

use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const VMDK_SUFFIX: &str = ".vmdk";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts the flat disk image from an appliance archive.
///
/// The last `.vmdk` member of the archive is unpacked into the archive's
/// directory and its path returned. Idempotent: an already extracted image
/// is reused without reading the archive body again.
pub fn extract_vmdk(archive_path: &Path) -> WindevResult<PathBuf> {
    let parent = archive_path.parent().unwrap_or(Path::new("."));

    let member = last_vmdk_member(archive_path)?;
    let target = parent.join(&member);

    if target.exists() {
        tracing::info!("reusing extracted image {}", target.display());
        return Ok(target);
    }

    let mut archive = Archive::new(File::open(archive_path)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()? == Path::new(&member) {
            entry.unpack(&target)?;
            tracing::info!(
                "extracted {} from {}",
                target.display(),
                archive_path.display()
            );
        }
    }

    Ok(target)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Name of the last `.vmdk` member in the archive.
fn last_vmdk_member(archive_path: &Path) -> WindevResult<String> {
    let mut archive = Archive::new(File::open(archive_path)?);
    let mut found = None;

    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if path.to_string_lossy().ends_with(VMDK_SUFFIX) {
            found = Some(path.to_string_lossy().into_owned());
        }
    }

    found.ok_or_else(|| WindevError::ArchiveMemberNotFound {
        archive: archive_path.to_path_buf(),
        wanted: VMDK_SUFFIX.to_string(),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
