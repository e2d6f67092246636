//! Artifact downloads.
//!
//! Streams large artifacts (appliance archives, guest tooling installers)
//! to disk without buffering them in memory. Downloads are idempotent at the
//! file level; an already present destination is never re-fetched.

use std::path::Path;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::WindevResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Mirror directory carrying the latest guest agent installer.
pub const DEFAULT_GUEST_AGENT_URL: &str =
    "https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/latest-qemu-ga/";

/// Mirror directory carrying the latest paravirtual driver bundle.
pub const DEFAULT_VIRTIO_ISO_URL: &str =
    "https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/latest-virtio/";

/// Guest agent installer file name under the mirror directory.
pub const GUEST_AGENT_INSTALLER: &str = "qemu-ga-x86_64.msi";

/// Driver bundle file name under the mirror directory.
pub const VIRTIO_ISO: &str = "virtio-win.iso";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Observer for download progress: bytes received so far, and the total
/// length when the server announced one.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams `url` to `dest`, reporting progress along the way.
///
/// An existing destination file is reused without touching the network.
pub async fn download_file(
    url: &str,
    dest: &Path,
    progress: Option<&ProgressFn>,
) -> WindevResult<()> {
    if dest.exists() {
        tracing::info!("reusing downloaded file {}", dest.display());
        return Ok(());
    }

    tracing::info!("downloading {url} to {}", dest.display());

    let response = reqwest::get(url).await?.error_for_status()?;
    let total = response.content_length();

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(progress) = progress {
            progress(received, total);
        }
    }

    file.flush().await?;
    tracing::info!("downloaded {received} byte(s) to {}", dest.display());
    Ok(())
}

/// URL of the guest agent installer under a mirror directory.
pub fn guest_agent_url(mirror: &str) -> String {
    join_mirror(mirror, GUEST_AGENT_INSTALLER)
}

/// URL of the driver bundle under a mirror directory.
pub fn virtio_iso_url(mirror: &str) -> String {
    join_mirror(mirror, VIRTIO_ISO)
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn join_mirror(mirror: &str, file: &str) -> String {
    format!("{}/{file}", mirror.trim_end_matches('/'))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_urls_join_without_double_slash() {
        assert_eq!(
            guest_agent_url("https://mirror.example/latest-qemu-ga/"),
            "https://mirror.example/latest-qemu-ga/qemu-ga-x86_64.msi"
        );
        assert_eq!(
            virtio_iso_url("https://mirror.example/latest-virtio"),
            "https://mirror.example/latest-virtio/virtio-win.iso"
        );
    }

    #[tokio::test]
    async fn test_download_skips_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("virtio-win.iso");
        std::fs::write(&dest, b"cached").unwrap();

        // The URL is unresolvable on purpose; reuse must short-circuit
        // before any network activity.
        download_file("http://invalid.invalid/virtio-win.iso", &dest, None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
    }
}
