//! Disk-image lineage management.
//!
//! This module turns the vendor's flat disk image into the pipeline's working
//! qcow2 format and derives copy-on-write children from it. Artifacts form a
//! parent-pointer chain: a child starts empty and all reads fall through to
//! its backing parent until blocks are written. The chain is tracked in an
//! arena keyed by path so that no artifact with registered descendants can be
//! dropped out from under them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process::ProcessRunner;
use crate::utils::path::{QEMU_IMG_TOOL, QCOW2_EXTENSION, VMDK_EXTENSION};
use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix of the line in `qemu-img info` output naming the backing file.
const BACKING_FILE_PREFIX: &str = "backing file:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// On-disk format of an image artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat raw image.
    Raw,
    /// VMware flat disk image, the vendor appliance format.
    Vmdk,
    /// The pipeline's working copy-on-write format.
    Qcow2,
}

impl ImageFormat {
    /// The format name as the external tools spell it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Vmdk => VMDK_EXTENSION,
            ImageFormat::Qcow2 => QCOW2_EXTENSION,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disk image tracked by the lineage manager.
///
/// The backing parent is a weak reference by path; the parent artifact is
/// looked up in the [`ImageStore`] arena, never owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    /// Location of the image on storage.
    pub path: PathBuf,

    /// On-disk format.
    pub format: ImageFormat,

    /// Path of the backing parent, if this is a copy-on-write child.
    pub backing_parent: Option<PathBuf>,
}

/// Arena of known image artifacts, keyed by path.
///
/// Artifacts are only ever removed explicitly, and removal is refused while
/// any registered descendant still references the artifact as its backing
/// parent.
#[derive(Debug, Default)]
pub struct ImageStore {
    artifacts: HashMap<PathBuf, ImageArtifact>,
}

impl ImageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an artifact, replacing any previous entry at the same path.
    pub fn register(&mut self, artifact: ImageArtifact) {
        self.artifacts.insert(artifact.path.clone(), artifact);
    }

    /// Looks up an artifact by path.
    pub fn get(&self, path: &Path) -> Option<&ImageArtifact> {
        self.artifacts.get(path)
    }

    /// Whether any registered artifact names `path` as its backing parent.
    pub fn has_descendants(&self, path: &Path) -> bool {
        self.artifacts
            .values()
            .any(|a| a.backing_parent.as_deref() == Some(path))
    }

    /// Removes an artifact from the store.
    ///
    /// Fails with [`WindevError::ArtifactInUse`] if a descendant still
    /// references it, and [`WindevError::UnknownArtifact`] if the store has
    /// never seen the path. This only drops the bookkeeping entry; the file
    /// on storage is untouched.
    pub fn remove(&mut self, path: &Path) -> WindevResult<ImageArtifact> {
        if self.has_descendants(path) {
            return Err(WindevError::ArtifactInUse(path.to_path_buf()));
        }
        self.artifacts
            .remove(path)
            .ok_or_else(|| WindevError::UnknownArtifact(path.to_path_buf()))
    }
}

/// Events surfaced to an optional lineage observer. Progress reporting is a
/// side concern, not part of the correctness contract.
#[derive(Debug, Clone)]
pub enum LineageEvent {
    /// A multi-minute format conversion is starting.
    ConversionStarted {
        /// The flat source image.
        source: PathBuf,
        /// The conversion target.
        target: PathBuf,
    },
    /// The conversion target already existed and was reused as-is.
    ConversionReused {
        /// The existing target.
        target: PathBuf,
    },
    /// The conversion finished.
    ConversionFinished {
        /// The conversion target.
        target: PathBuf,
    },
}

/// Callback type for observing lineage events.
pub type LineageObserver = Box<dyn Fn(&LineageEvent) + Send + Sync>;

/// Converts flat images into the working format and derives copy-on-write
/// children, tracking every produced artifact in an [`ImageStore`].
pub struct ImageLineageManager {
    runner: Arc<dyn ProcessRunner>,
    store: ImageStore,
    observer: Option<LineageObserver>,
}

impl ImageLineageManager {
    /// Creates a lineage manager that invokes tools through `runner`.
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            store: ImageStore::new(),
            observer: None,
        }
    }

    /// Installs an observer notified of lineage events.
    pub fn with_observer(mut self, observer: LineageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The artifact arena.
    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Mutable access to the artifact arena.
    pub fn store_mut(&mut self) -> &mut ImageStore {
        &mut self.store
    }

    /// Registers an artifact that already exists on storage, e.g. a template
    /// image produced by an earlier run.
    pub fn adopt(
        &mut self,
        path: impl Into<PathBuf>,
        format: ImageFormat,
        backing_parent: Option<PathBuf>,
    ) -> ImageArtifact {
        let artifact = ImageArtifact {
            path: path.into(),
            format,
            backing_parent,
        };
        self.store.register(artifact.clone());
        artifact
    }

    /// Converts a flat vmdk image into the working qcow2 format.
    ///
    /// Idempotent: if the target already exists on storage the converter is
    /// not re-run and a handle to the existing artifact is returned. On
    /// converter failure the partially written target is left in place;
    /// a retry with the same target overwrites it.
    ///
    /// ## Errors
    ///
    /// Fails with [`WindevError::Conversion`] carrying the converter's
    /// captured standard error if the tool exits non-zero.
    pub async fn materialize_base(&mut self, source: &Path) -> WindevResult<ImageArtifact> {
        let target = source.with_extension(QCOW2_EXTENSION);

        if target.exists() {
            tracing::info!("reusing existing converted image {}", target.display());
            self.emit(&LineageEvent::ConversionReused {
                target: target.clone(),
            });
            return Ok(self.adopt(target, ImageFormat::Qcow2, None));
        }

        self.emit(&LineageEvent::ConversionStarted {
            source: source.to_path_buf(),
            target: target.clone(),
        });
        tracing::info!(
            "converting {} -> {}",
            source.display(),
            target.display()
        );

        let source_str = path_arg(source)?;
        let target_str = path_arg(&target)?;
        let output = self
            .runner
            .run(
                QEMU_IMG_TOOL,
                &[
                    "convert",
                    "-f",
                    ImageFormat::Vmdk.as_str(),
                    "-O",
                    ImageFormat::Qcow2.as_str(),
                    &source_str,
                    &target_str,
                ],
                None,
            )
            .await?;

        if !output.success() {
            return Err(WindevError::Conversion {
                source_image: source.to_path_buf(),
                stderr: output.stderr_utf8(),
            });
        }

        self.emit(&LineageEvent::ConversionFinished {
            target: target.clone(),
        });
        Ok(self.adopt(target, ImageFormat::Qcow2, None))
    }

    /// Derives a copy-on-write child image backed by `base`.
    ///
    /// The child is created next to its parent as `<child_name>.qcow2` and
    /// holds no content of its own until written to.
    pub async fn derive_child(
        &mut self,
        base: &Path,
        child_name: &str,
    ) -> WindevResult<ImageArtifact> {
        let child = base
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("{child_name}.{QCOW2_EXTENSION}"));

        let base_str = path_arg(base)?;
        let child_str = path_arg(&child)?;
        self.runner
            .run_checked(
                QEMU_IMG_TOOL,
                &[
                    "create",
                    "-b",
                    &base_str,
                    "-F",
                    ImageFormat::Qcow2.as_str(),
                    "-f",
                    ImageFormat::Qcow2.as_str(),
                    &child_str,
                ],
            )
            .await?;

        tracing::info!(
            "derived {} backed by {}",
            child.display(),
            base.display()
        );
        Ok(self.adopt(child, ImageFormat::Qcow2, Some(base.to_path_buf())))
    }

    /// Discovers the backing parent recorded in a qcow2 image header, if any.
    pub async fn backing_parent(&self, image: &Path) -> WindevResult<Option<PathBuf>> {
        let image_str = path_arg(image)?;
        let output = self
            .runner
            .run_checked(QEMU_IMG_TOOL, &["info", &image_str])
            .await?;

        let stdout = output.stdout_utf8();
        Ok(parse_backing_file(&stdout))
    }

    fn emit(&self, event: &LineageEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Renders a path as a tool argument, rejecting non-UTF-8 paths up front so
/// the external tools never see mangled bytes.
pub(crate) fn path_arg(path: &Path) -> WindevResult<String> {
    path.to_str().map(|s| s.to_string()).ok_or_else(|| {
        WindevError::InvalidArgument(format!("path {} is not valid UTF-8", path.display()))
    })
}

/// Extracts the backing file path from `qemu-img info` output.
fn parse_backing_file(info: &str) -> Option<PathBuf> {
    info.lines().find_map(|line| {
        line.strip_prefix(BACKING_FILE_PREFIX)
            .map(|rest| PathBuf::from(rest.trim()))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::process::testing::ScriptedRunner;
    use crate::utils::path::QEMU_IMG_TOOL;

    #[test_log::test(tokio::test)]
    async fn test_materialize_base_skips_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("WinDev.vmdk");
        let target = dir.path().join("WinDev.qcow2");
        std::fs::write(&source, b"vmdk").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let mut lineage = ImageLineageManager::new(runner.clone());

        // First call: no target on disk, converter runs once.
        let first = lineage.materialize_base(&source).await.unwrap();
        assert_eq!(first.path, target);
        assert_eq!(runner.call_count(QEMU_IMG_TOOL), 1);

        // Simulate the converter's output landing on disk, then call again:
        // the converter must not be re-invoked.
        std::fs::write(&target, b"qcow2").unwrap();
        let second = lineage.materialize_base(&source).await.unwrap();
        assert_eq!(second.path, target);
        assert_eq!(runner.call_count(QEMU_IMG_TOOL), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_materialize_base_surfaces_converter_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.vmdk");

        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure("qemu-img: error while reading sector 42");
        let mut lineage = ImageLineageManager::new(runner);

        let err = lineage.materialize_base(&source).await.unwrap_err();
        match err {
            WindevError::Conversion { stderr, .. } => {
                assert!(stderr.contains("sector 42"));
            }
            other => panic!("expected Conversion, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_derive_child_records_backing_parent() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut lineage = ImageLineageManager::new(runner.clone());

        let base = Path::new("/images/WinDev.qcow2");
        lineage.adopt(base, ImageFormat::Qcow2, None);
        let child = lineage.derive_child(base, "win11vm").await.unwrap();

        assert_eq!(child.path, Path::new("/images/win11vm.qcow2"));
        assert_eq!(child.backing_parent.as_deref(), Some(base));

        let call = &runner.calls()[0];
        assert_eq!(call.tool, QEMU_IMG_TOOL);
        assert_eq!(
            call.args,
            vec![
                "create",
                "-b",
                "/images/WinDev.qcow2",
                "-F",
                "qcow2",
                "-f",
                "qcow2",
                "/images/win11vm.qcow2",
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_store_refuses_removal_while_descendants_remain() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut lineage = ImageLineageManager::new(runner);

        let base = Path::new("/images/base.qcow2");
        lineage.adopt(base, ImageFormat::Qcow2, None);
        lineage.adopt(
            "/images/child.qcow2",
            ImageFormat::Qcow2,
            Some(base.to_path_buf()),
        );

        let err = lineage.store_mut().remove(base).unwrap_err();
        assert!(matches!(err, WindevError::ArtifactInUse(_)));

        lineage
            .store_mut()
            .remove(Path::new("/images/child.qcow2"))
            .unwrap();
        lineage.store_mut().remove(base).unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_backing_parent_parses_info_output() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_success(
            "image: win11vm.qcow2\n\
             file format: qcow2\n\
             backing file: /images/WinDev.qcow2\n\
             backing file format: qcow2\n",
        );
        let lineage = ImageLineageManager::new(runner);

        let parent = lineage
            .backing_parent(Path::new("win11vm.qcow2"))
            .await
            .unwrap();
        assert_eq!(parent.as_deref(), Some(Path::new("/images/WinDev.qcow2")));
    }

    #[test_log::test(tokio::test)]
    async fn test_backing_parent_none_for_flat_image() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_success("image: base.qcow2\nfile format: qcow2\n");
        let lineage = ImageLineageManager::new(runner);

        let parent = lineage
            .backing_parent(Path::new("base.qcow2"))
            .await
            .unwrap();
        assert!(parent.is_none());
    }
}
