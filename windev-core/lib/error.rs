//! The error types used throughout the crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::management::provision::ProvisioningStage;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result type used throughout the crate.
pub type WindevResult<T> = Result<T, WindevError>;

/// The main error type for windev operations.
///
/// External-tool failures are always fatal: retrying a failed conversion or
/// attach risks corrupting partially written output, so the run is treated as
/// aborted and artifacts are left on disk for manual recovery. The only
/// recoverable variants are [`WindevError::SubmissionRejected`], which is the
/// expected state while a guest is still booting, and per-package install
/// failures, which are logged at the call site and never surfaced here.
#[derive(Debug, Error)]
pub enum WindevError {
    /// An external tool exited with a non-zero status.
    #[error("{tool} failed: {stderr}")]
    ToolInvocation {
        /// The tool that was invoked.
        tool: String,
        /// The captured standard error of the tool.
        stderr: String,
    },

    /// An external tool could not be spawned at all.
    #[error("failed to spawn {tool}: {source}")]
    ToolSpawn {
        /// The tool that was invoked.
        tool: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The image format converter exited with a non-zero status.
    #[error("conversion of {source_image} failed: {stderr}")]
    Conversion {
        /// The flat source image that was being converted.
        source_image: PathBuf,
        /// The captured standard error of the converter.
        stderr: String,
    },

    /// No file record in the forensic catalog matched the target directory.
    #[error("no partition owns the target directory {0}")]
    LocatorNotFound(String),

    /// The guest-agent channel rejected a command submission, most commonly
    /// because the agent is not yet responsive inside a booting guest.
    #[error("guest agent rejected submission: {0}")]
    SubmissionRejected(String),

    /// The guest-agent channel returned a response that did not decode into
    /// the expected shape.
    #[error("malformed guest agent response: {0}")]
    MalformedAgentResponse(String),

    /// An artifact with registered descendants was about to be removed.
    #[error("artifact {0} still has descendants referencing it")]
    ArtifactInUse(PathBuf),

    /// An artifact path was referenced that the store has never seen.
    #[error("unknown artifact {0}")]
    UnknownArtifact(PathBuf),

    /// A qcow2 image that was expected to carry a backing file does not.
    #[error("image {0} has no backing file")]
    BackingFileMissing(PathBuf),

    /// An expected member was not found inside an archive.
    #[error("archive {archive} contains no {wanted} member")]
    ArchiveMemberNotFound {
        /// The archive that was searched.
        archive: PathBuf,
        /// The member suffix that was looked for.
        wanted: String,
    },

    /// A provisioning stage failed.
    #[error("stage {stage} failed: {source}")]
    Stage {
        /// The stage that failed.
        stage: ProvisioningStage,
        /// The underlying error.
        source: Box<WindevError>,
    },

    /// An invalid argument was provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A catalog database error occurred.
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    /// A JSON (de)serialization error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An HTTP error occurred while downloading.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Tool output was not valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WindevError {
    /// Wraps this error as a failure of the given provisioning stage.
    pub fn at_stage(self, stage: ProvisioningStage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }
}
