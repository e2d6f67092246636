//! Error types for the windev command line tool.

use thiserror::Error;
use windev_core::WindevError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result type used throughout the command line tool.
pub type WindevCliResult<T> = Result<T, WindevCliError>;

/// An error that occurred while handling a subcommand.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WindevCliError {
    /// An error from the provisioning engine.
    #[error(transparent)]
    Core(#[from] WindevError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The arguments could not be used as given.
    #[error("{0}")]
    Usage(String),
}
