//! `windev-cli` is the command line front end for the windev provisioning
//! engine. It wraps [`windev_core`]'s orchestration flows in subcommands for
//! fetching artifacts, building customized template images, and spawning
//! disposable instances from them.

#![warn(missing_docs)]

mod args;
mod error;
mod styles;

pub use args::*;
pub use error::*;
pub use styles::*;
