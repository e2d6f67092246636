//! Command line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use windev_core::management::fetch::{DEFAULT_GUEST_AGENT_URL, DEFAULT_VIRTIO_ISO_URL};

use crate::styles;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default name for the template domain and its image.
pub const DEFAULT_INSTANCE_NAME: &str = "win11vm";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Windows dev VM provisioning tool.
#[derive(Debug, Parser)]
#[command(name = "windev", author, styles=styles::styles())]
pub struct WindevArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<WindevSubcommand>,

    /// Enable trace logging
    #[arg(long, global = true)]
    pub trace: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable info logging
    #[arg(long, global = true)]
    pub info: bool,

    /// Enable warning logging
    #[arg(long, global = true)]
    pub warn: bool,

    /// Enable error logging
    #[arg(long, global = true)]
    pub error: bool,

    /// Show version
    #[arg(short = 'V', long)]
    pub version: bool,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum WindevSubcommand {
    /// Download a vendor appliance archive
    #[command(name = "fetch-image")]
    FetchImage {
        /// URL of the appliance archive
        #[arg(long)]
        url: String,

        /// Destination file, defaults to the URL's file name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download the guest agent installer and paravirtual driver bundle
    #[command(name = "fetch-drivers")]
    FetchDrivers {
        /// Mirror directory for the guest agent installer
        #[arg(long, default_value = DEFAULT_GUEST_AGENT_URL)]
        agent_mirror: String,

        /// Mirror directory for the driver bundle
        #[arg(long, default_value = DEFAULT_VIRTIO_ISO_URL)]
        virtio_mirror: String,

        /// Directory to download into
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
    },

    /// Build a customized template image from a vendor appliance
    Build {
        /// The appliance source, an .ova archive or extracted .vmdk image
        source: PathBuf,

        /// Name for the template domain and its image
        #[arg(short, long, default_value = DEFAULT_INSTANCE_NAME)]
        name: String,

        /// Block-device slot to attach images to
        #[arg(long)]
        device: Option<String>,

        /// Binary staged into the guest autostart directory, run once at
        /// first logon
        #[arg(long)]
        startup_binary: Option<PathBuf>,

        /// File listing packages to install, one per line
        #[arg(short, long)]
        requirements: Option<PathBuf>,
    },

    /// Spawn a disposable instance from a template
    Spawn {
        /// Template name to spawn from
        #[arg(default_value = DEFAULT_INSTANCE_NAME)]
        name: String,
    },

    /// Copy a host file into a running guest
    Copy {
        /// The guest domain name
        name: String,

        /// Host file to copy
        source: PathBuf,

        /// Destination path inside the guest
        dest: String,
    },

    /// Run a command inside a running guest
    Exec {
        /// The guest domain name
        name: String,

        /// Program to run inside the guest
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_are_well_formed() {
        WindevArgs::command().debug_assert();
    }

    #[test]
    fn test_build_defaults() {
        let args = WindevArgs::parse_from(["windev", "build", "WinDev.ova"]);
        match args.subcommand {
            Some(WindevSubcommand::Build {
                source,
                name,
                device,
                startup_binary,
                requirements,
            }) => {
                assert_eq!(source, PathBuf::from("WinDev.ova"));
                assert_eq!(name, DEFAULT_INSTANCE_NAME);
                assert!(device.is_none());
                assert!(startup_binary.is_none());
                assert!(requirements.is_none());
            }
            other => panic!("expected Build, got {other:?}"),
        }
    }

    #[test]
    fn test_exec_collects_trailing_arguments() {
        let args = WindevArgs::parse_from(["windev", "exec", "win11vm-1", "cmd", "/c", "whoami"]);
        match args.subcommand {
            Some(WindevSubcommand::Exec { name, program, args }) => {
                assert_eq!(name, "win11vm-1");
                assert_eq!(program, "cmd");
                assert_eq!(args, vec!["/c", "whoami"]);
            }
            other => panic!("expected Exec, got {other:?}"),
        }
    }
}
