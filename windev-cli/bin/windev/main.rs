#[path = "mod.rs"]
mod windev;

use clap::{CommandFactory, Parser};
use windev::handlers;
use windev_cli::{AnsiStyles, WindevArgs, WindevCliResult, WindevSubcommand};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> WindevCliResult<()> {
    // Parse command line arguments
    let args = WindevArgs::parse();

    handlers::log_level(&args);
    tracing_subscriber::fmt::init();

    // Print version if requested
    if args.version {
        println!("{}", format!("v{}", env!("CARGO_PKG_VERSION")).literal());
        return Ok(());
    }

    match args.subcommand {
        Some(WindevSubcommand::FetchImage { url, output }) => {
            handlers::fetch_image_subcommand(url, output).await?;
        }
        Some(WindevSubcommand::FetchDrivers {
            agent_mirror,
            virtio_mirror,
            output_dir,
        }) => {
            handlers::fetch_drivers_subcommand(agent_mirror, virtio_mirror, output_dir).await?;
        }
        Some(WindevSubcommand::Build {
            source,
            name,
            device,
            startup_binary,
            requirements,
        }) => {
            handlers::build_subcommand(source, name, device, startup_binary, requirements).await?;
        }
        Some(WindevSubcommand::Spawn { name }) => {
            handlers::spawn_subcommand(name).await?;
        }
        Some(WindevSubcommand::Copy { name, source, dest }) => {
            handlers::copy_subcommand(name, source, dest).await?;
        }
        Some(WindevSubcommand::Exec {
            name,
            program,
            args,
        }) => {
            handlers::exec_subcommand(name, program, args).await?;
        }
        None => {
            WindevArgs::command().print_help()?;
        }
    }

    Ok(())
}
