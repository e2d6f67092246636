use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use windev_cli::{AnsiStyles, WindevArgs, WindevCliError, WindevCliResult};
use windev_core::management::fetch::{
    self, download_file, ProgressFn, GUEST_AGENT_INSTALLER, VIRTIO_ISO,
};
use windev_core::management::lineage::LineageEvent;
use windev_core::management::provision::{BuildOptions, Orchestrator, FIRST_BOOT_BACKOFF};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub fn log_level(args: &WindevArgs) {
    let level = if args.trace {
        Some("trace")
    } else if args.debug {
        Some("debug")
    } else if args.info {
        Some("info")
    } else if args.warn {
        Some("warn")
    } else if args.error {
        Some("error")
    } else {
        None
    };

    // Set RUST_LOG environment variable only if a level is specified
    if let Some(level) = level {
        std::env::set_var("RUST_LOG", format!("windev={},windev_core={}", level, level));
    }
}

pub async fn fetch_image_subcommand(
    url: String,
    output: Option<PathBuf>,
) -> WindevCliResult<()> {
    let output = match output {
        Some(output) => output,
        None => PathBuf::from(
            url.rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    WindevCliError::Usage(format!("cannot derive a file name from {url}"))
                })?,
        ),
    };

    fetch_to(&url, &output).await?;
    println!("{} {}", "fetched".literal(), output.display());
    Ok(())
}

pub async fn fetch_drivers_subcommand(
    agent_mirror: String,
    virtio_mirror: String,
    output_dir: PathBuf,
) -> WindevCliResult<()> {
    tokio::fs::create_dir_all(&output_dir).await?;

    fetch_to(
        &fetch::guest_agent_url(&agent_mirror),
        &output_dir.join(GUEST_AGENT_INSTALLER),
    )
    .await?;
    fetch_to(
        &fetch::virtio_iso_url(&virtio_mirror),
        &output_dir.join(VIRTIO_ISO),
    )
    .await?;

    println!("{} drivers into {}", "fetched".literal(), output_dir.display());
    Ok(())
}

pub async fn build_subcommand(
    source: PathBuf,
    name: String,
    device: Option<String>,
    startup_binary: Option<PathBuf>,
    requirements: Option<PathBuf>,
) -> WindevCliResult<()> {
    let packages = match requirements {
        Some(path) => read_requirements(&path)?,
        None => Vec::new(),
    };

    let mut orchestrator = Orchestrator::system().with_lineage_observer(Box::new(lineage_progress));

    if orchestrator.domain_exists(&name).await? {
        println!(
            "{} domain {} is already defined, skipping build",
            "note:".placeholder(),
            name.literal()
        );
        return Ok(());
    }

    let mut options = BuildOptions::builder()
        .source_image(source)
        .instance_name(name)
        .packages(packages)
        .build();
    if let Some(device) = device {
        options.device = device;
    }
    options.startup_binary = startup_binary;

    let template = orchestrator.build_template(&options).await?;
    println!("{} {}", "built".literal(), template.display());
    Ok(())
}

pub async fn spawn_subcommand(name: String) -> WindevCliResult<()> {
    let mut orchestrator = Orchestrator::system();
    let instance = orchestrator.spawn_instance(&name).await?;
    println!("{} {}", "spawned".literal(), instance.literal());
    Ok(())
}

pub async fn copy_subcommand(name: String, source: PathBuf, dest: String) -> WindevCliResult<()> {
    let content = tokio::fs::read(&source).await?;
    let orchestrator = Orchestrator::system();
    orchestrator.channel().copy_file(&name, &dest, &content).await?;
    println!(
        "{} {} -> {}:{}",
        "copied".literal(),
        source.display(),
        name,
        dest
    );
    Ok(())
}

pub async fn exec_subcommand(
    name: String,
    program: String,
    args: Vec<String>,
) -> WindevCliResult<()> {
    let orchestrator = Orchestrator::system();
    let output = orchestrator
        .channel()
        .exec_with_retry(&name, &program, &args, FIRST_BOOT_BACKOFF)
        .await?;

    print!("{}", output.stdout);
    eprint!("{}", output.stderr);

    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Reads a requirements file: one package per line, blank lines and `#`
/// comments ignored.
pub fn read_requirements(path: &Path) -> WindevCliResult<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

async fn fetch_to(url: &str, dest: &Path) -> WindevCliResult<()> {
    let bar = download_bar(&dest.display().to_string());
    let progress = byte_progress(bar.clone());
    let progress: &ProgressFn = &progress;

    let result = download_file(url, dest, Some(progress)).await;
    bar.finish_and_clear();
    result?;
    Ok(())
}

fn download_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg} {bytes}/{total_bytes} {wide_bar}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(label.to_string());
    bar
}

fn byte_progress(bar: ProgressBar) -> impl Fn(u64, Option<u64>) + Send + Sync {
    move |received, total| {
        if let Some(total) = total {
            bar.set_length(total);
        }
        bar.set_position(received);
    }
}

fn lineage_progress(event: &LineageEvent) {
    match event {
        LineageEvent::ConversionStarted { source, target } => {
            println!(
                "{} {} -> {}",
                "converting".literal(),
                source.display(),
                target.display()
            );
        }
        LineageEvent::ConversionReused { target } => {
            println!("{} {}", "reusing".literal(), target.display());
        }
        LineageEvent::ConversionFinished { target } => {
            println!("{} {}", "converted".literal(), target.display());
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_requirements_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        std::fs::write(&path, "git\n\n# editors\nvscode  \n").unwrap();

        let packages = read_requirements(&path).unwrap();
        assert_eq!(packages, vec!["git", "vscode"]);
    }
}
