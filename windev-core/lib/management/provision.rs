//! End-to-end provisioning orchestration.
//!
//! Two top-level flows live here. `build_template` turns a vendor appliance
//! into a customized, indexed template image: convert, index, customize
//! offline, boot, install the toolchain, shut down, re-index. Template builds
//! take tens of minutes and are expected to be rare. `spawn_instance` is the
//! cheap flow: derive a copy-on-write child from an existing template and
//! boot it under a fresh name, leaving the template untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::management::agent::GuestChannel;
use crate::management::archive;
use crate::management::catalog::PartitionCatalog;
use crate::management::descriptor;
use crate::management::device::{Mounter, NbdDevice};
use crate::management::hypervisor::{
    find_instance_name, Hypervisor, VirshHypervisor,
};
use crate::management::lineage::{path_arg, ImageFormat, ImageLineageManager};
use crate::management::registry::{HivexShellHive, RegistryPatcher};
use crate::process::{ProcessRunner, SystemRunner};
use crate::utils::env::{get_mount_point, get_nbd_device};
use crate::utils::path::{
    CATALOG_DB_SUFFIX, LIBVIRT_URI, QCOW2_EXTENSION, SOFTWARE_HIVE_RELATIVE,
    STARTUP_DIR_RELATIVE,
};
use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Backoff between rejected agent submissions during the first boot, when
/// the guest agent service has never run before.
pub const FIRST_BOOT_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff between rejected agent submissions after a reboot, which on a
/// customized guest takes noticeably longer than a poll cycle.
pub const POST_REBOOT_BACKOFF: Duration = Duration::from_secs(15);

/// Interval between liveness checks while waiting for a guest-cooperative
/// shutdown to complete.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The guest-side autostart directory, as the guest spells it.
const GUEST_STARTUP_DIR: &str =
    "C:\\ProgramData\\Microsoft\\Windows\\Start Menu\\Programs\\Startup";

/// Appliance archive file extension.
const OVA_EXTENSION: &str = "ova";

/// Bootstraps the package manager inside the guest.
const TOOLCHAIN_BOOTSTRAP_COMMAND: &str =
    "[System.Net.ServicePointManager]::SecurityProtocol = 3072; \
     iex ((New-Object System.Net.WebClient).DownloadString(\
     'https://community.chocolatey.org/install.ps1'))";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The stage of the provisioning pipeline an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStage {
    /// Extracting and converting the vendor appliance.
    Conversion,
    /// Building or reusing the forensic partition catalog.
    Indexing,
    /// Deriving a copy-on-write child from the converted base.
    Derivation,
    /// Offline registry and filesystem customization.
    Customization,
    /// Rendering and defining the domain.
    Definition,
    /// First boot and guest liveness probing.
    Boot,
    /// Package manager bootstrap and package installs.
    ToolchainInstall,
    /// Guest-cooperative shutdown.
    Shutdown,
    /// Re-indexing the finished template.
    Finalization,
    /// Deriving and booting an instance from a template.
    Spawn,
}

impl std::fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProvisioningStage::Conversion => "conversion",
            ProvisioningStage::Indexing => "indexing",
            ProvisioningStage::Derivation => "derivation",
            ProvisioningStage::Customization => "customization",
            ProvisioningStage::Definition => "definition",
            ProvisioningStage::Boot => "boot",
            ProvisioningStage::ToolchainInstall => "toolchain-install",
            ProvisioningStage::Shutdown => "shutdown",
            ProvisioningStage::Finalization => "finalization",
            ProvisioningStage::Spawn => "spawn",
        };
        f.write_str(name)
    }
}

/// Options controlling a template build.
#[derive(Debug, TypedBuilder)]
pub struct BuildOptions {
    /// The vendor appliance: either an `.ova` archive or an already
    /// extracted `.vmdk` image.
    pub source_image: PathBuf,

    /// Name for the template domain and its image.
    pub instance_name: String,

    /// Block-device slot to attach images to.
    #[builder(default = get_nbd_device())]
    pub device: String,

    /// Host mount point for the guest system partition.
    #[builder(default = get_mount_point())]
    pub mount_point: PathBuf,

    /// Host-side binary staged into the guest autostart directory and
    /// scheduled to run once at first logon.
    #[builder(default, setter(strip_option))]
    pub startup_binary: Option<PathBuf>,

    /// Packages installed through the guest package manager.
    #[builder(default)]
    pub packages: Vec<String>,
}

/// Drives the full provisioning pipeline.
pub struct Orchestrator {
    runner: Arc<dyn ProcessRunner>,
    hypervisor: Arc<dyn Hypervisor>,
    channel: GuestChannel,
    lineage: ImageLineageManager,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates an orchestrator with explicit collaborators.
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        hypervisor: Arc<dyn Hypervisor>,
        uri: impl Into<String>,
    ) -> Self {
        let channel = GuestChannel::new(runner.clone(), uri);
        let lineage = ImageLineageManager::new(runner.clone());
        Self {
            runner,
            hypervisor,
            channel,
            lineage,
        }
    }

    /// Creates an orchestrator driving the real system hypervisor.
    pub fn system() -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner);
        let hypervisor = Arc::new(VirshHypervisor::new(runner.clone(), LIBVIRT_URI));
        Self::new(runner, hypervisor, LIBVIRT_URI)
    }

    /// Installs an observer notified of image lineage events, for progress
    /// reporting in front ends.
    pub fn with_lineage_observer(
        mut self,
        observer: crate::management::lineage::LineageObserver,
    ) -> Self {
        self.lineage = ImageLineageManager::new(self.runner.clone()).with_observer(observer);
        self
    }

    /// The guest command channel.
    pub fn channel(&self) -> &GuestChannel {
        &self.channel
    }

    /// The image lineage manager.
    pub fn lineage(&self) -> &ImageLineageManager {
        &self.lineage
    }

    /// Whether a domain with this name is already defined.
    pub async fn domain_exists(&self, name: &str) -> WindevResult<bool> {
        self.hypervisor.domain_exists(name).await
    }

    /// Builds a customized template image from a vendor appliance and
    /// returns the path of the finished template.
    pub async fn build_template(&mut self, options: &BuildOptions) -> WindevResult<PathBuf> {
        let base = self
            .materialize(&options.source_image)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Conversion))?;

        let base_catalog = catalog_path(&base)?;
        self.index_image(&base, &base_catalog, &options.device)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Indexing))?;

        let template = self
            .lineage
            .derive_child(&base, &options.instance_name)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Derivation))?
            .path;

        let staged_guest_path = self
            .customize_offline(options, &template, &base_catalog)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Customization))?;

        let definition =
            descriptor::render(&options.instance_name, &template, &[base.clone()])
                .map_err(|e| e.at_stage(ProvisioningStage::Definition))?;
        self.hypervisor
            .define_domain(&options.instance_name, &definition.descriptor_xml)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Definition))?;
        self.hypervisor
            .start_domain(&options.instance_name)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Boot))?;

        self.probe_guest(&options.instance_name, FIRST_BOOT_BACKOFF)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Boot))?;

        self.install_toolchain(options, staged_guest_path.as_deref())
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::ToolchainInstall))?;

        self.hypervisor
            .shutdown_domain(&options.instance_name)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Shutdown))?;
        self.wait_for_shutdown(&options.instance_name)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Shutdown))?;

        // The finished template gets its own catalog so later work against
        // it never falls back to the base image's layout.
        let template_catalog = catalog_path(&template)?;
        self.index_image(&template, &template_catalog, &options.device)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Finalization))?;

        tracing::info!("template {} is ready", template.display());
        Ok(template)
    }

    /// Derives a disposable instance from a finished template and boots it.
    /// Returns the instance name.
    pub async fn spawn_instance(&mut self, template_name: &str) -> WindevResult<String> {
        self.spawn_inner(template_name)
            .await
            .map_err(|e| e.at_stage(ProvisioningStage::Spawn))
    }

    async fn spawn_inner(&mut self, template_name: &str) -> WindevResult<String> {
        let instance_name = find_instance_name(self.hypervisor.as_ref(), template_name).await?;
        tracing::info!("spawning {instance_name} from template {template_name}");

        let template_image = PathBuf::from(format!("{template_name}.{QCOW2_EXTENSION}"));
        let ancestor = self
            .lineage
            .backing_parent(&template_image)
            .await?
            .ok_or_else(|| WindevError::BackingFileMissing(template_image.clone()))?;

        self.lineage.adopt(&ancestor, ImageFormat::Qcow2, None);
        self.lineage.adopt(
            &template_image,
            ImageFormat::Qcow2,
            Some(ancestor.clone()),
        );

        let instance_image = self
            .lineage
            .derive_child(&template_image, &instance_name)
            .await?
            .path;

        let chain = vec![template_image, ancestor];
        let definition = descriptor::render(&instance_name, &instance_image, &chain)?;
        self.hypervisor
            .define_domain(&instance_name, &definition.descriptor_xml)
            .await?;
        self.hypervisor.start_domain(&instance_name).await?;

        Ok(instance_name)
    }

    //----------------------------------------------------------------------
    // Stage helpers
    //----------------------------------------------------------------------

    /// Produces the flat qcow2 base image from the appliance source.
    async fn materialize(&mut self, source: &Path) -> WindevResult<PathBuf> {
        let flat = if source.extension().is_some_and(|e| e == OVA_EXTENSION) {
            archive::extract_vmdk(source)?
        } else {
            source.to_path_buf()
        };
        Ok(self.lineage.materialize_base(&flat).await?.path)
    }

    /// Builds the forensic catalog for an image, attaching and detaching it
    /// around the scan. Skips everything when the catalog already exists.
    async fn index_image(
        &self,
        image: &Path,
        db_path: &Path,
        device: &str,
    ) -> WindevResult<()> {
        if db_path.exists() {
            tracing::info!("reusing existing catalog {}", db_path.display());
            return Ok(());
        }

        let nbd = NbdDevice::new(self.runner.clone(), device);
        nbd.attach(image).await?;
        let result = async {
            nbd.dump_partition_table().await?;
            PartitionCatalog::build(&self.runner, device, db_path).await
        }
        .await;
        let detach_result = nbd.detach().await;
        result?;
        detach_result
    }

    /// Mounts the template's system partition and applies the offline
    /// customizations. Returns the guest path of the staged startup binary,
    /// if one was staged.
    async fn customize_offline(
        &self,
        options: &BuildOptions,
        template: &Path,
        db_path: &Path,
    ) -> WindevResult<Option<String>> {
        let nbd = NbdDevice::new(self.runner.clone(), &options.device);
        nbd.attach(template).await?;

        let result = self.customize_mounted(options, db_path, &nbd).await;

        // The device must come back regardless of how customization went;
        // a held slot blocks every later attach.
        let detach_result = nbd.detach().await;
        let staged = result?;
        detach_result?;
        Ok(staged)
    }

    async fn customize_mounted(
        &self,
        options: &BuildOptions,
        db_path: &Path,
        nbd: &NbdDevice,
    ) -> WindevResult<Option<String>> {
        let catalog = PartitionCatalog::open(db_path).await?;
        let partition = catalog.resolve_mount_device(nbd.path()).await?;

        let mounter = Mounter::new(self.runner.clone(), &options.mount_point);
        mounter.mount(&partition).await?;

        let result = self.apply_customizations(options).await;

        let unmount_result = mounter.unmount(&partition).await;
        let staged = result?;
        unmount_result?;
        Ok(staged)
    }

    async fn apply_customizations(&self, options: &BuildOptions) -> WindevResult<Option<String>> {
        let hive_path = options.mount_point.join(SOFTWARE_HIVE_RELATIVE);
        let hive = HivexShellHive::new(self.runner.clone(), hive_path);
        let mut patcher = RegistryPatcher::new(hive);
        patcher.disable_legacy_elevation_prompting()?;

        let staged = match &options.startup_binary {
            Some(binary) => {
                let file_name = binary
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        WindevError::InvalidArgument(format!(
                            "startup binary {} has no usable file name",
                            binary.display()
                        ))
                    })?;

                let host_dest = options
                    .mount_point
                    .join(STARTUP_DIR_RELATIVE)
                    .join(file_name);
                tokio::fs::copy(binary, &host_dest).await?;
                tracing::info!("staged {} into autostart directory", file_name);

                let guest_path = format!("{GUEST_STARTUP_DIR}\\{file_name}");
                patcher.schedule_one_shot_startup(&guest_path)?;
                Some(guest_path)
            }
            None => None,
        };

        patcher.commit().await?;
        Ok(staged)
    }

    /// Probes guest liveness until the agent answers a trivial command.
    async fn probe_guest(&self, domain: &str, backoff: Duration) -> WindevResult<()> {
        let args = vec!["/c".to_string(), "whoami".to_string()];
        let output = self
            .channel
            .exec_with_retry(domain, "cmd", &args, backoff)
            .await?;
        tracing::info!("guest {domain} is up as {}", output.stdout.trim());
        Ok(())
    }

    /// Bootstraps the package manager and installs the requested packages,
    /// rebooting in between so the staged customizations take effect.
    async fn install_toolchain(
        &self,
        options: &BuildOptions,
        staged_guest_path: Option<&str>,
    ) -> WindevResult<()> {
        let domain = &options.instance_name;

        // The one-shot binary has served its purpose once the guest is up.
        if let Some(staged) = staged_guest_path {
            let delete = format!("del \"{staged}\"");
            let output = self
                .channel
                .exec_with_retry(domain, "powershell.exe", &powershell_args(&delete), FIRST_BOOT_BACKOFF)
                .await?;
            tracing::debug!("removed staged binary: {}", output.stdout.trim());
        }

        let output = self
            .channel
            .exec_with_retry(
                domain,
                "powershell.exe",
                &powershell_args(TOOLCHAIN_BOOTSTRAP_COMMAND),
                FIRST_BOOT_BACKOFF,
            )
            .await?;
        if output.exit_code != 0 {
            tracing::warn!("toolchain bootstrap exited {}: {}", output.exit_code, output.stderr.trim());
        } else {
            tracing::info!("toolchain bootstrap finished");
        }

        self.hypervisor.reboot_domain(domain).await?;
        self.probe_guest(domain, POST_REBOOT_BACKOFF).await?;

        for package in &options.packages {
            let args: Vec<String> = ["choco", "install", package.as_str(), "-y"]
                .into_iter()
                .map(String::from)
                .collect();
            match self
                .channel
                .exec_with_retry(domain, "powershell.exe", &args, POST_REBOOT_BACKOFF)
                .await
            {
                Ok(output) if output.exit_code == 0 => {
                    tracing::info!("installed {package}");
                }
                Ok(output) => {
                    tracing::warn!(
                        "install of {package} exited {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    );
                }
                Err(err) => {
                    tracing::warn!("install of {package} failed: {err}");
                }
            }
        }

        Ok(())
    }

    /// Waits for a requested shutdown to complete.
    async fn wait_for_shutdown(&self, domain: &str) -> WindevResult<()> {
        while self.hypervisor.domain_active(domain).await? {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        tracing::info!("domain {domain} has shut down");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Location of the forensic catalog for an image.
fn catalog_path(image: &Path) -> WindevResult<PathBuf> {
    Ok(PathBuf::from(format!(
        "{}{CATALOG_DB_SUFFIX}",
        path_arg(image)?
    )))
}

/// Standard interpreter arguments for running one guest-side command.
fn powershell_args(command: &str) -> Vec<String> {
    [
        "-NoProfile",
        "-InputFormat",
        "None",
        "-ExecutionPolicy",
        "Bypass",
        "-Command",
        command,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::process::testing::ScriptedRunner;

    #[derive(Default)]
    struct FakeHypervisor {
        defined: Mutex<HashMap<String, String>>,
        started: Mutex<Vec<String>>,
        active_polls_remaining: Mutex<u32>,
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn domain_exists(&self, name: &str) -> WindevResult<bool> {
            Ok(self.defined.lock().unwrap().contains_key(name))
        }

        async fn define_domain(&self, name: &str, xml: &str) -> WindevResult<()> {
            self.defined
                .lock()
                .unwrap()
                .insert(name.to_string(), xml.to_string());
            Ok(())
        }

        async fn start_domain(&self, name: &str) -> WindevResult<()> {
            self.started.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn reboot_domain(&self, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn shutdown_domain(&self, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn domain_active(&self, _: &str) -> WindevResult<bool> {
            let mut remaining = self.active_polls_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_instance_derives_and_boots_under_fresh_name() {
        let runner = Arc::new(ScriptedRunner::new());
        // backing_parent lookup on the template image.
        runner.push_success(
            "image: win11vm.qcow2\n\
             file format: qcow2\n\
             backing file: /images/WinDev.qcow2\n",
        );
        // derive_child create.
        runner.push_success("");

        let hypervisor = Arc::new(FakeHypervisor::default());
        hypervisor
            .defined
            .lock()
            .unwrap()
            .insert("win11vm".to_string(), String::new());

        let mut orchestrator =
            Orchestrator::new(runner.clone(), hypervisor.clone(), "qemu:///system");

        let name = orchestrator.spawn_instance("win11vm").await.unwrap();
        assert_eq!(name, "win11vm-1");
        assert_eq!(hypervisor.started.lock().unwrap().as_slice(), ["win11vm-1"]);

        // The instance descriptor carries the whole ancestry, template
        // before base.
        let defined = hypervisor.defined.lock().unwrap();
        let xml = &defined["win11vm-1"];
        assert_eq!(xml.matches("<backingStore").count(), 2);
        let template_pos = xml.find("win11vm.qcow2").unwrap();
        let base_pos = xml.find("WinDev.qcow2").unwrap();
        assert!(template_pos < base_pos);
    }

    #[tokio::test]
    async fn test_spawn_instance_requires_template_backing_file() {
        let runner = Arc::new(ScriptedRunner::new());
        // A flat image with no backing file is not a template.
        runner.push_success("image: win11vm.qcow2\nfile format: qcow2\n");

        let hypervisor = Arc::new(FakeHypervisor::default());
        let mut orchestrator = Orchestrator::new(runner, hypervisor, "qemu:///system");

        let err = orchestrator.spawn_instance("win11vm").await.unwrap_err();
        match err {
            WindevError::Stage { stage, source } => {
                assert_eq!(stage, ProvisioningStage::Spawn);
                assert!(matches!(*source, WindevError::BackingFileMissing(_)));
            }
            other => panic!("expected Stage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_template_reports_conversion_stage() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("WinDev.vmdk");
        std::fs::write(&source, b"vmdk").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure("qemu-img: cannot read image");

        let hypervisor = Arc::new(FakeHypervisor::default());
        let mut orchestrator = Orchestrator::new(runner, hypervisor, "qemu:///system");

        let options = BuildOptions::builder()
            .source_image(source)
            .instance_name("win11vm".to_string())
            .build();

        let err = orchestrator.build_template(&options).await.unwrap_err();
        match err {
            WindevError::Stage { stage, .. } => {
                assert_eq!(stage, ProvisioningStage::Conversion);
            }
            other => panic!("expected Stage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_template_reports_derivation_stage() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("WinDev.vmdk");
        let converted = dir.path().join("WinDev.qcow2");
        std::fs::write(&source, b"vmdk").unwrap();
        // Conversion and indexing are both satisfied from disk, so the
        // first tool invocation is the child derivation.
        std::fs::write(&converted, b"qcow2").unwrap();
        std::fs::write(dir.path().join("WinDev.qcow2.db"), b"catalog").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure("qemu-img: could not open backing file");

        let hypervisor = Arc::new(FakeHypervisor::default());
        let mut orchestrator = Orchestrator::new(runner, hypervisor, "qemu:///system");

        let options = BuildOptions::builder()
            .source_image(source)
            .instance_name("win11vm".to_string())
            .build();

        let err = orchestrator.build_template(&options).await.unwrap_err();
        match err {
            WindevError::Stage { stage, .. } => {
                assert_eq!(stage, ProvisioningStage::Derivation);
            }
            other => panic!("expected Stage, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_shutdown_polls_until_inactive() {
        let runner = Arc::new(ScriptedRunner::new());
        let hypervisor = Arc::new(FakeHypervisor {
            active_polls_remaining: Mutex::new(3),
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(runner, hypervisor.clone(), "qemu:///system");

        orchestrator.wait_for_shutdown("win11vm").await.unwrap();
        assert_eq!(*hypervisor.active_polls_remaining.lock().unwrap(), 0);
    }

    #[test]
    fn test_build_options_defaults() {
        let options = BuildOptions::builder()
            .source_image(PathBuf::from("/images/WinDev.ova"))
            .instance_name("win11vm".to_string())
            .build();

        assert_eq!(options.device, crate::utils::path::DEFAULT_NBD_DEVICE);
        assert!(options.startup_binary.is_none());
        assert!(options.packages.is_empty());
    }
}
