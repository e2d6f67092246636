//! Hypervisor domain lifecycle.
//!
//! Domains are defined, started, and stopped through the hypervisor's `virsh`
//! front end. The [`Hypervisor`] trait keeps the orchestrator independent of
//! the actual management daemon; the production implementation shells out,
//! tests substitute an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;

use crate::management::lineage::path_arg;
use crate::process::ProcessRunner;
use crate::utils::path::VIRSH_TOOL;
use crate::WindevResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Domain lifecycle operations the provisioning engine needs.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Whether a domain with this name is already defined.
    async fn domain_exists(&self, name: &str) -> WindevResult<bool>;

    /// Defines a new domain from a rendered descriptor.
    async fn define_domain(&self, name: &str, descriptor_xml: &str) -> WindevResult<()>;

    /// Starts a defined domain.
    async fn start_domain(&self, name: &str) -> WindevResult<()>;

    /// Requests a guest-cooperative reboot.
    async fn reboot_domain(&self, name: &str) -> WindevResult<()>;

    /// Requests a guest-cooperative shutdown. Completion is observed through
    /// [`Hypervisor::domain_active`], not through this call returning.
    async fn shutdown_domain(&self, name: &str) -> WindevResult<()>;

    /// Whether the domain is currently running.
    async fn domain_active(&self, name: &str) -> WindevResult<bool>;
}

/// Production [`Hypervisor`] driving `virsh` against a management URI.
pub struct VirshHypervisor {
    runner: Arc<dyn ProcessRunner>,
    uri: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirshHypervisor {
    /// Creates a hypervisor handle for the given management URI.
    pub fn new(runner: Arc<dyn ProcessRunner>, uri: impl Into<String>) -> Self {
        Self {
            runner,
            uri: uri.into(),
        }
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_exists(&self, name: &str) -> WindevResult<bool> {
        let output = self
            .runner
            .run(VIRSH_TOOL, &["-c", &self.uri, "dominfo", name], None)
            .await?;
        Ok(output.success())
    }

    async fn define_domain(&self, name: &str, descriptor_xml: &str) -> WindevResult<()> {
        // virsh only takes a file, so the descriptor goes through a scratch
        // path that is removed again on the happy path.
        let descriptor_path = std::env::temp_dir().join(format!("{name}.xml"));
        tokio::fs::write(&descriptor_path, descriptor_xml).await?;

        let descriptor_str = path_arg(&descriptor_path)?;
        let result = self
            .runner
            .run_checked(VIRSH_TOOL, &["-c", &self.uri, "define", &descriptor_str])
            .await;

        // Best effort; a stale scratch file is harmless.
        let _ = tokio::fs::remove_file(&descriptor_path).await;
        result?;

        tracing::info!("defined domain {name}");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> WindevResult<()> {
        self.runner
            .run_checked(VIRSH_TOOL, &["-c", &self.uri, "start", name])
            .await?;
        tracing::info!("started domain {name}");
        Ok(())
    }

    async fn reboot_domain(&self, name: &str) -> WindevResult<()> {
        self.runner
            .run_checked(VIRSH_TOOL, &["-c", &self.uri, "reboot", name])
            .await?;
        tracing::info!("rebooting domain {name}");
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> WindevResult<()> {
        self.runner
            .run_checked(VIRSH_TOOL, &["-c", &self.uri, "shutdown", name])
            .await?;
        tracing::info!("shutdown requested for domain {name}");
        Ok(())
    }

    async fn domain_active(&self, name: &str) -> WindevResult<bool> {
        let output = self
            .runner
            .run(VIRSH_TOOL, &["-c", &self.uri, "domstate", name], None)
            .await?;
        if !output.success() {
            return Ok(false);
        }

        // A domain still holds its disk in every state short of being fully
        // off: "in shutdown", "paused", and "idle" all count as active. Only
        // a completed stop releases the image for offline work.
        let state = output.stdout_utf8();
        let state = state.trim();
        Ok(!matches!(state, "shut off" | "crashed"))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Picks the first free instance name of the form `<base>-<n>`, probing
/// suffixes upward from 1.
pub async fn find_instance_name(
    hypervisor: &dyn Hypervisor,
    base: &str,
) -> WindevResult<String> {
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !hypervisor.domain_exists(&candidate).await? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::process::testing::ScriptedRunner;

    struct FakeHypervisor {
        defined: HashSet<String>,
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn domain_exists(&self, name: &str) -> WindevResult<bool> {
            Ok(self.defined.contains(name))
        }

        async fn define_domain(&self, _: &str, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn start_domain(&self, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn reboot_domain(&self, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn shutdown_domain(&self, _: &str) -> WindevResult<()> {
            Ok(())
        }

        async fn domain_active(&self, _: &str) -> WindevResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_find_instance_name_skips_taken_suffixes() {
        let hypervisor = FakeHypervisor {
            defined: ["vm", "vm-1", "vm-2"]
                .into_iter()
                .map(String::from)
                .collect(),
        };

        let name = find_instance_name(&hypervisor, "vm").await.unwrap();
        assert_eq!(name, "vm-3");
    }

    #[tokio::test]
    async fn test_find_instance_name_starts_at_one() {
        let hypervisor = FakeHypervisor {
            defined: HashSet::new(),
        };

        let name = find_instance_name(&hypervisor, "vm").await.unwrap();
        assert_eq!(name, "vm-1");
    }

    #[tokio::test]
    async fn test_domain_exists_maps_exit_status() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure("error: failed to get domain 'devbox'");
        let hypervisor = VirshHypervisor::new(runner.clone(), "qemu:///system");

        assert!(!hypervisor.domain_exists("devbox").await.unwrap());
        let call = &runner.calls()[0];
        assert_eq!(call.args, vec!["-c", "qemu:///system", "dominfo", "devbox"]);
    }

    #[tokio::test]
    async fn test_domain_active_until_fully_off() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_success("running\n");
        runner.push_success("shut off\n");
        runner.push_success("crashed\n");
        let hypervisor = VirshHypervisor::new(runner, "qemu:///system");

        assert!(hypervisor.domain_active("devbox").await.unwrap());
        assert!(!hypervisor.domain_active("devbox").await.unwrap());
        assert!(!hypervisor.domain_active("devbox").await.unwrap());
    }

    #[tokio::test]
    async fn test_domain_shutting_down_is_still_active() {
        let runner = Arc::new(ScriptedRunner::new());
        // A cooperative shutdown in progress still holds the disk, as do
        // suspended states.
        runner.push_success("in shutdown\n");
        runner.push_success("paused\n");
        runner.push_success("idle\n");
        let hypervisor = VirshHypervisor::new(runner, "qemu:///system");

        assert!(hypervisor.domain_active("devbox").await.unwrap());
        assert!(hypervisor.domain_active("devbox").await.unwrap());
        assert!(hypervisor.domain_active("devbox").await.unwrap());
    }

    #[tokio::test]
    async fn test_domain_active_false_for_undefined_domain() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure("error: failed to get domain 'devbox'");
        let hypervisor = VirshHypervisor::new(runner, "qemu:///system");

        assert!(!hypervisor.domain_active("devbox").await.unwrap());
    }

    #[tokio::test]
    async fn test_define_domain_passes_descriptor_file() {
        let runner = Arc::new(ScriptedRunner::new());
        let hypervisor = VirshHypervisor::new(runner.clone(), "qemu:///system");

        hypervisor
            .define_domain("devbox", "<domain/>")
            .await
            .unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.args[2], "define");
        assert!(call.args[3].ends_with("devbox.xml"));
    }
}
