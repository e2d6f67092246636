//! Offline registry patching.
//!
//! Customization mutates the guest's SOFTWARE hive while the image is
//! mounted and the domain is not running. Mutations are queued against a
//! [`Hive`] and written in a single explicit commit; a crash at any point
//! before commit leaves the hive file untouched. The production hive is
//! edited through `hivexsh -w`, hivex's scripting shell, which itself only
//! writes on its `commit` command.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::management::lineage::path_arg;
use crate::process::ProcessRunner;
use crate::utils::path::HIVEXSH_TOOL;
use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Registry key holding the legacy elevation-prompting policy.
pub const ELEVATION_POLICY_KEY: [&str; 5] = [
    "Microsoft",
    "Windows",
    "CurrentVersion",
    "Policies",
    "System",
];

/// The boolean policy value controlling legacy elevation prompting.
pub const ELEVATION_POLICY_VALUE: &str = "EnableLUA";

/// Registry key whose values run exactly once at next logon.
pub const RUN_ONCE_KEY: [&str; 4] = ["Microsoft", "Windows", "CurrentVersion", "RunOnce"];

/// Name of the one-shot startup value written by the patcher.
pub const ONE_SHOT_VALUE_NAME: &str = "WindevBootstrap";

/// REG_SZ value type tag.
pub const REG_SZ: u32 = 1;

/// REG_DWORD value type tag.
pub const REG_DWORD: u32 = 4;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Payload of a registry value mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryData {
    /// A 32-bit little-endian DWORD.
    Dword(u32),
    /// A UTF-16LE string.
    Sz(String),
}

/// A named registry value to be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryValue {
    /// Value name.
    pub name: String,

    /// Value payload.
    pub data: RegistryData,
}

impl RegistryValue {
    /// A REG_DWORD value.
    pub fn dword(name: impl Into<String>, value: u32) -> Self {
        Self {
            name: name.into(),
            data: RegistryData::Dword(value),
        }
    }

    /// A REG_SZ value.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RegistryData::Sz(value.into()),
        }
    }

    /// The registry value type tag.
    pub fn value_type(&self) -> u32 {
        match self.data {
            RegistryData::Dword(_) => REG_DWORD,
            RegistryData::Sz(_) => REG_SZ,
        }
    }

    /// The raw on-hive byte encoding of the payload.
    pub fn raw_bytes(&self) -> Vec<u8> {
        match &self.data {
            RegistryData::Dword(v) => v.to_le_bytes().to_vec(),
            RegistryData::Sz(s) => {
                // UTF-16LE with a terminating NUL.
                s.encode_utf16()
                    .chain(std::iter::once(0u16))
                    .flat_map(|u| u.to_le_bytes())
                    .collect()
            }
        }
    }
}

/// An open registry hive accepting queued mutations and an explicit,
/// all-or-nothing commit.
///
/// Implementations must not touch the hive file before [`Hive::commit`] is
/// called; every key walk and value write happens inside the commit.
#[async_trait]
pub trait Hive: Send {
    /// Queues setting `value` under the key reached by walking the named
    /// child nodes in `key_path` from the hive root.
    fn set_value(&mut self, key_path: &[&str], value: RegistryValue) -> WindevResult<()>;

    /// Applies every queued mutation and finalizes the hive.
    async fn commit(&mut self) -> WindevResult<()>;
}

#[async_trait]
impl<H: Hive> Hive for &mut H {
    fn set_value(&mut self, key_path: &[&str], value: RegistryValue) -> WindevResult<()> {
        (**self).set_value(key_path, value)
    }

    async fn commit(&mut self) -> WindevResult<()> {
        (**self).commit().await
    }
}

/// [`Hive`] implementation driving `hivexsh -w` over stdin.
///
/// Queued mutations are rendered as one script whose final command is
/// `commit`; hivexsh never writes to the hive file before that command, so
/// a failure anywhere earlier leaves the hive unmodified.
pub struct HivexShellHive {
    runner: Arc<dyn ProcessRunner>,
    hive_path: PathBuf,
    pending: Vec<(Vec<String>, RegistryValue)>,
}

impl HivexShellHive {
    /// Opens a hive file for deferred read-write editing.
    pub fn new(runner: Arc<dyn ProcessRunner>, hive_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            hive_path: hive_path.into(),
            pending: Vec::new(),
        }
    }

    /// Renders the queued mutations as a hivexsh script.
    fn render_script(&self) -> String {
        let mut script = String::new();
        for (key_path, value) in &self.pending {
            // Absolute walk from the root for every mutation.
            script.push_str(&format!("cd \\{}\n", key_path.join("\\")));
            script.push_str("setval 1\n");
            script.push_str(&format!("{}\n", value.name));
            match &value.data {
                RegistryData::Dword(v) => script.push_str(&format!("dword:{v}\n")),
                RegistryData::Sz(s) => script.push_str(&format!("string:{s}\n")),
            }
        }
        script.push_str("commit\nexit\n");
        script
    }
}

#[async_trait]
impl Hive for HivexShellHive {
    fn set_value(&mut self, key_path: &[&str], value: RegistryValue) -> WindevResult<()> {
        if key_path.is_empty() {
            return Err(WindevError::InvalidArgument(
                "registry key path must not be empty".to_string(),
            ));
        }
        self.pending
            .push((key_path.iter().map(|s| s.to_string()).collect(), value));
        Ok(())
    }

    async fn commit(&mut self) -> WindevResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let script = self.render_script();
        let hive_str = path_arg(&self.hive_path)?;
        let output = self
            .runner
            .run(HIVEXSH_TOOL, &["-w", &hive_str], Some(script.as_bytes()))
            .await?;

        if !output.success() {
            return Err(WindevError::ToolInvocation {
                tool: HIVEXSH_TOOL.to_string(),
                stderr: output.stderr_utf8(),
            });
        }

        tracing::info!(
            "committed {} registry mutation(s) to {}",
            self.pending.len(),
            self.hive_path.display()
        );
        self.pending.clear();
        Ok(())
    }
}

/// Applies the two customization intents to an offline guest filesystem.
///
/// Both intents are idempotent: re-applying them writes the same values.
pub struct RegistryPatcher<H: Hive> {
    hive: H,
}

impl<H: Hive> RegistryPatcher<H> {
    /// Wraps an open SOFTWARE hive.
    pub fn new(hive: H) -> Self {
        Self { hive }
    }

    /// Clears the legacy elevation-prompting policy flag.
    pub fn disable_legacy_elevation_prompting(&mut self) -> WindevResult<()> {
        self.hive.set_value(
            &ELEVATION_POLICY_KEY,
            RegistryValue::dword(ELEVATION_POLICY_VALUE, 0),
        )
    }

    /// Schedules `command_path` to run exactly once at next logon.
    pub fn schedule_one_shot_startup(&mut self, command_path: &str) -> WindevResult<()> {
        self.hive.set_value(
            &RUN_ONCE_KEY,
            RegistryValue::string(ONE_SHOT_VALUE_NAME, command_path),
        )
    }

    /// Commits all queued patches in one finalize step.
    pub async fn commit(mut self) -> WindevResult<()> {
        self.hive.commit().await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
