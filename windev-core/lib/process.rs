//! Narrow external-process execution boundary.
//!
//! Every external tool the provisioning engine touches (qemu-img, qemu-nbd,
//! fdisk, tsk_loaddb, mount/umount, hivexsh, virsh) is invoked through the
//! [`ProcessRunner`] trait so the whole orchestrator can be exercised against
//! a scripted fake without any of those binaries present.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code of the process, `-1` if it was terminated by a signal.
    pub status: i32,

    /// Captured standard output.
    pub stdout: Vec<u8>,

    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Standard output decoded as UTF-8, lossily.
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded as UTF-8, lossily.
    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Executes external commands on behalf of the provisioning engine.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `tool` with `args`, optionally feeding `stdin`, and captures the
    /// full output. A non-zero exit is not an error at this level; callers
    /// decide how to interpret the status.
    async fn run(
        &self,
        tool: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> WindevResult<ToolOutput>;

    /// Runs `tool` with `args` and fails with
    /// [`WindevError::ToolInvocation`] on a non-zero exit.
    async fn run_checked(&self, tool: &str, args: &[&str]) -> WindevResult<ToolOutput> {
        let output = self.run(tool, args, None).await?;
        if !output.success() {
            return Err(WindevError::ToolInvocation {
                tool: tool.to_string(),
                stderr: output.stderr_utf8(),
            });
        }
        Ok(output)
    }
}

/// Production [`ProcessRunner`] backed by [`tokio::process::Command`].
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(
        &self,
        tool: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> WindevResult<ToolOutput> {
        tracing::debug!("running {} {:?}", tool, args);

        let mut command = Command::new(tool);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| WindevError::ToolSpawn {
            tool: tool.to_string(),
            source,
        })?;

        if let Some(input) = stdin {
            // Take the handle so it is closed before we wait, otherwise the
            // child may block reading stdin forever.
            let mut handle = child.stdin.take().ok_or_else(|| {
                WindevError::InvalidArgument(format!("{tool}: stdin handle unavailable"))
            })?;
            handle.write_all(input).await?;
            drop(handle);
        }

        let output = child.wait_with_output().await?;

        Ok(ToolOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Test support
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// One recorded invocation of the fake runner.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub tool: String,
        pub args: Vec<String>,
        pub stdin: Option<Vec<u8>>,
    }

    /// A [`ProcessRunner`] that replays a scripted queue of outputs and
    /// records every invocation it receives.
    #[derive(Debug, Default)]
    pub struct ScriptedRunner {
        responses: Mutex<VecDeque<ToolOutput>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_output(&self, status: i32, stdout: &str, stderr: &str) {
            self.responses.lock().unwrap().push_back(ToolOutput {
                status,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            });
        }

        pub fn push_success(&self, stdout: &str) {
            self.push_output(0, stdout, "");
        }

        pub fn push_failure(&self, stderr: &str) {
            self.push_output(1, "", stderr);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self, tool: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.tool == tool)
                .count()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            tool: &str,
            args: &[&str],
            stdin: Option<&[u8]>,
        ) -> WindevResult<ToolOutput> {
            self.calls.lock().unwrap().push(RecordedCall {
                tool: tool.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                stdin: stdin.map(|s| s.to_vec()),
            });

            // An exhausted script answers with a clean empty success so
            // incidental calls do not need explicit entries.
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ToolOutput {
                    status: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }))
        }
    }
}
