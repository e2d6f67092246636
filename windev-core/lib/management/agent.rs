//! Guest agent command channel.
//!
//! Commands run inside a booted guest through the hypervisor's agent socket:
//! a request is submitted as JSON over `virsh qemu-agent-command`, the agent
//! answers with a process id, and completion is observed by polling the exec
//! status until the process has exited. During early boot the agent is not up
//! yet and submissions are rejected; rejection is retryable with a fixed
//! backoff, and every retry is a fresh submission with a fresh process id.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::process::ProcessRunner;
use crate::utils::path::VIRSH_TOOL;
use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Interval between exec-status polls for a submitted command.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bytes of file content carried per guest-file-write request, pre-encoding.
const FILE_WRITE_CHUNK: usize = 4096;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A request submitted to the guest agent.
#[derive(Debug, Serialize)]
#[serde(tag = "execute", content = "arguments")]
pub enum AgentRequest<'a> {
    /// Starts a process in the guest.
    #[serde(rename = "guest-exec")]
    Exec {
        /// Program path inside the guest.
        path: &'a str,
        /// Program arguments.
        arg: &'a [String],
        /// Whether to capture stdout/stderr for later retrieval.
        #[serde(rename = "capture-output")]
        capture_output: bool,
    },

    /// Queries the status of a previously started process.
    #[serde(rename = "guest-exec-status")]
    ExecStatus {
        /// Process id returned by the exec submission.
        pid: i64,
    },

    /// Opens a file inside the guest.
    #[serde(rename = "guest-file-open")]
    FileOpen {
        /// Guest file path.
        path: &'a str,
        /// fopen-style mode string.
        mode: &'a str,
    },

    /// Writes a base64 chunk to an open guest file.
    #[serde(rename = "guest-file-write")]
    FileWrite {
        /// Handle from the file-open reply.
        handle: i64,
        /// Base64-encoded chunk.
        #[serde(rename = "buf-b64")]
        buf_b64: String,
    },

    /// Closes an open guest file.
    #[serde(rename = "guest-file-close")]
    FileClose {
        /// Handle from the file-open reply.
        handle: i64,
    },
}

/// Agent reply wrapper.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "return")]
    ret: T,
}

#[derive(Debug, Deserialize)]
struct ExecSubmitted {
    pid: i64,
}

#[derive(Debug, Deserialize)]
struct FileOpened(i64);

/// Raw exec-status reply. Output fields are absent until the process exits
/// and may be absent afterwards when a stream produced no bytes.
#[derive(Debug, Deserialize)]
struct ExecStatus {
    exited: bool,
    exitcode: Option<i32>,
    #[serde(rename = "out-data")]
    out_data: Option<String>,
    #[serde(rename = "err-data")]
    err_data: Option<String>,
}

/// Decoded result of a completed guest command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Guest process exit code.
    pub exit_code: i32,

    /// Decoded standard output.
    pub stdout: String,

    /// Decoded standard error.
    pub stderr: String,
}

/// JSON command channel to a guest's agent socket.
pub struct GuestChannel {
    runner: Arc<dyn ProcessRunner>,
    uri: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GuestChannel {
    /// Creates a channel speaking to the hypervisor at `uri`.
    pub fn new(runner: Arc<dyn ProcessRunner>, uri: impl Into<String>) -> Self {
        Self {
            runner,
            uri: uri.into(),
        }
    }

    /// Submits a request and parses the typed reply.
    ///
    /// Any failure shape here (non-zero exit, agent error text, unparseable
    /// reply) is reported as a rejected submission, which callers treat as
    /// retryable: an agent that is not up yet produces exactly these shapes.
    async fn submit<T: DeserializeOwned>(
        &self,
        domain: &str,
        request: &AgentRequest<'_>,
    ) -> WindevResult<T> {
        let payload = serde_json::to_string(request)?;
        let output = self
            .runner
            .run(
                VIRSH_TOOL,
                &["-c", &self.uri, "qemu-agent-command", domain, &payload],
                None,
            )
            .await?;

        if !output.success() || !output.stderr.is_empty() {
            return Err(WindevError::SubmissionRejected(output.stderr_utf8()));
        }

        let envelope: Envelope<T> = serde_json::from_slice(&output.stdout)
            .map_err(|_| WindevError::SubmissionRejected(output.stdout_utf8()))?;
        Ok(envelope.ret)
    }

    /// Polls the status of a submitted process once.
    async fn poll(&self, domain: &str, pid: i64) -> WindevResult<ExecStatus> {
        let payload = serde_json::to_string(&AgentRequest::ExecStatus { pid })?;
        let output = self
            .runner
            .run_checked(
                VIRSH_TOOL,
                &["-c", &self.uri, "qemu-agent-command", domain, &payload],
            )
            .await?;

        let envelope: Envelope<ExecStatus> = serde_json::from_slice(&output.stdout)
            .map_err(|_| WindevError::MalformedAgentResponse(output.stdout_utf8()))?;
        Ok(envelope.ret)
    }

    /// Runs a command in the guest, retrying rejected submissions with a
    /// fixed `backoff`, then polling until the process exits.
    ///
    /// A retried submission is a brand new process with a brand new pid;
    /// only the final accepted submission is ever polled.
    pub async fn exec_with_retry(
        &self,
        domain: &str,
        path: &str,
        args: &[String],
        backoff: Duration,
    ) -> WindevResult<CommandOutput> {
        let request = AgentRequest::Exec {
            path,
            arg: args,
            capture_output: true,
        };

        let pid = loop {
            match self.submit::<ExecSubmitted>(domain, &request).await {
                Ok(submitted) => break submitted.pid,
                Err(WindevError::SubmissionRejected(reason)) => {
                    tracing::debug!("agent rejected exec on {domain}: {}", reason.trim());
                    tokio::time::sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        };

        tracing::debug!("guest {domain} accepted {path}, pid {pid}");

        loop {
            let status = self.poll(domain, pid).await?;
            if status.exited {
                return Ok(decode_output(&status));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Writes `content` to `guest_path` inside the guest through the agent's
    /// file interface, truncating any existing file.
    pub async fn copy_file(
        &self,
        domain: &str,
        guest_path: &str,
        content: &[u8],
    ) -> WindevResult<()> {
        let FileOpened(handle) = self
            .submit(
                domain,
                &AgentRequest::FileOpen {
                    path: guest_path,
                    mode: "wb",
                },
            )
            .await?;

        for chunk in content.chunks(FILE_WRITE_CHUNK) {
            let written = self
                .submit::<serde_json::Value>(
                    domain,
                    &AgentRequest::FileWrite {
                        handle,
                        buf_b64: BASE64.encode(chunk),
                    },
                )
                .await;
            if let Err(err) = written {
                // The handle must not outlive a failed transfer; an open
                // handle stays leaked inside the guest until reboot.
                let _ = self
                    .submit::<serde_json::Value>(domain, &AgentRequest::FileClose { handle })
                    .await;
                return Err(err);
            }
        }

        self.submit::<serde_json::Value>(domain, &AgentRequest::FileClose { handle })
            .await?;

        tracing::info!(
            "copied {} byte(s) to {guest_path} on {domain}",
            content.len()
        );
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Decodes captured output streams from a finished exec status.
///
/// The streams are decoded independently: a corrupt or missing stdout never
/// suppresses a usable stderr, and vice versa.
fn decode_output(status: &ExecStatus) -> CommandOutput {
    CommandOutput {
        exit_code: status.exitcode.unwrap_or(-1),
        stdout: decode_stream("out-data", status.out_data.as_deref()),
        stderr: decode_stream("err-data", status.err_data.as_deref()),
    }
}

fn decode_stream(label: &str, encoded: Option<&str>) -> String {
    let Some(encoded) = encoded else {
        return String::new();
    };
    match BASE64.decode(encoded) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                tracing::warn!("guest {label} is not valid UTF-8, dropping it");
                String::new()
            }
        },
        Err(_) => {
            tracing::warn!("guest {label} is not valid base64, dropping it");
            String::new()
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
