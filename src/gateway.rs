//! Subprocess realization of the [`CryptoEngine`] boundary
//!
//! # Protocol
//!
//! 1. Serialize the request to a `0600` temp file (`pqc-req-*.json`)
//! 2. Spawn `program [args..] <artifact-path>` with piped stdout/stderr
//! 3. Read both pipes (bounded) while waiting for exit, under a hard deadline
//! 4. On deadline: kill the process and report [`EngineFailure::Timeout`]
//! 5. Parse stdout as an [`EngineResponse`]
//!
//! The artifact is owned by a [`tempfile::NamedTempFile`] held for the whole
//! call, so it is removed on every exit path including spawn failure and
//! timeout. Stderr is only ever measured, never surfaced.

use crate::config::GatewaySettings;
use crate::engine::{
    CryptoEngine, EngineFailure, EngineOperation, EngineOutcome, EngineRequest, EngineResponse,
};
use crate::sanitize::SanitizedParams;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Stdio;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_REPORTED_MESSAGE_LEN: usize = 256;

lazy_static! {
    // Long base64/hex runs look like key material or ciphertext
    static ref KEY_MATERIAL: Regex = Regex::new(r"[A-Za-z0-9+/=_-]{32,}").expect("static regex");
}

/// Strip anything that looks like key material and cap the length
pub(crate) fn scrub_message(message: &str) -> String {
    let scrubbed = KEY_MATERIAL.replace_all(message, "[redacted]");
    scrubbed.chars().take(MAX_REPORTED_MESSAGE_LEN).collect()
}

pub struct ProcessEngine {
    settings: GatewaySettings,
}

impl ProcessEngine {
    pub fn new(settings: GatewaySettings) -> Self {
        ProcessEngine { settings }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Query engine health with the `get_status` operation
    pub async fn status(&self) -> EngineOutcome {
        self.invoke(EngineRequest::new(
            EngineOperation::GetStatus,
            SanitizedParams::default(),
        ))
        .await
    }

    fn write_artifact(&self, request: &EngineRequest) -> Result<NamedTempFile, EngineFailure> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pqc-req-").suffix(".json");
        let mut artifact = match &self.settings.work_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| EngineFailure::Artifact(format!("create: {}", e.kind())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(artifact.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| EngineFailure::Artifact(format!("chmod: {}", e.kind())))?;
        }

        serde_json::to_writer(artifact.as_file_mut(), request)
            .map_err(|e| EngineFailure::Artifact(format!("serialize: {}", e)))?;
        artifact
            .as_file_mut()
            .sync_all()
            .map_err(|e| EngineFailure::Artifact(format!("sync: {}", e.kind())))?;
        Ok(artifact)
    }

    async fn run(&self, request: &EngineRequest) -> EngineOutcome {
        let artifact = self.write_artifact(request)?;

        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .arg(artifact.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineFailure::SpawnFailed(e.kind().to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineFailure::SpawnFailed("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineFailure::SpawnFailed("stderr not captured".to_string()))?;

        let limit = self.settings.max_output_bytes;
        let waited = tokio::time::timeout(self.settings.timeout, async {
            tokio::join!(
                read_bounded(&mut stdout, limit),
                read_bounded(&mut stderr, limit),
                child.wait()
            )
        })
        .await;

        let ((out, out_exceeded), (err, _), status) = match waited {
            Ok(done) => done,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out engine process");
                }
                drop(artifact);
                return Err(EngineFailure::Timeout {
                    after: self.settings.timeout,
                });
            }
        };

        if let Err(e) = artifact.close() {
            warn!(error = %e.kind(), "Failed to remove engine parameter artifact");
        }

        let status = status.map_err(|_| EngineFailure::Exited { code: None })?;
        if !err.is_empty() {
            debug!(
                operation = %request.operation,
                stderr_bytes = err.len(),
                "Engine wrote to stderr"
            );
        }
        if out_exceeded {
            return Err(EngineFailure::OutputTooLarge { limit });
        }

        if out.iter().all(u8::is_ascii_whitespace) {
            return Err(if status.success() {
                EngineFailure::Malformed("empty response".to_string())
            } else {
                EngineFailure::Exited {
                    code: status.code(),
                }
            });
        }

        let response: EngineResponse = match serde_json::from_slice(&out) {
            Ok(response) => response,
            Err(_) if !status.success() => {
                return Err(EngineFailure::Exited {
                    code: status.code(),
                })
            }
            Err(e) => {
                return Err(EngineFailure::Malformed(format!(
                    "{:?} error at line {} column {}",
                    e.classify(),
                    e.line(),
                    e.column()
                )))
            }
        };

        if response.success {
            Ok(response)
        } else {
            Err(EngineFailure::Reported {
                code: response.error_code.as_deref().map(scrub_message),
                message: scrub_message(
                    response
                        .error_message
                        .as_deref()
                        .unwrap_or("engine reported failure"),
                ),
            })
        }
    }
}

#[async_trait]
impl CryptoEngine for ProcessEngine {
    async fn invoke(&self, request: EngineRequest) -> EngineOutcome {
        let started = Instant::now();
        metrics::increment_gauge!("pqc_engine_inflight", 1.0);
        let _inflight = scopeguard::guard((), |_| {
            metrics::decrement_gauge!("pqc_engine_inflight", 1.0);
        });

        let outcome = self.run(&request).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!(
            "pqc_engine_latency_ms",
            elapsed_ms,
            "operation" => request.operation.as_str()
        );
        metrics::increment_counter!(
            "pqc_engine_invocations_total",
            "operation" => request.operation.as_str(),
            "outcome" => match &outcome {
                Ok(_) => "ok",
                Err(failure) => failure.kind(),
            }
        );
        debug!(
            operation = %request.operation,
            request_id = %request.request_id,
            elapsed_ms,
            ok = outcome.is_ok(),
            "Engine invocation finished"
        );
        outcome
    }

    fn name(&self) -> &str {
        "process"
    }
}

/// Read a pipe to EOF keeping at most `limit` bytes; the rest is drained so the
/// child never blocks on a full pipe
async fn read_bounded<R>(reader: &mut R, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    let mut exceeded = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if exceeded {
                    continue;
                }
                if buf.len() + n > limit {
                    let remaining = limit.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..remaining]);
                    exceeded = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
    (buf, exceeded)
}
