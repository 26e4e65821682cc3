//! Producing encoded audio for a job.

use crate::config::AcquisitionConfig;
use crate::error::AcquireError;
use crate::model::JobRequest;
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Fetches and encodes the audio for a request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioAcquirer: Send + Sync {
    async fn acquire(&self, request: &JobRequest) -> Result<Bytes, AcquireError>;
}

/// Runs an external program and takes its stdout as the encoded track.
///
/// `{url}` and `{song_id}` in the arguments are substituted per request.
#[derive(Debug, Clone)]
pub struct CommandAcquirer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAcquirer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn args_for(&self, request: &JobRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &request.url)
                    .replace("{song_id}", &request.song_id)
            })
            .collect()
    }
}

#[async_trait]
impl AudioAcquirer for CommandAcquirer {
    #[instrument(skip(self, request), fields(song_id = %request.song_id, program = %self.program))]
    async fn acquire(&self, request: &JobRequest) -> Result<Bytes, AcquireError> {
        let child = Command::new(&self.program)
            .args(self.args_for(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AcquireError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AcquireError::Timeout {
                program: self.program.clone(),
                after: self.timeout,
            })?
            .map_err(|source| AcquireError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AcquireError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(512).collect(),
            });
        }

        if output.stdout.is_empty() {
            return Err(AcquireError::Empty {
                program: self.program.clone(),
            });
        }

        debug!(size_bytes = output.stdout.len(), "Audio acquired");
        Ok(Bytes::from(output.stdout))
    }
}
