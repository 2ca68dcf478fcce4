//! Executor RPC client
//!
//! Every container exposes an executor service on a private TCP port.
//! The HTTP layer consumes it exclusively through the [`CodeExecutor`]
//! contract; [`HttpExecutor`] is the production implementation.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::errors::ServerError;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The submitted code raised; `trace` carries the remote traceback.
    #[error("{message}")]
    Execution { message: String, trace: String },

    #[error("Execution timed out")]
    Timeout,

    #[error("executor transport error: {0}")]
    Transport(String),
}

impl From<ExecError> for ServerError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Execution { message, trace } => {
                ServerError::ExecutionFailed { message, trace }
            }
            ExecError::Timeout => ServerError::Timeout("Execution timed out".to_string()),
            ExecError::Transport(detail) => ServerError::Internal(detail),
        }
    }
}

/// Result of a completed, non-streaming execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Combined stdout of the execution, if any was produced.
    pub text: Option<String>,
    /// Base64-encoded PNG images produced by the execution.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Lazy sequence of output chunks from a streaming execution.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<String, ExecError>> + Send>>;

/// Contract for submitting code blobs to a container's executor service.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Run `code` to completion and return its collected output.
    async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutput, ExecError>;

    /// Run `code` and stream its output incrementally. The stream ends on
    /// normal completion; errors and timeouts surface as `Err` items.
    async fn execute_stream(&self, code: &str, timeout: Duration)
        -> Result<OutputStream, ExecError>;
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    timeout: f64,
}

#[derive(Debug, Deserialize)]
struct ExecuteWire {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    trace: Option<String>,
}

/// Executor client speaking JSON over the container's executor port.
pub struct HttpExecutor {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CodeExecutor for HttpExecutor {
    async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionOutput, ExecError> {
        let request = self
            .client
            .post(format!("{}/execute", self.base_url))
            .json(&ExecuteRequest {
                code,
                timeout: timeout.as_secs_f64(),
            })
            .send();

        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| ExecError::Timeout)?
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        let wire: ExecuteWire = response
            .json()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        if let Some(message) = wire.error {
            return Err(ExecError::Execution {
                message,
                trace: wire.trace.unwrap_or_default(),
            });
        }

        Ok(ExecutionOutput {
            text: wire.text,
            images: wire.images,
        })
    }

    async fn execute_stream(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<OutputStream, ExecError> {
        let response = self
            .client
            .post(format!("{}/execute/stream", self.base_url))
            .json(&ExecuteRequest {
                code,
                timeout: timeout.as_secs_f64(),
            })
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecError::Transport(format!(
                "executor returned {}",
                response.status()
            )));
        }

        // Chunks arrive newline-delimited; lines are reassembled across
        // network reads before being forwarded downstream.
        let (tx, rx) = mpsc::channel::<Result<String, ExecError>>(64);
        let deadline = tokio::time::Instant::now() + timeout;
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut body = response.bytes_stream();
            let mut pending = Vec::new();
            loop {
                let chunk = match tokio::time::timeout_at(deadline, body.next()).await {
                    Err(_) => {
                        let _ = tx.send(Err(ExecError::Timeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        let _ = tx.send(Err(ExecError::Transport(err.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                pending.extend_from_slice(&chunk);
                while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line).trim_end().to_string();
                    if tx.send(Ok(line)).await.is_err() {
                        debug!("stream consumer dropped, stopping executor read");
                        return;
                    }
                }
            }
            // Flush a trailing partial line on normal end-of-stream.
            if !pending.is_empty() {
                let line = String::from_utf8_lossy(&pending).trim_end().to_string();
                let _ = tx.send(Ok(line)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_maps_to_server_error() {
        let err: ServerError = ExecError::Timeout.into();
        assert!(matches!(err, ServerError::Timeout(_)));

        let err: ServerError = ExecError::Execution {
            message: "NameError".to_string(),
            trace: "Traceback ...".to_string(),
        }
        .into();
        match err {
            ServerError::ExecutionFailed { message, trace } => {
                assert_eq!(message, "NameError");
                assert!(trace.starts_with("Traceback"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_execution_output_defaults() {
        let wire: ExecuteWire = serde_json::from_str(r#"{"text": "hi\n"}"#).expect("parses");
        assert_eq!(wire.text.as_deref(), Some("hi\n"));
        assert!(wire.images.is_empty());
        assert!(wire.error.is_none());
    }
}
