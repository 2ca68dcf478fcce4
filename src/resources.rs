//! Resource RPC client
//!
//! The second private TCP service of every container handles file and
//! directory transfer, firewall initialization, and MCP source
//! generation. Handlers consume it through [`ContainerResources`];
//! [`HttpResources`] is the production implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::errors::ServerError;
use crate::mcp::types::ToolDescriptor;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{0}")]
    NotFound(String),

    #[error("resource operation failed: {0}")]
    Failed(String),

    #[error("resource transport error: {0}")]
    Transport(String),
}

impl From<ResourceError> for ServerError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::NotFound(detail) => ServerError::NotFound(detail),
            ResourceError::Failed(detail) => ServerError::Internal(detail),
            ResourceError::Transport(detail) => ServerError::Internal(detail),
        }
    }
}

/// Contract for a container's resource service.
#[async_trait]
pub trait ContainerResources: Send + Sync {
    async fn upload_file(&self, relpath: &str, data: Bytes) -> Result<(), ResourceError>;

    async fn download_file(&self, relpath: &str) -> Result<Bytes, ResourceError>;

    async fn delete_file(&self, relpath: &str) -> Result<(), ResourceError>;

    /// Upload a gzipped tar archive to be unpacked under `relpath`.
    async fn upload_directory(&self, relpath: &str, archive: Bytes) -> Result<(), ResourceError>;

    /// Download `relpath` as a gzipped tar archive.
    async fn download_directory(&self, relpath: &str) -> Result<Bytes, ResourceError>;

    /// Restrict the container's outbound network to the given domains.
    async fn init_firewall(&self, allowed_domains: &[String]) -> Result<(), ResourceError>;

    /// Run the generator for an MCP server and materialise callable
    /// sources under `relpath/server_name/<tool>`. Returns the tool names.
    /// Re-running with identical params converges to the same state.
    async fn generate_mcp_sources(
        &self,
        relpath: &str,
        server_name: &str,
        server_params: &Value,
    ) -> Result<Vec<String>, ResourceError>;

    /// Fetch descriptors for the tools previously generated for a server.
    async fn get_mcp_sources(
        &self,
        relpath: &str,
        server_name: &str,
    ) -> Result<BTreeMap<String, ToolDescriptor>, ResourceError>;
}

#[derive(Debug, Deserialize)]
struct GenerateWire {
    tool_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SourcesWire {
    tools: BTreeMap<String, ToolDescriptor>,
}

/// Resource client speaking JSON and raw bytes over the resource port.
pub struct HttpResources {
    base_url: String,
    client: reqwest::Client,
}

impl HttpResources {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            client: reqwest::Client::new(),
        }
    }

    async fn check(&self, response: reqwest::Response, what: &str) -> Result<reqwest::Response, ResourceError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ResourceError::NotFound(format!("{what} not found")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ResourceError::Failed(format!("{what}: {status} {detail}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ContainerResources for HttpResources {
    async fn upload_file(&self, relpath: &str, data: Bytes) -> Result<(), ResourceError> {
        let response = self
            .client
            .put(format!("{}/files/{relpath}", self.base_url))
            .body(data)
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        self.check(response, &format!("upload of {relpath}")).await?;
        Ok(())
    }

    async fn download_file(&self, relpath: &str) -> Result<Bytes, ResourceError> {
        let response = self
            .client
            .get(format!("{}/files/{relpath}", self.base_url))
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        let response = self.check(response, &format!("file {relpath}")).await?;
        response
            .bytes()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))
    }

    async fn delete_file(&self, relpath: &str) -> Result<(), ResourceError> {
        let response = self
            .client
            .delete(format!("{}/files/{relpath}", self.base_url))
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        self.check(response, &format!("file {relpath}")).await?;
        Ok(())
    }

    async fn upload_directory(&self, relpath: &str, archive: Bytes) -> Result<(), ResourceError> {
        let response = self
            .client
            .put(format!("{}/directories/{relpath}", self.base_url))
            .body(archive)
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        self.check(response, &format!("upload of directory {relpath}"))
            .await?;
        Ok(())
    }

    async fn download_directory(&self, relpath: &str) -> Result<Bytes, ResourceError> {
        let response = self
            .client
            .get(format!("{}/directories/{relpath}", self.base_url))
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        let response = self
            .check(response, &format!("directory {relpath}"))
            .await?;
        response
            .bytes()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))
    }

    async fn init_firewall(&self, allowed_domains: &[String]) -> Result<(), ResourceError> {
        let response = self
            .client
            .post(format!("{}/firewall", self.base_url))
            .json(&json!({ "allowed_domains": allowed_domains }))
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        self.check(response, "firewall initialization").await?;
        Ok(())
    }

    async fn generate_mcp_sources(
        &self,
        relpath: &str,
        server_name: &str,
        server_params: &Value,
    ) -> Result<Vec<String>, ResourceError> {
        let response = self
            .client
            .put(format!("{}/mcp/{server_name}", self.base_url))
            .query(&[("relpath", relpath)])
            .json(server_params)
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        let response = self
            .check(response, &format!("generation for server {server_name}"))
            .await?;
        let wire: GenerateWire = response
            .json()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        Ok(wire.tool_names)
    }

    async fn get_mcp_sources(
        &self,
        relpath: &str,
        server_name: &str,
    ) -> Result<BTreeMap<String, ToolDescriptor>, ResourceError> {
        let response = self
            .client
            .get(format!("{}/mcp/{server_name}", self.base_url))
            .query(&[("relpath", relpath)])
            .send()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        let response = self
            .check(response, &format!("MCP server {server_name}"))
            .await?;
        let wire: SourcesWire = response
            .json()
            .await
            .map_err(|err| ResourceError::Transport(err.to_string()))?;
        Ok(wire.tools)
    }
}
