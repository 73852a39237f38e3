use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde_json::json;
use tracing::debug;

use crate::Error;
use crate::node::{ClusterKey, NodesResponse, SlurmNode, UpdateResponse};

const TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";

/// Per-cluster scheduler operations used by the node health checks.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait SlurmApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<SlurmNode>, Error>;

    async fn get_node(&self, name: &str) -> Result<SlurmNode, Error>;

    /// Puts the node into DRAIN with the given reason. Returns as soon as the
    /// request is accepted; the drain itself completes asynchronously.
    async fn drain_node(&self, name: &str, reason: &str) -> Result<(), Error>;

    async fn resume_node(&self, name: &str) -> Result<(), Error>;

    /// Creates a maintenance reservation holding only `node`, starting now
    /// with no end, so the node accepts no new work while staying resumable.
    async fn create_reservation(
        &self,
        reservation: &str,
        node: &str,
    ) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct RestClientConfig {
    pub cluster: ClusterKey,
    pub base_url: String,
    pub api_version: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    cluster: ClusterKey,
    base_url: String,
    api_version: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(cfg: RestClientConfig) -> Result<Self, Error> {
        if cfg.base_url.is_empty() {
            return Err(Error::Config(format!(
                "empty base url for cluster {}",
                cfg.cluster
            )));
        }
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            http,
            cluster: cfg.cluster,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_version: cfg.api_version,
            token: cfg.token,
        })
    }

    /// Conventional in-cluster address of a cluster's REST service.
    pub fn service_url(cluster: &ClusterKey, port: u16) -> String {
        format!("http://{}-rest.{}:{}", cluster.name, cluster.namespace, port)
    }

    fn path(&self, suffix: &str) -> String {
        format!("/slurm/{}/{}", self.api_version, suffix)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let rb = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => rb.header(TOKEN_HEADER, token),
            None => rb,
        }
    }

    async fn fetch_nodes(&self, path: &str) -> Result<Vec<SlurmNode>, Error> {
        let resp = self.request(reqwest::Method::GET, path).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: NodesResponse = resp.json().await?;
        if !body.errors.is_empty() {
            return Err(api_error(path, &body.errors));
        }
        Ok(body
            .nodes
            .into_iter()
            .map(|n| n.into_node(&self.cluster))
            .collect())
    }

    async fn update_node(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), Error> {
        let path = self.path(&format!("node/{name}"));
        self.post(path, payload).await
    }

    /// Posts `payload` and checks the reply. An empty body counts as success;
    /// anything else must decode to the update response.
    async fn post(
        &self,
        path: String,
        payload: serde_json::Value,
    ) -> Result<(), Error> {
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                path,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let body: UpdateResponse = serde_json::from_str(&text)
            .map_err(|source| Error::Decode {
                path: path.clone(),
                source,
            })?;
        if !body.errors.is_empty() {
            return Err(api_error(&path, &body.errors));
        }
        Ok(())
    }
}

fn api_error(path: &str, errors: &[crate::node::ApiError]) -> Error {
    let messages = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Error::Api {
        path: path.to_string(),
        messages,
    }
}

#[async_trait]
impl SlurmApi for RestClient {
    async fn list_nodes(&self) -> Result<Vec<SlurmNode>, Error> {
        let path = self.path("nodes");
        let nodes = self.fetch_nodes(&path).await?;
        debug!(cluster = %self.cluster, count = nodes.len(), "listed scheduler nodes");
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<SlurmNode, Error> {
        let path = self.path(&format!("node/{name}"));
        self.fetch_nodes(&path)
            .await?
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    async fn drain_node(&self, name: &str, reason: &str) -> Result<(), Error> {
        debug!(cluster = %self.cluster, node = %name, %reason, "draining scheduler node");
        self.update_node(name, json!({"state": ["DRAIN"], "reason": reason}))
            .await
    }

    async fn resume_node(&self, name: &str) -> Result<(), Error> {
        debug!(cluster = %self.cluster, node = %name, "resuming scheduler node");
        self.update_node(name, json!({"state": ["RESUME"]})).await
    }

    async fn create_reservation(
        &self,
        reservation: &str,
        node: &str,
    ) -> Result<(), Error> {
        debug!(cluster = %self.cluster, node = %node, %reservation, "creating maintenance reservation");
        let payload = json!({
            "name": reservation,
            "node_list": [node],
            "flags": ["MAINT", "IGNORE_JOBS"],
            "users": ["root"],
            "start_time": {"set": true, "number": Utc::now().timestamp()},
            "duration": {"set": false, "infinite": true},
        });
        self.post(self.path("reservation"), payload).await
    }
}
