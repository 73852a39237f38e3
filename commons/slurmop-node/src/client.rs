use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use kube::{
    Client,
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
};
use serde_json::json;
use tracing::{debug, info};

use crate::conditions::{ConditionUpdate, apply_condition};
use crate::stats::StatsSummary;

/// Node-level operations against the cluster API.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, kube::Error>;

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error>;

    /// Writes `node.status.conditions`, guarded by the node's resource
    /// version.
    async fn update_conditions(&self, node: &Node) -> Result<(), kube::Error>;

    /// Deletes the node object. A node that is already gone is not an error.
    async fn delete_node(&self, name: &str) -> Result<(), kube::Error>;

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<(), kube::Error>;

    async fn set_taints(
        &self,
        name: &str,
        taints: Vec<Taint>,
    ) -> Result<(), kube::Error>;

    async fn list_pods_on_node(&self, name: &str)
    -> Result<Vec<Pod>, kube::Error>;

    async fn stats_summary(&self, name: &str)
    -> Result<StatsSummary, kube::Error>;
}

#[derive(Clone)]
pub struct KubeNodeClient {
    client: Client,
}

impl KubeNodeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, kube::Error> {
        self.nodes().get_opt(name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, kube::Error> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn update_conditions(&self, node: &Node) -> Result<(), kube::Error> {
        let name = node.metadata.name.clone().unwrap_or_default();
        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let patch = json!({
            "metadata": {"resourceVersion": node.metadata.resource_version},
            "status": {"conditions": conditions},
        });
        self.nodes()
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), kube::Error> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = %name, "node deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(node = %name, "node already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_unschedulable(
        &self,
        name: &str,
        unschedulable: bool,
    ) -> Result<(), kube::Error> {
        let patch = json!({"spec": {"unschedulable": unschedulable}});
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_taints(
        &self,
        name: &str,
        taints: Vec<Taint>,
    ) -> Result<(), kube::Error> {
        let patch = json!({"spec": {"taints": taints}});
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods_on_node(
        &self,
        name: &str,
    ) -> Result<Vec<Pod>, kube::Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={name}"));
        Ok(pods.list(&lp).await?.items)
    }

    async fn stats_summary(
        &self,
        name: &str,
    ) -> Result<StatsSummary, kube::Error> {
        let req = http::Request::get(format!(
            "/api/v1/nodes/{name}/proxy/stats/summary"
        ))
        .body(Vec::new())
        .map_err(kube::Error::HttpError)?;
        self.client.request::<StatsSummary>(req).await
    }
}

/// Writes one condition onto a node.
///
/// A node that no longer exists is skipped. If the condition already has the
/// requested status and reason only its heartbeat moves.
pub async fn set_node_condition(
    client: &dyn NodeClient,
    node_name: &str,
    update: &ConditionUpdate,
) -> Result<(), kube::Error> {
    let Some(mut node) = client.get_node(node_name).await? else {
        debug!(node = %node_name, condition = %update.type_, "node not found, skipping condition update");
        return Ok(());
    };
    let status = node.status.get_or_insert_with(Default::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    apply_condition(conditions, update, Utc::now());
    client.update_conditions(&node).await?;
    info!(
        node = %node_name,
        condition = %update.type_,
        status = update.status,
        reason = %update.reason,
        "node condition set"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{find_condition, reasons, types};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_node_is_skipped() {
        let mut client = MockNodeClient::new();
        client.expect_get_node().returning(|_| Ok(None));
        client.expect_update_conditions().never();

        let update = ConditionUpdate::new(types::DRAIN, true, reasons::NEED_DRAIN, "");
        set_node_condition(&client, "node-a", &update).await.unwrap();
    }

    #[tokio::test]
    async fn condition_is_appended_and_written() {
        let mut client = MockNodeClient::new();
        client
            .expect_get_node()
            .withf(|n| n == "node-a")
            .returning(|n| Ok(Some(node(n))));
        client
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::REBOOT)
                    .is_some_and(|c| c.reason.as_deref() == Some(reasons::NEED_REBOOT))
            })
            .times(1)
            .returning(|_| Ok(()));

        let update =
            ConditionUpdate::new(types::REBOOT, true, reasons::NEED_REBOOT, "");
        set_node_condition(&client, "node-a", &update).await.unwrap();
    }
}
