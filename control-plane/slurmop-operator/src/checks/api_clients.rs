//! Keeps one scheduler REST client per `SlurmCluster` in the shared
//! [`ClientSet`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::{
    Controller, WatchStreamExt, controller, predicates, reflector, watcher,
};
use kube::{Api, Resource, ResourceExt};
use slurmop_slurm::{ClusterKey, RestClient, RestClientConfig};
use tracing::{Span, debug, info, instrument, warn};

use crate::checks::ChecksContext;
use crate::config::SlurmConfig;
use crate::controller::{
    object_key, requeue_with_backoff, scoped, with_deadline,
};
use crate::crd::{SecretKeyRef, SlurmCluster, SlurmClusterSpec};
use crate::{Error, Result};

/// Client settings for a cluster, or `None` when its REST API is off.
pub fn client_config(
    key: &ClusterKey,
    spec: &SlurmClusterSpec,
    slurm: &SlurmConfig,
    token: Option<String>,
) -> Option<RestClientConfig> {
    let rest = spec.rest_api.as_ref().filter(|r| r.enabled)?;
    let port = rest.port.unwrap_or(slurm.rest_port);
    Some(RestClientConfig {
        cluster: key.clone(),
        base_url: RestClient::service_url(key, port),
        api_version: slurm.api_version.clone(),
        token,
        timeout: Duration::from_secs(slurm.timeout_secs),
    })
}

pub fn token_from_secret(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    let token = String::from_utf8_lossy(&bytes.0).trim().to_string();
    (!token.is_empty()).then_some(token)
}

async fn read_token(
    client: &kube::Client,
    namespace: &str,
    secret: &SecretKeyRef,
) -> Result<String> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let resource = format!("Secret {namespace}/{}", secret.name);
    let found = api
        .get_opt(&secret.name)
        .await?
        .ok_or_else(|| Error::internal(format!("{resource} not found")))?;
    token_from_secret(&found, &secret.key)
        .ok_or_else(|| Error::missing(resource, "data"))
}

#[instrument(skip_all, fields(ns, name))]
async fn reconcile(
    cluster: Arc<SlurmCluster>,
    ctx: Arc<ChecksContext>,
) -> Result<Action> {
    let name = cluster.name_any();
    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::missing(&name, "metadata.namespace"))?;
    Span::current().record("ns", ns.as_str()).record("name", name.as_str());
    if cluster.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let key = ClusterKey::new(&ns, &name);
    let action = with_deadline(
        ctx.cfg.reconcile_timeout(),
        register(&ctx, &cluster, &key),
    )
    .await?;
    ctx.backoff.reset(&object_key(cluster.as_ref()));
    Ok(action)
}

/// Builds and registers the client of `cluster`, replacing any earlier one.
/// The periodic requeue picks up rotated tokens.
async fn register(
    ctx: &ChecksContext,
    cluster: &SlurmCluster,
    key: &ClusterKey,
) -> Result<Action> {
    let token_secret = cluster
        .spec
        .rest_api
        .as_ref()
        .and_then(|r| r.token_secret.as_ref());
    let token = match token_secret {
        Some(secret) => {
            Some(read_token(&ctx.client, &key.namespace, secret).await?)
        }
        None => None,
    };
    let Some(cfg) = client_config(key, &cluster.spec, &ctx.cfg.slurm, token)
    else {
        debug!("rest api disabled, no scheduler client");
        return Ok(Action::await_change());
    };
    let base_url = cfg.base_url.clone();
    let client = RestClient::new(cfg)?;
    ctx.clients.add(key.clone(), Arc::new(client)).await;
    info!(%base_url, "scheduler client registered");
    Ok(Action::requeue(Duration::from_secs(ctx.cfg.requeue_secs)))
}

fn error_policy(
    cluster: Arc<SlurmCluster>,
    error: &Error,
    ctx: Arc<ChecksContext>,
) -> Action {
    requeue_with_backoff(cluster.as_ref(), error, &ctx.backoff)
}

pub async fn run(ctx: Arc<ChecksContext>) -> anyhow::Result<()> {
    let api = scoped::<SlurmCluster>(&ctx.client, ctx.cfg.namespace());
    let (reader, writer) = reflector::store();
    let clusters = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);

    let concurrency = ctx.cfg.concurrency;
    Controller::for_stream(clusters, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = %e, "scheduler client registration failed");
            }
        })
        .await;
    Ok(())
}
