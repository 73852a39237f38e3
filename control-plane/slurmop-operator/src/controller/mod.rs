mod cluster;
pub mod status;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller, WatchStreamExt, controller, controller::Action,
        predicates, reflector, watcher,
    },
};
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::crd::SlurmCluster;
use crate::engine::KubeStore;
use crate::{Error, Result};

pub struct Context {
    pub client: Client,
    pub cfg: OperatorConfig,
    pub store: KubeStore,
    pub backoff: Backoff,
}

impl Context {
    pub fn new(client: Client, cfg: OperatorConfig) -> Self {
        Self {
            store: KubeStore::new(client.clone()),
            client,
            cfg,
            backoff: Backoff::default(),
        }
    }
}

/// Requeue delays for failing reconciles, doubling per consecutive failure
/// of the same object key up to a cap.
///
/// A failing object is retried at least once per `cap`, so a key left
/// untouched for twice that long belongs to an object that is gone and is
/// dropped on the next failure.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<String, (u32, Instant)>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn next(&self, key: &str) -> Duration {
        let now = Instant::now();
        let stale_after = self.cap.saturating_mul(2);
        let mut failures =
            self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.retain(|_, (_, at)| now.duration_since(*at) < stale_after);
        let (n, at) = failures.entry(key.to_string()).or_insert((0, now));
        let delay = self.base.saturating_mul(1u32 << (*n).min(16));
        *n = n.saturating_add(1);
        *at = now;
        delay.min(self.cap)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// `namespace/name` of an object, or just the name for cluster-scoped
/// kinds. Backoff state is tracked under this key.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}

/// Bounds `fut` by `deadline`, mapping expiry to [`Error::Timeout`].
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout(deadline))?
}

pub(crate) fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

pub async fn run_controller(
    client: Client,
    cfg: OperatorConfig,
) -> anyhow::Result<()> {
    let namespace = cfg.namespace().map(str::to_string);
    let ns = namespace.as_deref();
    let concurrency = cfg.concurrency;

    // Status writes do not bump the generation, so they never re-trigger.
    let (reader, writer) = reflector::store();
    let clusters = reflector(
        writer,
        watcher(scoped::<SlurmCluster>(&client, ns), watcher::Config::default()),
    )
    .default_backoff()
    .applied_objects()
    .predicate_filter(predicates::generation);

    let ctx = Arc::new(Context::new(client.clone(), cfg));

    Controller::for_stream(clusters, reader)
        .owns(scoped::<ConfigMap>(&client, ns), watcher::Config::default())
        .owns(scoped::<Secret>(&client, ns), watcher::Config::default())
        .owns(scoped::<Service>(&client, ns), watcher::Config::default())
        .owns(scoped::<StatefulSet>(&client, ns), watcher::Config::default())
        .owns(scoped::<Deployment>(&client, ns), watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => {
                    debug!(cluster = %obj, ?action, "reconciled")
                }
                Err(e) => warn!(error = %e, "cluster reconcile failed"),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(
    cluster: Arc<SlurmCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let key = object_key(cluster.as_ref());
    let action = with_deadline(
        ctx.cfg.reconcile_timeout(),
        cluster::reconcile(cluster, ctx.clone()),
    )
    .await?;
    ctx.backoff.reset(&key);
    Ok(action)
}

/// Shared error policy of every controller whose context carries a
/// [`Backoff`].
pub fn requeue_with_backoff<K: Resource>(
    obj: &K,
    error: &Error,
    backoff: &Backoff,
) -> Action {
    let key = object_key(obj);
    let delay = backoff.next(&key);
    warn!(object = %key, %error, delay_secs = delay.as_secs(), "requeueing after error");
    Action::requeue(delay)
}

fn error_policy(
    cluster: Arc<SlurmCluster>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    requeue_with_backoff(cluster.as_ref(), error, &ctx.backoff)
}
