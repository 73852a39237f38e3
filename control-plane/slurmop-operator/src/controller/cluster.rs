use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{Span, info, instrument};

use crate::controller::Context;
use crate::controller::status::{
    ConditionRecorder, compute_phase, update_status, upsert_condition,
};
use crate::crd::{ConditionType, Phase, SlurmCluster};
use crate::engine::{
    Dependency, Desired, KindReconciler, KubeStore, ManagedResource,
    ObjectStore, Step, Strategy, execute,
};
use crate::templates::{self, names};
use crate::{Error, Result};

/// Builds the steps of one cluster reconcile.
struct Plan<'a> {
    store: &'a KubeStore,
    owner: &'a OwnerReference,
    recorder: &'a ConditionRecorder,
    deps: &'a OnceLock<Vec<Dependency>>,
}

impl<'a> Plan<'a> {
    fn apply<K: ManagedResource>(&self, desired: Desired<K>) -> Step<'a> {
        let (store, owner) = (self.store, self.owner);
        Step::new(K::kind(&()).to_string(), move || async move {
            KindReconciler::<K, KubeStore>::new(store, owner)
                .reconcile(desired, &[])
                .await
        })
    }

    /// Like [`Plan::apply`], stamping the object with the revision of the
    /// slurm configs so that a config change rolls the pods.
    fn apply_with_deps<K: ManagedResource>(
        &self,
        desired: Desired<K>,
    ) -> Step<'a> {
        let (store, owner, deps) = (self.store, self.owner, self.deps);
        Step::new(K::kind(&()).to_string(), move || async move {
            let deps = deps.get().ok_or_else(|| {
                Error::internal("slurm configs revision is not known")
            })?;
            KindReconciler::<K, KubeStore>::new(store, owner)
                .reconcile(desired, deps)
                .await
        })
    }

    /// Reads the live slurm configs so later groups can depend on them.
    fn resolve_deps(&self, namespace: String, name: String) -> Step<'a> {
        let (store, deps) = (self.store, self.deps);
        Step::new("ResolveDependencies", move || async move {
            let live = ObjectStore::<ConfigMap>::get(store, &namespace, &name)
                .await?
                .ok_or_else(|| {
                    Error::internal(format!("ConfigMap {namespace}/{name} not found"))
                })?;
            let _ = deps.set(vec![Dependency::of(&live)]);
            Ok(())
        })
    }

    /// A fail-at-first-error execution over `steps` that records its
    /// outcome as the `condition` of the cluster.
    fn group(
        &self,
        name: &'static str,
        condition: ConditionType,
        steps: Vec<Step<'a>>,
    ) -> Step<'a> {
        let recorder = self.recorder;
        Step::new(name, move || async move {
            let outcome =
                execute(name, Strategy::FailAtFirstError, steps).await;
            recorder.record(condition, &outcome);
            outcome
        })
    }
}

#[instrument(skip_all, fields(ns, name))]
pub(super) async fn reconcile(
    cluster: Arc<SlurmCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = cluster.name_any();
    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::missing(&name, "metadata.namespace"))?;
    Span::current().record("ns", ns.as_str()).record("name", name.as_str());

    // Owned children are garbage collected through their owner references.
    if cluster.meta().deletion_timestamp.is_some() {
        info!("cluster is being deleted, skipping");
        return Ok(Action::await_change());
    }

    let owner = cluster
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing(&name, "metadata.uid"))?;
    let api: Api<SlurmCluster> = Api::namespaced(ctx.client.clone(), &ns);
    let attempts = ctx.cfg.status_retry_attempts;

    update_status(&api, &name, attempts, |status| {
        status.phase = Some(Phase::Reconciling);
    })
    .await?;

    let rendered = templates::render(&cluster)?;
    let recorder = ConditionRecorder::default();
    let deps = OnceLock::new();
    let plan = Plan {
        store: &ctx.store,
        owner: &owner,
        recorder: &recorder,
        deps: &deps,
    };

    let steps = vec![
        plan.group(
            "common",
            ConditionType::CommonAvailable,
            vec![
                plan.apply(Desired::Present(rendered.slurm_configs)),
                plan.resolve_deps(ns.clone(), names::slurm_configs(&name)),
            ],
        ),
        plan.group(
            "controllers",
            ConditionType::ControllersAvailable,
            vec![
                plan.apply(Desired::Present(rendered.controller_service)),
                plan.apply_with_deps(Desired::Present(rendered.controller)),
            ],
        ),
        plan.group(
            "rbac",
            ConditionType::RbacAvailable,
            vec![
                plan.apply(rendered.service_account),
                plan.apply(rendered.role),
                plan.apply(rendered.role_binding),
            ],
        ),
        plan.group(
            "workers",
            ConditionType::WorkersAvailable,
            vec![
                plan.apply(Desired::Present(rendered.worker_service)),
                plan.apply_with_deps(Desired::Present(rendered.workers)),
                plan.apply_with_deps(rendered.health_check),
            ],
        ),
        plan.group(
            "rest-api",
            ConditionType::RestApiAvailable,
            vec![
                plan.apply(rendered.rest_service),
                plan.apply_with_deps(rendered.rest),
            ],
        ),
        plan.group(
            "accounting",
            ConditionType::AccountingAvailable,
            vec![
                plan.apply(rendered.accounting_db),
                plan.apply(rendered.accounting_grant),
            ],
        ),
        plan.group(
            "telemetry",
            ConditionType::TelemetryAvailable,
            vec![
                plan.apply(rendered.collector),
                plan.apply(rendered.pod_monitor),
            ],
        ),
    ];

    let outcome = execute(&name, Strategy::CollectErrors, steps).await;

    let conditions = recorder.into_conditions();
    let phase = compute_phase(&conditions);
    let generation = cluster.meta().generation;
    update_status(&api, &name, attempts, |status| {
        for condition in &conditions {
            upsert_condition(&mut status.conditions, condition.clone());
        }
        status.phase = Some(phase);
        status.observed_generation = generation;
    })
    .await?;

    outcome?;
    info!(?phase, "cluster reconciled");
    Ok(Action::requeue(Duration::from_secs(ctx.cfg.requeue_secs)))
}
