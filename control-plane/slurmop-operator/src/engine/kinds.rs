//! Controller-owned fields of every managed kind.
//!
//! Each impl copies only what the controller decides for that kind, so
//! values written by autoscalers, admission webhooks or users survive.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::external::{Grant, MariaDB, OpenTelemetryCollector, PodMonitor};
use crate::engine::ManagedResource;

/// Pairs up the spec of both sides, creating an empty spec on `dst` when
/// only `src` has one.
fn specs<'a, T: Default>(
    dst: &'a mut Option<T>,
    src: &'a Option<T>,
) -> Option<(&'a mut T, &'a T)> {
    let src = src.as_ref()?;
    Some((dst.get_or_insert_with(T::default), src))
}

fn merge_annotations(dst: &mut ObjectMeta, src: &ObjectMeta) {
    if let Some(src) = &src.annotations {
        dst.annotations
            .get_or_insert_with(Default::default)
            .extend(src.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

impl ManagedResource for StatefulSet {
    fn copy_owned_fields(&mut self, desired: &Self) {
        let Some((dst, src)) = specs(&mut self.spec, &desired.spec) else {
            return;
        };
        let dst_meta = dst.template.metadata.get_or_insert_with(Default::default);
        if let Some(src_meta) = &src.template.metadata {
            dst_meta.labels = src_meta.labels.clone();
            merge_annotations(dst_meta, src_meta);
        }
        dst.replicas = src.replicas;
        dst.update_strategy = src.update_strategy.clone();
        dst.volume_claim_templates = src.volume_claim_templates.clone();
        dst.template.spec = src.template.spec.clone();
    }

    fn template_meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        let spec = self.spec.get_or_insert_with(Default::default);
        Some(spec.template.metadata.get_or_insert_with(Default::default))
    }
}

impl ManagedResource for Deployment {
    fn copy_owned_fields(&mut self, desired: &Self) {
        let Some((dst, src)) = specs(&mut self.spec, &desired.spec) else {
            return;
        };
        dst.replicas = src.replicas;
        dst.strategy = src.strategy.clone();
        dst.selector = src.selector.clone();
        dst.template.spec = src.template.spec.clone();
    }

    fn template_meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        let spec = self.spec.get_or_insert_with(Default::default);
        Some(spec.template.metadata.get_or_insert_with(Default::default))
    }
}

impl ManagedResource for DaemonSet {
    fn copy_owned_fields(&mut self, desired: &Self) {
        if let Some((dst, src)) = specs(&mut self.spec, &desired.spec) {
            dst.template.spec = src.template.spec.clone();
        }
    }
}

impl ManagedResource for Job {
    fn copy_owned_fields(&mut self, desired: &Self) {
        if let Some((dst, src)) = specs(&mut self.spec, &desired.spec) {
            dst.parallelism = src.parallelism;
            dst.completions = src.completions;
        }
    }

    fn template_meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        let spec = self.spec.get_or_insert_with(Default::default);
        Some(spec.template.metadata.get_or_insert_with(Default::default))
    }
}

impl ManagedResource for CronJob {
    fn copy_owned_fields(&mut self, desired: &Self) {
        let Some((dst, src)) = specs(&mut self.spec, &desired.spec) else {
            return;
        };
        dst.schedule = src.schedule.clone();
        dst.suspend = src.suspend;
        dst.successful_jobs_history_limit = src.successful_jobs_history_limit;
        dst.failed_jobs_history_limit = src.failed_jobs_history_limit;
        if let Some((dst_job, src_job)) =
            specs(&mut dst.job_template.spec, &src.job_template.spec)
        {
            dst_job.template.spec = src_job.template.spec.clone();
        }
    }

    fn template_meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        let spec = self.spec.get_or_insert_with(Default::default);
        let job = spec.job_template.spec.get_or_insert_with(Default::default);
        Some(job.template.metadata.get_or_insert_with(Default::default))
    }
}

impl ManagedResource for ConfigMap {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.data = desired.data.clone();
    }
}

impl ManagedResource for Secret {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.data = desired.data.clone();
    }
}

impl ManagedResource for Service {
    fn copy_owned_fields(&mut self, desired: &Self) {
        merge_annotations(&mut self.metadata, &desired.metadata);
        if let Some((dst, src)) = specs(&mut self.spec, &desired.spec) {
            dst.type_ = src.type_.clone();
            dst.ports = src.ports.clone();
        }
    }
}

impl ManagedResource for ServiceAccount {
    fn copy_owned_fields(&mut self, _desired: &Self) {}
}

impl ManagedResource for Role {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
    }
}

impl ManagedResource for RoleBinding {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.subjects = desired.subjects.clone();
        self.role_ref = desired.role_ref.clone();
    }
}

impl ManagedResource for PodMonitor {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.spec.job_label = desired.spec.job_label.clone();
        self.spec.pod_metrics_endpoints =
            desired.spec.pod_metrics_endpoints.clone();
    }
}

impl ManagedResource for MariaDB {
    fn copy_owned_fields(&mut self, desired: &Self) {
        let (dst, src) = (&mut self.spec, &desired.spec);
        dst.image = src.image.clone();
        dst.replicas = src.replicas;
        dst.port = src.port;
        dst.database = src.database.clone();
        dst.username = src.username.clone();
        dst.password_secret_key_ref = src.password_secret_key_ref.clone();
        dst.root_password_secret_key_ref =
            src.root_password_secret_key_ref.clone();
        dst.resources = src.resources.clone();
        dst.node_selector = src.node_selector.clone();
        dst.tolerations = src.tolerations.clone();
        dst.storage = src.storage.clone();
    }
}

impl ManagedResource for Grant {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}

impl ManagedResource for OpenTelemetryCollector {
    fn copy_owned_fields(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}
