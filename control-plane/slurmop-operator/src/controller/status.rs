//! Status conditions of a `SlurmCluster` and the conflict-tolerant write
//! path for them.

use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::crd::{
    ClusterCondition, ConditionStatus, ConditionType, Phase, SlurmCluster,
    SlurmClusterStatus,
};
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::{Error, Result};

/// Collects one condition per resource group while an execution runs.
#[derive(Default)]
pub struct ConditionRecorder {
    conditions: Mutex<Vec<ClusterCondition>>,
}

impl ConditionRecorder {
    pub fn record(&self, type_: ConditionType, outcome: &Result<()>) {
        let condition = match outcome {
            Ok(()) => ClusterCondition {
                type_,
                status: ConditionStatus::True,
                reason: Some("Reconciled".into()),
                message: None,
                last_transition_time: Some(Utc::now().to_rfc3339()),
            },
            Err(e) => ClusterCondition {
                type_,
                status: ConditionStatus::False,
                reason: Some("ReconcileFailed".into()),
                message: Some(e.to_string()),
                last_transition_time: Some(Utc::now().to_rfc3339()),
            },
        };
        let mut conditions =
            self.conditions.lock().unwrap_or_else(PoisonError::into_inner);
        upsert_condition(&mut conditions, condition);
    }

    pub fn into_conditions(self) -> Vec<ClusterCondition> {
        self.conditions
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replaces the condition of the same type, keeping its transition time when
/// the status did not change.
pub fn upsert_condition(
    conditions: &mut Vec<ClusterCondition>,
    mut condition: ClusterCondition,
) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time =
                    existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn compute_phase(conditions: &[ClusterCondition]) -> Phase {
    if conditions
        .iter()
        .any(|c| c.status != ConditionStatus::True)
    {
        Phase::NotAvailable
    } else {
        Phase::Available
    }
}

/// Read-modify-write of the status subresource.
///
/// Every attempt re-reads the object, reapplies `mutate` and writes with the
/// resource version it read, so a concurrent writer surfaces as a 409 and
/// the whole transaction is retried.
pub async fn update_status<F>(
    api: &Api<SlurmCluster>,
    name: &str,
    attempts: u32,
    mutate: F,
) -> Result<()>
where
    F: Fn(&mut SlurmClusterStatus),
{
    let retry = RetryConfig::with_max_attempts(attempts);
    let mutate = &mutate;
    let attempt = move || async move {
        let mut current = api.get_status(name).await?;
        let resource_version = current.resource_version();
        let status = current.status.get_or_insert_with(Default::default);
        mutate(status);
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(cluster = %name, phase = ?status.phase, "status written");
        Ok::<_, Error>(())
    };
    retry_with_backoff(&retry, "cluster status update", Error::is_conflict, attempt)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(
        type_: ConditionType,
        status: ConditionStatus,
        at: &str,
    ) -> ClusterCondition {
        ClusterCondition {
            type_,
            status,
            reason: None,
            message: None,
            last_transition_time: Some(at.into()),
        }
    }

    #[test]
    fn upsert_keeps_transition_time_for_same_status() {
        let mut conditions = vec![condition(
            ConditionType::WorkersAvailable,
            ConditionStatus::True,
            "t1",
        )];
        upsert_condition(
            &mut conditions,
            condition(ConditionType::WorkersAvailable, ConditionStatus::True, "t2"),
        );
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t1"));

        upsert_condition(
            &mut conditions,
            condition(ConditionType::WorkersAvailable, ConditionStatus::False, "t3"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t3"));
    }

    #[test]
    fn recorder_tracks_failures_and_phase_follows() {
        let recorder = ConditionRecorder::default();
        recorder.record(ConditionType::CommonAvailable, &Ok(()));
        recorder.record(
            ConditionType::AccountingAvailable,
            &Err(Error::internal("grant rejected")),
        );
        let conditions = recorder.into_conditions();
        assert_eq!(conditions.len(), 2);
        assert_eq!(
            conditions[1].message.as_deref(),
            Some("internal error: grant rejected")
        );
        assert_eq!(compute_phase(&conditions), Phase::NotAvailable);
        assert_eq!(compute_phase(&conditions[..1]), Phase::Available);
    }
}
