//! Compute Job synchronization
//!
//! A batch Job's pod template is immutable, so every change means delete,
//! confirm absence, then create. Only one incarnation of the Job may exist
//! at a time.

use kube::ResourceExt;
use tracing::{debug, info};

use finetune_common::crd::{TrainingJob, TrainingJobSpec};
use finetune_common::metrics::{self, ResourceOperation};
use finetune_common::{ControllerConfig, Error};

use crate::materializer::{build_compute_job, compute_drift};
use crate::ownership::{adopt_if_unowned, ensure_controllable};
use crate::store::{ObjectKey, ResourceKind, ResourceStore};
use crate::waiter::{DeletionState, DeletionWaiter};

/// What a synchronizer did in one pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Resource already matched the spec
    Unchanged,
    /// Resource was created or replaced
    Changed,
    /// Waiting for an old resource of this kind to disappear
    AwaitingDeletion(ResourceKind),
}

impl SyncOutcome {
    /// True when the pass wrote something
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// Keeps the TrainingJob's batch Job in line with the spec
pub struct ComputeSynchronizer<'a> {
    store: &'a dyn ResourceStore,
    config: &'a ControllerConfig,
}

impl<'a> ComputeSynchronizer<'a> {
    /// Create a synchronizer over `store`
    pub fn new(store: &'a dyn ResourceStore, config: &'a ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Create the Job, recreating any existing one when it must change.
    ///
    /// `dependencies_changed` forces recreation so the pod picks up a new
    /// volume. A new token is also caught by the inputs digest on the pod
    /// template, so it survives a pass that failed after the Secret update.
    pub async fn sync(
        &self,
        job: &TrainingJob,
        spec: &TrainingJobSpec,
        key: &ObjectKey,
        dependencies_changed: bool,
    ) -> Result<SyncOutcome, Error> {
        let owner_uid = job.uid().unwrap_or_default();
        let desired = build_compute_job(job, spec, key, self.config)?;
        let existing = self.store.get_compute_job(key).await?;

        let reason = match &existing {
            None => Some("missing".to_string()),
            Some(current) => {
                ensure_controllable(ResourceKind::ComputeJob, key, &current.metadata, &owner_uid)?;
                if current.metadata.deletion_timestamp.is_some() {
                    Some("previous Job is terminating".to_string())
                } else if dependencies_changed {
                    Some("credential or volume claim changed".to_string())
                } else {
                    compute_drift(current, &desired)
                }
            }
        };

        let Some(reason) = reason else {
            debug!(job = %key, "Compute Job is up to date");
            if let Some(current) = &existing {
                adopt_if_unowned(self.store, ResourceKind::ComputeJob, key, &current.metadata, job)
                    .await?;
            }
            return Ok(SyncOutcome::Unchanged);
        };

        if existing.is_some() {
            info!(job = %key, %reason, "Recreating compute Job");
            let waiter = DeletionWaiter::new(self.store, self.config);
            if waiter
                .delete_and_wait(ResourceKind::ComputeJob, key, &owner_uid)
                .await?
                == DeletionState::Pending
            {
                return Ok(SyncOutcome::AwaitingDeletion(ResourceKind::ComputeJob));
            }
        }

        self.store.create_compute_job(&key.namespace, &desired).await?;
        metrics::record_resource_operation("Job", ResourceOperation::Create);
        info!(job = %key, "Created compute Job");
        Ok(SyncOutcome::Changed)
    }

    /// Delete the Job and report whether it is gone
    pub async fn retire(&self, key: &ObjectKey, owner_uid: &str) -> Result<DeletionState, Error> {
        DeletionWaiter::new(self.store, self.config)
            .delete_and_wait(ResourceKind::ComputeJob, key, owner_uid)
            .await
    }
}
