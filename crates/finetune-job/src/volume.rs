//! Model volume claim synchronization
//!
//! Size and storage class cannot be changed in place, so a drifted claim is
//! deleted and recreated. The compute Job mounting it is retired first.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info};

use finetune_common::crd::{TrainingJob, TrainingJobSpec};
use finetune_common::metrics::{self, ResourceOperation};
use finetune_common::{ControllerConfig, Error};

use crate::compute::{ComputeSynchronizer, SyncOutcome};
use crate::materializer::{build_volume_claim, volume_drift};
use crate::ownership::{adopt_if_unowned, ensure_controllable};
use crate::store::{ObjectKey, ResourceKind, ResourceStore};
use crate::waiter::{DeletionState, DeletionWaiter};

/// Keeps the TrainingJob's PersistentVolumeClaim in line with the spec
pub struct VolumeSynchronizer<'a> {
    store: &'a dyn ResourceStore,
    config: &'a ControllerConfig,
}

impl<'a> VolumeSynchronizer<'a> {
    /// Create a synchronizer over `store`
    pub fn new(store: &'a dyn ResourceStore, config: &'a ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Create the claim, or recreate it when size or storage class drifted
    pub async fn sync(
        &self,
        job: &TrainingJob,
        spec: &TrainingJobSpec,
        key: &ObjectKey,
        compute: &ComputeSynchronizer<'_>,
    ) -> Result<SyncOutcome, Error> {
        let owner_uid = job.uid().unwrap_or_default();
        let waiter = DeletionWaiter::new(self.store, self.config);

        if let Some(existing) = self.store.get_volume_claim(key).await? {
            ensure_controllable(ResourceKind::VolumeClaim, key, &existing.metadata, &owner_uid)?;

            if existing.metadata.deletion_timestamp.is_some() {
                // A previous pass already asked for deletion
                if waiter.wait_absent(ResourceKind::VolumeClaim, key).await? == DeletionState::Pending {
                    return Ok(SyncOutcome::AwaitingDeletion(ResourceKind::VolumeClaim));
                }
            } else {
                let Some(reason) = volume_drift(&existing, spec) else {
                    debug!(claim = %key, "Volume claim is up to date");
                    adopt_if_unowned(
                        self.store,
                        ResourceKind::VolumeClaim,
                        key,
                        &existing.metadata,
                        job,
                    )
                    .await?;
                    return Ok(SyncOutcome::Unchanged);
                };
                info!(claim = %key, %reason, "Recreating volume claim");

                if compute.retire(key, &owner_uid).await? == DeletionState::Pending {
                    return Ok(SyncOutcome::AwaitingDeletion(ResourceKind::ComputeJob));
                }
                if waiter
                    .delete_and_wait(ResourceKind::VolumeClaim, key, &owner_uid)
                    .await?
                    == DeletionState::Pending
                {
                    return Ok(SyncOutcome::AwaitingDeletion(ResourceKind::VolumeClaim));
                }
            }
        }

        let desired = build_volume_claim(job, spec, key)?;
        self.create(key, &desired).await?;
        Ok(SyncOutcome::Changed)
    }

    /// Delete the claim and report whether it is gone
    pub async fn teardown(&self, key: &ObjectKey, owner_uid: &str) -> Result<DeletionState, Error> {
        DeletionWaiter::new(self.store, self.config)
            .delete_and_wait(ResourceKind::VolumeClaim, key, owner_uid)
            .await
    }

    async fn create(&self, key: &ObjectKey, claim: &PersistentVolumeClaim) -> Result<(), Error> {
        self.store.create_volume_claim(&key.namespace, claim).await?;
        metrics::record_resource_operation("PersistentVolumeClaim", ResourceOperation::Create);
        info!(claim = %key, "Created volume claim");
        Ok(())
    }
}
