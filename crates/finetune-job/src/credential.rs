//! Credential Secret synchronization

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info};

use finetune_common::crd::{TrainingJob, TrainingJobSpec};
use finetune_common::metrics::{self, ResourceOperation};
use finetune_common::{ControllerConfig, Error};

use crate::materializer::{build_credential, credential_key, credential_token};
use crate::ownership::{adopt_if_unowned, ensure_controllable};
use crate::store::{ObjectKey, ResourceKind, ResourceStore};
use crate::waiter::{DeletionState, DeletionWaiter};

const KIND: &str = "Secret";

/// Keeps the namespace's credential Secret in line with the spec token
pub struct CredentialSynchronizer<'a> {
    store: &'a dyn ResourceStore,
    config: &'a ControllerConfig,
}

impl<'a> CredentialSynchronizer<'a> {
    /// Create a synchronizer over `store`
    pub fn new(store: &'a dyn ResourceStore, config: &'a ControllerConfig) -> Self {
        Self { store, config }
    }

    /// Create or update the Secret. Returns true when the stored token changed.
    pub async fn sync(
        &self,
        job: &TrainingJob,
        spec: &TrainingJobSpec,
        job_key: &ObjectKey,
    ) -> Result<bool, Error> {
        let key = credential_key(job_key, self.config);
        let desired = build_credential(job, spec, &key, self.config)?;

        let Some(existing) = self.store.get_secret(&key).await? else {
            self.create(&key, &desired).await?;
            return Ok(true);
        };

        let owner_uid = job.uid().unwrap_or_default();
        ensure_controllable(ResourceKind::Credential, &key, &existing.metadata, &owner_uid)?;

        let token = spec.hugging_face_secret.as_bytes();
        if credential_token(&existing, &self.config.credential_key) == Some(token) {
            debug!(secret = %key, "Credential is up to date");
            adopt_if_unowned(self.store, ResourceKind::Credential, &key, &existing.metadata, job)
                .await?;
            return Ok(false);
        }

        let mut updated = desired;
        updated.metadata.resource_version = existing.metadata.resource_version.clone();
        match self.store.replace_secret(&key.namespace, &updated).await {
            Ok(()) => {
                metrics::record_resource_operation(KIND, ResourceOperation::Update);
                info!(secret = %key, "Updated credential");
                Ok(true)
            }
            // Deleted between our read and the write
            Err(e) if e.is_not_found() => {
                updated.metadata.resource_version = None;
                self.create(&key, &updated).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the Secret if this TrainingJob controls it
    pub async fn teardown(&self, job_key: &ObjectKey, owner_uid: &str) -> Result<DeletionState, Error> {
        let key = credential_key(job_key, self.config);
        DeletionWaiter::new(self.store, self.config)
            .delete_and_wait(ResourceKind::Credential, &key, owner_uid)
            .await
    }

    async fn create(&self, key: &ObjectKey, secret: &Secret) -> Result<(), Error> {
        self.store.create_secret(&key.namespace, secret).await?;
        metrics::record_resource_operation(KIND, ResourceOperation::Create);
        info!(secret = %key, "Created credential");
        Ok(())
    }
}
