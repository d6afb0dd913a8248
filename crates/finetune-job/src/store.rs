//! Resource store client
//!
//! The reconciler talks to the API server only through [`ResourceStore`], so
//! the engine can run against an in-memory store in tests. "Not found" is
//! never an error here: reads return `None` and deletes return `false`.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tracing::debug;

use finetune_common::crd::{TrainingJob, TrainingJobStatus};
use finetune_common::kube_utils::{finalizers_with, finalizers_without};
use finetune_common::retry::{retry_with_backoff_if, RetryConfig};
use finetune_common::{Error, FIELD_MANAGER};

/// Namespace and name of a stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a TrainingJob; fails if it carries no namespace
    pub fn for_job(job: &TrainingJob) -> Result<Self, Error> {
        let name = job.name_any();
        let namespace = job.namespace().ok_or_else(|| {
            Error::validation_for(&name, "TrainingJob must be namespaced")
        })?;
        Ok(Self::new(namespace, name))
    }

    /// Key with the same namespace and a different name
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Dependent resource kinds managed for each TrainingJob
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Secret holding the model hub token
    Credential,
    /// PersistentVolumeClaim holding the downloaded model
    VolumeClaim,
    /// batch/v1 Job running download and training
    ComputeJob,
}

impl ResourceKind {
    /// Kubernetes kind name
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Credential => "Secret",
            Self::VolumeClaim => "PersistentVolumeClaim",
            Self::ComputeJob => "Job",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_str())
    }
}

/// Read and write primitives the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a TrainingJob
    async fn get_training_job(&self, key: &ObjectKey) -> Result<Option<TrainingJob>, Error>;

    /// Add a finalizer to a TrainingJob.
    ///
    /// Returns `false` when it was already present or the job is gone.
    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error>;

    /// Remove a finalizer from a TrainingJob.
    ///
    /// Returns `false` when it was already absent or the job is gone.
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error>;

    /// Overwrite the status subresource of a TrainingJob
    async fn patch_status(&self, key: &ObjectKey, status: &TrainingJobStatus)
        -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, Error>;

    /// Create a Secret in `namespace`
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace an existing Secret in `namespace`
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim
    async fn get_volume_claim(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim in `namespace`
    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error>;

    /// Get a batch Job
    async fn get_compute_job(&self, key: &ObjectKey) -> Result<Option<Job>, Error>;

    /// Create a batch Job in `namespace`
    async fn create_compute_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Metadata of a dependent resource, if it exists
    async fn get_metadata(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> Result<Option<ObjectMeta>, Error>;

    /// Request deletion of a dependent resource.
    ///
    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<bool, Error>;

    /// Overwrite the owner references of a dependent resource.
    ///
    /// `resource_version` guards against a concurrent writer.
    async fn set_owner_references(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        resource_version: Option<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<(), Error>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeStore {
    client: Client,
    finalizer_retry: RetryConfig,
}

impl KubeStore {
    /// Create a store on top of a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            finalizer_retry: RetryConfig::with_max_attempts(5),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn get_opt<K>(&self, key: &ObjectKey) -> Result<Option<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>(&key.namespace).get_opt(&key.name).await?)
    }

    async fn metadata_opt<K>(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        let partial = self
            .api::<K>(&key.namespace)
            .get_metadata_opt(&key.name)
            .await?;
        Ok(partial.map(|p| p.metadata))
    }

    async fn delete_opt<K>(&self, key: &ObjectKey, params: &DeleteParams) -> Result<bool, Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        match self.api::<K>(&key.namespace).delete(&key.name, params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_metadata<K>(&self, key: &ObjectKey, patch: &serde_json::Value) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + fmt::Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&key.namespace)
            .patch(&key.name, &Self::patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    /// One read-modify-write of the finalizer list, guarded by resourceVersion
    async fn edit_finalizers_once(
        &self,
        key: &ObjectKey,
        edit: impl Fn(&ObjectMeta) -> Option<Vec<String>>,
    ) -> Result<bool, Error> {
        let api: Api<TrainingJob> = self.api(&key.namespace);
        let Some(job) = api.get_opt(&key.name).await? else {
            return Ok(false);
        };
        let Some(finalizers) = edit(&job.metadata) else {
            return Ok(false);
        };

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": job.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(&key.name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_training_job(&self, key: &ObjectKey) -> Result<Option<TrainingJob>, Error> {
        self.get_opt(key).await
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error> {
        retry_with_backoff_if(
            &self.finalizer_retry,
            "add_finalizer",
            |e: &Error| e.is_conflict(),
            || self.edit_finalizers_once(key, |meta| finalizers_with(meta, finalizer)),
        )
        .await
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error> {
        retry_with_backoff_if(
            &self.finalizer_retry,
            "remove_finalizer",
            |e: &Error| e.is_conflict(),
            || self.edit_finalizers_once(key, |meta| finalizers_without(meta, finalizer)),
        )
        .await
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &TrainingJobStatus,
    ) -> Result<(), Error> {
        let api: Api<TrainingJob> = self.api(&key.namespace);
        let status = serde_json::to_value(status)
            .map_err(|e| Error::serialization_for_kind("TrainingJobStatus", e.to_string()))?;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, Error> {
        self.get_opt(key).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.api::<Secret>(namespace)
            .create(&Self::post_params(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let name = secret.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("store", "cannot replace a Secret without a name")
        })?;
        self.api::<Secret>(namespace)
            .replace(name, &Self::post_params(), secret)
            .await?;
        Ok(())
    }

    async fn get_volume_claim(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.get_opt(key).await
    }

    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        self.api::<PersistentVolumeClaim>(namespace)
            .create(&Self::post_params(), claim)
            .await?;
        Ok(())
    }

    async fn get_compute_job(&self, key: &ObjectKey) -> Result<Option<Job>, Error> {
        self.get_opt(key).await
    }

    async fn create_compute_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        self.api::<Job>(namespace)
            .create(&Self::post_params(), job)
            .await?;
        Ok(())
    }

    async fn get_metadata(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> Result<Option<ObjectMeta>, Error> {
        match kind {
            ResourceKind::Credential => self.metadata_opt::<Secret>(key).await,
            ResourceKind::VolumeClaim => self.metadata_opt::<PersistentVolumeClaim>(key).await,
            ResourceKind::ComputeJob => self.metadata_opt::<Job>(key).await,
        }
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<bool, Error> {
        debug!(%kind, object = %key, "Deleting dependent resource");
        match kind {
            ResourceKind::Credential => self.delete_opt::<Secret>(key, &DeleteParams::default()).await,
            ResourceKind::VolumeClaim => {
                self.delete_opt::<PersistentVolumeClaim>(key, &DeleteParams::default())
                    .await
            }
            // Foreground so the Job only disappears once its pods are gone
            ResourceKind::ComputeJob => self.delete_opt::<Job>(key, &DeleteParams::foreground()).await,
        }
    }

    async fn set_owner_references(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        resource_version: Option<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "ownerReferences": owner_references,
            }
        });
        match kind {
            ResourceKind::Credential => self.patch_metadata::<Secret>(key, &patch).await,
            ResourceKind::VolumeClaim => {
                self.patch_metadata::<PersistentVolumeClaim>(key, &patch)
                    .await
            }
            ResourceKind::ComputeJob => self.patch_metadata::<Job>(key, &patch).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finetune_common::crd::TrainingJobSpec;

    #[test]
    fn key_displays_as_namespace_slash_name() {
        let key = ObjectKey::new("ml", "job-a");
        assert_eq!(key.to_string(), "ml/job-a");
        assert_eq!(key.sibling("hf-token"), ObjectKey::new("ml", "hf-token"));
    }

    #[test]
    fn job_key_requires_a_namespace() {
        let mut job = TrainingJob::new("job-a", TrainingJobSpec::default());
        assert!(matches!(
            ObjectKey::for_job(&job),
            Err(Error::Validation { .. })
        ));

        job.metadata.namespace = Some("ml".into());
        assert_eq!(
            ObjectKey::for_job(&job).unwrap(),
            ObjectKey::new("ml", "job-a")
        );
    }

    #[test]
    fn kinds_map_to_kubernetes_kind_names() {
        assert_eq!(ResourceKind::Credential.kind_str(), "Secret");
        assert_eq!(ResourceKind::VolumeClaim.to_string(), "PersistentVolumeClaim");
        assert_eq!(ResourceKind::ComputeJob.kind_str(), "Job");
    }
}
