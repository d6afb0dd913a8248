//! Ownership checks for dependent resources
//!
//! A dependent is ours when its controller reference points at the
//! TrainingJob. One without any controller reference is adopted by stamping
//! ours on it, so the garbage collector cascades it like the rest. One
//! controlled by anything else is never touched.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use finetune_common::crd::TrainingJob;
use finetune_common::kube_utils::{owner_reference, ownership_of, Ownership};
use finetune_common::metrics::{self, ResourceOperation};
use finetune_common::Error;

use crate::store::{ObjectKey, ResourceKind, ResourceStore};

/// Refuse to touch an object controlled by someone else
pub(crate) fn ensure_controllable(
    kind: ResourceKind,
    key: &ObjectKey,
    meta: &ObjectMeta,
    owner_uid: &str,
) -> Result<(), Error> {
    match ownership_of(meta, owner_uid) {
        Ownership::Owned | Ownership::Unowned => Ok(()),
        Ownership::Foreign(other) => Err(Error::ownership(
            kind.kind_str(),
            key.name.clone(),
            format!("controlled by {}, not by TrainingJob {}", other, owner_uid),
        )),
    }
}

/// Stamp `job` as controller of a kept object that has none.
///
/// Existing non-controller references are preserved. Foreign objects yield
/// an ownership error. Returns true when the object was adopted.
pub(crate) async fn adopt_if_unowned(
    store: &dyn ResourceStore,
    kind: ResourceKind,
    key: &ObjectKey,
    meta: &ObjectMeta,
    job: &TrainingJob,
) -> Result<bool, Error> {
    let owner_uid = job.uid().unwrap_or_default();
    match ownership_of(meta, &owner_uid) {
        Ownership::Owned => Ok(false),
        Ownership::Foreign(_) => ensure_controllable(kind, key, meta, &owner_uid).map(|_| false),
        Ownership::Unowned => {
            let mut references = meta.owner_references.clone().unwrap_or_default();
            references.push(owner_reference(job)?);
            store
                .set_owner_references(kind, key, meta.resource_version.clone(), references)
                .await?;
            metrics::record_resource_operation(kind.kind_str(), ResourceOperation::Update);
            info!(%kind, object = %key, "Adopted resource without a controller");
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockResourceStore;
    use finetune_common::crd::TrainingJobSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn job() -> TrainingJob {
        let mut job = TrainingJob::new("job-a", TrainingJobSpec::default());
        job.metadata.namespace = Some("ml".into());
        job.metadata.uid = Some("uid-a".into());
        job
    }

    fn reference(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "other".into(),
            uid: uid.into(),
            controller: Some(controller),
            block_owner_deletion: None,
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("ml", "job-a")
    }

    /// Story: an object with no controller gets our reference, keeping its others
    #[tokio::test]
    async fn story_unowned_object_is_adopted() {
        let mut store = MockResourceStore::new();
        store
            .expect_set_owner_references()
            .withf(|kind, _, rv, refs| {
                *kind == ResourceKind::VolumeClaim
                    && rv.as_deref() == Some("42")
                    && refs.len() == 2
                    && refs[0].uid == "uid-cm"
                    && refs[1].uid == "uid-a"
                    && refs[1].controller == Some(true)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let meta = ObjectMeta {
            resource_version: Some("42".into()),
            owner_references: Some(vec![reference("uid-cm", false)]),
            ..Default::default()
        };
        let adopted = adopt_if_unowned(&store, ResourceKind::VolumeClaim, &key(), &meta, &job())
            .await
            .unwrap();
        assert!(adopted);
    }

    #[tokio::test]
    async fn owned_object_is_left_alone() {
        let mut store = MockResourceStore::new();
        store.expect_set_owner_references().never();

        let meta = ObjectMeta {
            owner_references: Some(vec![reference("uid-a", true)]),
            ..Default::default()
        };
        let adopted = adopt_if_unowned(&store, ResourceKind::ComputeJob, &key(), &meta, &job())
            .await
            .unwrap();
        assert!(!adopted);
    }

    #[tokio::test]
    async fn foreign_object_is_not_adopted() {
        let mut store = MockResourceStore::new();
        store.expect_set_owner_references().never();

        let meta = ObjectMeta {
            owner_references: Some(vec![reference("uid-other", true)]),
            ..Default::default()
        };
        let err = adopt_if_unowned(&store, ResourceKind::Credential, &key(), &meta, &job())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
    }

    #[test]
    fn unowned_objects_are_controllable() {
        let meta = ObjectMeta::default();
        assert!(ensure_controllable(ResourceKind::Credential, &key(), &meta, "uid-a").is_ok());
    }
}
