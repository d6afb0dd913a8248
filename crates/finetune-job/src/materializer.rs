//! Dependent resource construction
//!
//! Pure functions from a defaulted TrainingJob spec to the Secret,
//! PersistentVolumeClaim and Job bodies the synchronizers write, plus the
//! drift checks that compare an existing object against its desired shape.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Secret, SecretKeySelector,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use finetune_common::crd::{TrainingJob, TrainingJobSpec};
use finetune_common::kube_utils::{
    owner_reference, parse_storage_bytes, standard_labels, storage_quantity,
};
use finetune_common::{ControllerConfig, Error};

use crate::store::ObjectKey;

/// Name of the model volume inside the Job pod
pub const MODEL_VOLUME_NAME: &str = "model";

/// Environment variable carrying the model hub token
pub const TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Pod template annotation holding the digest of every input the Job was built from
pub const INPUTS_DIGEST_ANNOTATION: &str = "finetune.dev/inputs-digest";

const STORAGE_RESOURCE: &str = "storage";

fn metadata(job: &TrainingJob, key: &ObjectKey) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        labels: Some(standard_labels(&job.name_any())),
        owner_references: Some(vec![owner_reference(job)?]),
        ..Default::default()
    })
}

// =============================================================================
// Credential
// =============================================================================

/// Key of the credential Secret for a TrainingJob
pub fn credential_key(job_key: &ObjectKey, config: &ControllerConfig) -> ObjectKey {
    job_key.sibling(config.credential_secret_name.clone())
}

/// Build the credential Secret holding the spec's token
pub fn build_credential(
    job: &TrainingJob,
    spec: &TrainingJobSpec,
    key: &ObjectKey,
    config: &ControllerConfig,
) -> Result<Secret, Error> {
    Ok(Secret {
        metadata: metadata(job, key)?,
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            config.credential_key.clone(),
            ByteString(spec.hugging_face_secret.as_bytes().to_vec()),
        )])),
        ..Default::default()
    })
}

/// Token stored in `secret` under `data_key`, if any
pub fn credential_token<'a>(secret: &'a Secret, data_key: &str) -> Option<&'a [u8]> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(data_key)) {
        return Some(bytes.0.as_slice());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(data_key))
        .map(String::as_bytes)
}

// =============================================================================
// Volume claim
// =============================================================================

/// Build the model volume claim sized `<diskSize>Gi`
pub fn build_volume_claim(
    job: &TrainingJob,
    spec: &TrainingJobSpec,
    key: &ObjectKey,
) -> Result<PersistentVolumeClaim, Error> {
    Ok(PersistentVolumeClaim {
        metadata: metadata(job, key)?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(spec.access_modes.clone()),
            storage_class_name: Some(spec.storage_class_name.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    STORAGE_RESOURCE.to_string(),
                    storage_quantity(spec.disk_size),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Describe how an existing claim differs from the spec.
///
/// Only size and storage class are compared; both are immutable for our
/// purposes, so any difference means delete and recreate.
pub fn volume_drift(claim: &PersistentVolumeClaim, spec: &TrainingJobSpec) -> Option<String> {
    let claim_spec = claim.spec.as_ref();

    let current_size = claim_spec
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE_RESOURCE));
    let desired = storage_quantity(spec.disk_size);
    let size_matches = current_size
        .and_then(parse_storage_bytes)
        .zip(parse_storage_bytes(&desired))
        .is_some_and(|(current, wanted)| current == wanted);
    if !size_matches {
        return Some(format!(
            "storage request {} does not match {}",
            current_size.map(|q| q.0.as_str()).unwrap_or("<unset>"),
            desired.0
        ));
    }

    let current_class = claim_spec
        .and_then(|s| s.storage_class_name.as_deref())
        .unwrap_or_default();
    if current_class != spec.storage_class_name {
        return Some(format!(
            "storage class '{}' does not match '{}'",
            current_class, spec.storage_class_name
        ));
    }

    None
}

// =============================================================================
// Compute job
// =============================================================================

/// Digest of everything the Job's pods are built from, token included.
///
/// Stored on the pod template so a change made while a pass failed halfway
/// is still seen as drift by every later pass.
pub fn inputs_digest(spec: &TrainingJobSpec, key: &ObjectKey, config: &ControllerConfig) -> String {
    let mut hasher = Sha256::new();
    let fields = [
        spec.hugging_face_secret.as_str(),
        spec.model.as_str(),
        spec.image.as_str(),
        key.name.as_str(),
        config.credential_secret_name.as_str(),
        config.credential_key.as_str(),
        config.volume_mount_path.as_str(),
    ];
    for field in fields.iter().copied().chain(spec.command.iter().map(String::as_str)) {
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Build the one-shot Job: `tune download` init container, then `command`
pub fn build_compute_job(
    job: &TrainingJob,
    spec: &TrainingJobSpec,
    key: &ObjectKey,
    config: &ControllerConfig,
) -> Result<Job, Error> {
    let token_env = EnvVar {
        name: TOKEN_ENV_VAR.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: config.credential_secret_name.clone(),
                key: config.credential_key.clone(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mounts = vec![VolumeMount {
        name: MODEL_VOLUME_NAME.to_string(),
        mount_path: config.volume_mount_path.clone(),
        ..Default::default()
    }];

    let download = Container {
        name: format!("{}-init", key.name),
        image: Some(spec.image.clone()),
        command: Some(vec![
            "tune".to_string(),
            "download".to_string(),
            spec.model.clone(),
        ]),
        env: Some(vec![
            token_env.clone(),
            EnvVar {
                name: "PYTHONUNBUFFERED".to_string(),
                value: Some("1".to_string()),
                ..Default::default()
            },
        ]),
        tty: Some(true),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    };

    let train = Container {
        name: key.name.clone(),
        image: Some(spec.image.clone()),
        command: Some(spec.command.clone()),
        env: Some(vec![token_env]),
        tty: Some(true),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let metadata = metadata(job, key)?;
    Ok(Job {
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: metadata.labels.clone(),
                    annotations: Some(BTreeMap::from([(
                        INPUTS_DIGEST_ANNOTATION.to_string(),
                        inputs_digest(spec, key, config),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(vec![download]),
                    containers: vec![train],
                    volumes: Some(vec![Volume {
                        name: MODEL_VOLUME_NAME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: key.name.clone(),
                            read_only: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        metadata,
        ..Default::default()
    })
}

fn pod_spec(job: &Job) -> Option<&PodSpec> {
    job.spec.as_ref().and_then(|s| s.template.spec.as_ref())
}

fn main_container(job: &Job) -> Option<&Container> {
    pod_spec(job).and_then(|p| p.containers.first())
}

fn download_command(job: &Job) -> Option<&[String]> {
    pod_spec(job)
        .and_then(|p| p.init_containers.as_ref())
        .and_then(|c| c.first())
        .and_then(|c| c.command.as_deref())
}

fn mounted_claim(job: &Job) -> Option<&str> {
    pod_spec(job)
        .and_then(|p| p.volumes.as_ref())
        .and_then(|v| v.iter().find(|v| v.name == MODEL_VOLUME_NAME))
        .and_then(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.as_str())
}

fn inputs_digest_of(job: &Job) -> Option<&str> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(INPUTS_DIGEST_ANNOTATION))
        .map(String::as_str)
}

/// Describe how an existing Job differs from the desired one.
///
/// The readable checks (image, command, model, claim) come first for the log
/// line; the inputs digest catches the rest, the token in particular.
pub fn compute_drift(existing: &Job, desired: &Job) -> Option<String> {
    let current_image = main_container(existing).and_then(|c| c.image.as_deref());
    let wanted_image = main_container(desired).and_then(|c| c.image.as_deref());
    if current_image != wanted_image {
        return Some(format!(
            "image {} does not match {}",
            current_image.unwrap_or("<unset>"),
            wanted_image.unwrap_or("<unset>")
        ));
    }

    let current_command = main_container(existing).and_then(|c| c.command.as_deref());
    if current_command != main_container(desired).and_then(|c| c.command.as_deref()) {
        return Some("command changed".to_string());
    }

    if download_command(existing) != download_command(desired) {
        return Some(format!(
            "model download changed to {}",
            download_command(desired).unwrap_or_default().join(" ")
        ));
    }

    if mounted_claim(existing) != mounted_claim(desired) {
        return Some(format!(
            "model volume points at claim {} instead of {}",
            mounted_claim(existing).unwrap_or("<unset>"),
            mounted_claim(desired).unwrap_or("<unset>")
        ));
    }

    if inputs_digest_of(existing) != inputs_digest_of(desired) {
        return Some("credential or pod inputs changed".to_string());
    }

    None
}
