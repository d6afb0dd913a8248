//! TrainingJob CRD types
//!
//! Defines `TrainingJob`, the user-declared record for a fine-tuning run.
//! The controller turns one TrainingJob into a credential Secret, a model
//! PersistentVolumeClaim and a one-shot batch Job.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::JobDefaults;
use crate::Error;

/// Access modes a TrainingJob may request for its model volume
pub const SUPPORTED_ACCESS_MODES: &[&str] = &[
    "ReadWriteOnce",
    "ReadOnlyMany",
    "ReadWriteMany",
    "ReadWriteOncePod",
];

// =============================================================================
// State
// =============================================================================

/// Lifecycle label written to `status.state` by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TrainingJobState {
    /// Accepted, nothing provisioned yet
    #[default]
    Pending,
    /// Waiting for a dependent resource to disappear before continuing
    AwaitingDeletion,
    /// Credential, volume claim and compute job match the spec
    Ready,
    /// Teardown of dependent resources is in progress
    Deleting,
    /// Spec is invalid or a dependent resource could not be managed
    Failed,
    /// A dependent resource did not disappear before the deletion deadline
    Stuck,
}

impl fmt::Display for TrainingJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::AwaitingDeletion => write!(f, "AwaitingDeletion"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
            Self::Stuck => write!(f, "Stuck"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Fine-tuning workload: model download followed by a training command
///
/// Empty fields are filled from [`JobDefaults`] before use; only
/// `huggingFaceSecret` has no default.
#[derive(CustomResource, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "finetune.dev",
    version = "v1",
    kind = "TrainingJob",
    plural = "trainingjobs",
    shortname = "tj",
    namespaced,
    status = "TrainingJobStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    /// Container image for both the download and the training container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Model identifier passed to `tune download`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,

    /// Size of the model volume in GiB
    #[serde(default, skip_serializing_if = "is_zero")]
    pub disk_size: i32,

    /// Storage class of the model volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    /// Access modes of the model volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// Training command run in the main container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Hugging Face token used to download the model
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hugging_face_secret: String,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

// The token never reaches logs through `?spec`.
impl fmt::Debug for TrainingJobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingJobSpec")
            .field("image", &self.image)
            .field("model", &self.model)
            .field("disk_size", &self.disk_size)
            .field("storage_class_name", &self.storage_class_name)
            .field("access_modes", &self.access_modes)
            .field("command", &self.command)
            .field(
                "hugging_face_secret",
                &if self.hugging_face_secret.is_empty() {
                    "<empty>"
                } else {
                    "<redacted>"
                },
            )
            .finish()
    }
}

impl TrainingJobSpec {
    /// Return a copy with every optional field filled from `defaults`.
    ///
    /// A non-positive disk size counts as unset. The credential value is
    /// copied as-is.
    pub fn with_defaults(&self, defaults: &JobDefaults) -> Self {
        let mut spec = self.clone();
        if spec.image.is_empty() {
            spec.image = defaults.image.clone();
        }
        if spec.model.is_empty() {
            spec.model = defaults.model.clone();
        }
        if spec.disk_size <= 0 {
            spec.disk_size = defaults.disk_size_gb;
        }
        if spec.storage_class_name.is_empty() {
            spec.storage_class_name = defaults.storage_class_name.clone();
        }
        if spec.access_modes.is_empty() {
            spec.access_modes = defaults.access_modes.clone();
        }
        if spec.command.is_empty() {
            spec.command = defaults.command.clone();
        }
        spec
    }

    /// Validate a defaulted spec.
    ///
    /// A missing credential cannot be fixed by retrying, so every failure here
    /// is a non-retryable validation error.
    pub fn validate(&self, job: &str) -> Result<(), Error> {
        if self.hugging_face_secret.is_empty() {
            return Err(Error::validation_for_field(
                job,
                "spec.huggingFaceSecret",
                "huggingFaceSecret is required",
            ));
        }
        if self.disk_size <= 0 {
            return Err(Error::validation_for_field(
                job,
                "spec.diskSize",
                format!("disk size must be positive, got {}", self.disk_size),
            ));
        }
        if self.access_modes.is_empty() {
            return Err(Error::validation_for_field(
                job,
                "spec.accessModes",
                "at least one access mode is required",
            ));
        }
        if let Some(mode) = self
            .access_modes
            .iter()
            .find(|m| !SUPPORTED_ACCESS_MODES.contains(&m.as_str()))
        {
            return Err(Error::validation_for_field(
                job,
                "spec.accessModes",
                format!("unsupported access mode '{}'", mode),
            ));
        }
        if self.command.is_empty() || self.command.iter().all(|c| c.is_empty()) {
            return Err(Error::validation_for_field(
                job,
                "spec.command",
                "command must not be empty",
            ));
        }
        Ok(())
    }
}

/// Observed state of a TrainingJob.
///
/// Written by the controller after a reconcile step; never read back by it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobStatus {
    /// Current lifecycle label
    #[serde(default)]
    pub state: TrainingJobState,

    /// Human-readable explanation of the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TrainingJobStatus {
    /// Create a status with the given state and details
    pub fn new(state: TrainingJobState, details: impl Into<String>) -> Self {
        Self {
            state,
            details: Some(details.into()),
        }
    }
}
