//! Controller configuration
//!
//! Every default and timing knob the reconciler uses lives here and is
//! injected through the controller context, so tests can run the engine
//! with fast timings and without touching process-wide state.

use std::time::Duration;

/// Default container image
pub const DEFAULT_IMAGE: &str = "silentehrec/torchtune:latest";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-0.5B-Instruct";

/// Default model volume size in GiB
pub const DEFAULT_DISK_SIZE_GB: i32 = 50;

/// Default storage class for the model volume
pub const DEFAULT_STORAGE_CLASS: &str = "local-path";

/// Default access mode for the model volume
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Default name of the credential Secret (one per namespace)
pub const DEFAULT_CREDENTIAL_SECRET_NAME: &str = "hf-token";

/// Default key of the token inside the credential Secret
pub const DEFAULT_CREDENTIAL_KEY: &str = "token";

/// Default mount path of the model volume in both containers
pub const DEFAULT_VOLUME_MOUNT_PATH: &str = "/tmp";

/// Default training invocation
pub fn default_command() -> Vec<String> {
    [
        "tune",
        "run",
        "full_finetune_single_device",
        "-r=3",
        "--config",
        "qwen2_5/0.5B_full_single_device",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Values applied to TrainingJob fields the user left empty
#[derive(Clone, Debug, PartialEq)]
pub struct JobDefaults {
    /// Container image
    pub image: String,
    /// Model identifier
    pub model: String,
    /// Volume size in GiB
    pub disk_size_gb: i32,
    /// Storage class name
    pub storage_class_name: String,
    /// Volume access modes
    pub access_modes: Vec<String>,
    /// Training command
    pub command: Vec<String>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            disk_size_gb: DEFAULT_DISK_SIZE_GB,
            storage_class_name: DEFAULT_STORAGE_CLASS.to_string(),
            access_modes: vec![DEFAULT_ACCESS_MODE.to_string()],
            command: default_command(),
        }
    }
}

/// Full controller configuration
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Field defaults for TrainingJob specs
    pub defaults: JobDefaults,
    /// Name of the credential Secret
    pub credential_secret_name: String,
    /// Key of the token inside the credential Secret
    pub credential_key: String,
    /// Mount path of the model volume
    pub volume_mount_path: String,
    /// Requeue delay after a finalizer update race
    pub finalizer_requeue: Duration,
    /// Requeue delay after a failed resource sync
    pub error_requeue: Duration,
    /// Requeue delay while a dependent resource is still terminating
    pub deletion_requeue: Duration,
    /// Requeue delay once a deletion is reported stuck
    pub stuck_requeue: Duration,
    /// Requeue delay after a converged pass (drift detection)
    pub resync_interval: Duration,
    /// Delay between existence checks within one pass
    pub deletion_poll_interval: Duration,
    /// Existence checks per pass before handing back to the requeue
    pub deletion_poll_attempts: u32,
    /// How long a resource may stay terminating before it is reported stuck
    pub deletion_deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            defaults: JobDefaults::default(),
            credential_secret_name: DEFAULT_CREDENTIAL_SECRET_NAME.to_string(),
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            volume_mount_path: DEFAULT_VOLUME_MOUNT_PATH.to_string(),
            finalizer_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(15),
            deletion_requeue: Duration::from_secs(5),
            stuck_requeue: Duration::from_secs(300),
            resync_interval: Duration::from_secs(300),
            deletion_poll_interval: Duration::from_secs(1),
            deletion_poll_attempts: 3,
            deletion_deadline: Duration::from_secs(600),
        }
    }
}

impl ControllerConfig {
    /// Configuration for unit tests: no sleeping between existence checks
    pub fn for_testing() -> Self {
        Self {
            deletion_poll_interval: Duration::ZERO,
            deletion_poll_attempts: 1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_is_the_single_device_recipe() {
        let cmd = default_command();
        assert_eq!(cmd[0], "tune");
        assert_eq!(cmd.last().map(String::as_str), Some("qwen2_5/0.5B_full_single_device"));
        assert_eq!(cmd.len(), 6);
    }

    #[test]
    fn finalizer_races_retry_sooner_than_sync_failures() {
        let config = ControllerConfig::default();
        assert!(config.finalizer_requeue < config.error_requeue);
        assert!(config.error_requeue < config.stuck_requeue);
    }

    #[test]
    fn testing_config_never_sleeps() {
        let config = ControllerConfig::for_testing();
        assert_eq!(config.deletion_poll_interval, Duration::ZERO);
        assert_eq!(config.deletion_poll_attempts, 1);
        assert_eq!(config.defaults, JobDefaults::default());
    }
}
