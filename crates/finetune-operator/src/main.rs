//! Finetune Operator - runs fine-tuning workloads declared as TrainingJob resources

mod controller_runner;
mod crds;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::Client;

use finetune_common::config::{
    DEFAULT_CREDENTIAL_KEY, DEFAULT_CREDENTIAL_SECRET_NAME, DEFAULT_DISK_SIZE_GB, DEFAULT_IMAGE,
    DEFAULT_MODEL, DEFAULT_STORAGE_CLASS, DEFAULT_VOLUME_MOUNT_PATH,
};
use finetune_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use finetune_common::ControllerConfig;

/// Finetune - CRD-driven operator for model fine-tuning jobs
#[derive(Parser, Debug)]
#[command(name = "finetune-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format (json or pretty)
    #[arg(long, env = "FINETUNE_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the TrainingJob controller (default mode)
    Controller(ControllerArgs),
}

/// Defaults and timings for the controller
#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Image used when a TrainingJob names none
    #[arg(long, env = "FINETUNE_DEFAULT_IMAGE", default_value = DEFAULT_IMAGE)]
    default_image: String,

    /// Model used when a TrainingJob names none
    #[arg(long, env = "FINETUNE_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    default_model: String,

    /// Model volume size in GiB used when a TrainingJob names none
    #[arg(long, env = "FINETUNE_DEFAULT_DISK_SIZE_GB", default_value_t = DEFAULT_DISK_SIZE_GB)]
    default_disk_size_gb: i32,

    /// Storage class used when a TrainingJob names none
    #[arg(long, env = "FINETUNE_DEFAULT_STORAGE_CLASS", default_value = DEFAULT_STORAGE_CLASS)]
    default_storage_class: String,

    /// Name of the per-namespace credential Secret
    #[arg(long, env = "FINETUNE_CREDENTIAL_SECRET", default_value = DEFAULT_CREDENTIAL_SECRET_NAME)]
    credential_secret: String,

    /// Key of the token inside the credential Secret
    #[arg(long, env = "FINETUNE_CREDENTIAL_KEY", default_value = DEFAULT_CREDENTIAL_KEY)]
    credential_key: String,

    /// Mount path of the model volume
    #[arg(long, env = "FINETUNE_VOLUME_MOUNT_PATH", default_value = DEFAULT_VOLUME_MOUNT_PATH)]
    volume_mount_path: String,

    /// Seconds between drift checks of a converged TrainingJob
    #[arg(long, env = "FINETUNE_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Seconds a dependent may stay terminating before it is reported stuck
    #[arg(long, env = "FINETUNE_DELETION_DEADLINE_SECS", default_value_t = 600)]
    deletion_deadline_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            default_disk_size_gb: DEFAULT_DISK_SIZE_GB,
            default_storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            credential_secret: DEFAULT_CREDENTIAL_SECRET_NAME.to_string(),
            credential_key: DEFAULT_CREDENTIAL_KEY.to_string(),
            volume_mount_path: DEFAULT_VOLUME_MOUNT_PATH.to_string(),
            resync_secs: 300,
            deletion_deadline_secs: 600,
        }
    }
}

impl ControllerArgs {
    fn into_config(self) -> anyhow::Result<ControllerConfig> {
        if self.default_disk_size_gb <= 0 {
            anyhow::bail!(
                "default disk size must be positive, got {}",
                self.default_disk_size_gb
            );
        }

        let mut config = ControllerConfig::default();
        config.defaults.image = self.default_image;
        config.defaults.model = self.default_model;
        config.defaults.disk_size_gb = self.default_disk_size_gb;
        config.defaults.storage_class_name = self.default_storage_class;
        config.credential_secret_name = self.credential_secret;
        config.credential_key = self.credential_key;
        config.volume_mount_path = self.volume_mount_path;
        config.resync_interval = Duration::from_secs(self.resync_secs);
        config.deletion_deadline = Duration::from_secs(self.deletion_deadline_secs);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::render_crds()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    let config = args.into_config()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    crds::ensure_crds(&client).await?;
    controller_runner::run_training_job_controller(client, config).await;

    Ok(())
}
