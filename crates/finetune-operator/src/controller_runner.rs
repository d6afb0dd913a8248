//! Controller wiring for TrainingJob resources

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use finetune_common::crd::TrainingJob;
use finetune_common::{ControllerConfig, LABEL_MANAGED_BY, LABEL_MANAGED_BY_FINETUNE};
use finetune_job::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Selects the dependents the operator created
fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, LABEL_MANAGED_BY_FINETUNE)
}

/// Run the TrainingJob controller until a shutdown signal arrives.
///
/// Owned Secrets, claims and Jobs are watched too, so a dependent that is
/// changed or removed out of band triggers a pass on its TrainingJob.
pub async fn run_training_job_controller(client: Client, config: ControllerConfig) {
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let jobs: Api<TrainingJob> = Api::all(client.clone());
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let owned = || watcher().labels(&managed_selector());

    tracing::info!("Starting TrainingJob controller");

    Controller::new(jobs, watcher())
        .owns(Api::<Secret>::all(client.clone()), owned())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), owned())
        .owns(Api::<Job>::all(client), owned())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("TrainingJob"))
        .await;

    tracing::info!("TrainingJob controller stopped");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
