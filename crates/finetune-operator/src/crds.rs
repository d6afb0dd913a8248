//! CRD installation on startup
//!
//! The operator owns its CRD and applies it with server-side apply on every
//! start, so upgrades roll the schema forward.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use finetune_common::crd::TrainingJob;
use finetune_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn operator_crds() -> Vec<CrdDef> {
    vec![CrdDef {
        name: "trainingjobs.finetune.dev",
        crd: TrainingJob::crd(),
    }]
}

/// Render every CRD as a multi-document YAML stream
pub fn render_crds() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in operator_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&def.crd)?);
    }
    Ok(out)
}

/// Install or update the operator's CRDs
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in operator_crds() {
        tracing::info!(crd = def.name, "Installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    Ok(())
}
