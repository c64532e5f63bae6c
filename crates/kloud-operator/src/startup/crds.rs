//! CRD installation
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the installed versions always match the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use kloud_common::crd::all_crds;
use kloud_common::retry::{retry_with_backoff, RetryConfig};
use kloud_common::{Error, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "kloud-controller";

/// Install or update every kloud CRD
pub async fn ensure_crds_installed(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let retry = RetryConfig::with_max_attempts(5);

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("generated CRD has no name"))?;
        info!(crd = %name, "Installing CRD");
        let (api, params, crd, crd_name) = (&api, &params, &crd, name.as_str());
        retry_with_backoff(&retry, &format!("install {name}"), || async move {
            api.patch(crd_name, params, &Patch::Apply(crd)).await?;
            Ok(())
        })
        .await?;
    }

    info!("All kloud CRDs installed/updated");
    Ok(())
}
