use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use kubert::lease::Claim;
use pod_configmap_controller_k8s_api as k8s;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time};

const FIELD_MANAGER: &str = "pod-configmap-controller";

/// Creates the election Lease if it does not exist yet and spawns the claim
/// task. The returned watch yields the current claim; callers compare its
/// holder against their own identity.
pub(crate) async fn init<T>(
    runtime: &kubert::Runtime<T>,
    name: &str,
    namespace: &str,
    claimant: &str,
    lease_duration: Duration,
    renew_grace_period: Duration,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let lease = coordv1::Lease {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            // Specifying a resource version of "0" means that we will only
            // create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let patch = kube::api::Patch::Apply(lease);
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);

    // An individual request may hit a transient error, so we try a few
    // times with a brief pause.
    let mut tries = 3;
    loop {
        tries -= 1;
        let error = match api.patch(name, &patch_params, &patch).await {
            Ok(_) => {
                tracing::info!(%namespace, lease = %name, "created Lease");
                break;
            }
            Err(kube::Error::Api(error)) if error.code < 500 => {
                tracing::debug!(?error, "Lease already exists");
                break;
            }
            Err(error) => error,
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(?error, "failed to create Lease, retrying in 1s");
        time::sleep(Duration::from_secs(1)).await;
    }

    let params = kubert::LeaseParams {
        name: name.to_string(),
        namespace: namespace.to_string(),
        claimant: claimant.to_string(),
        lease_duration,
        renew_grace_period,
        field_manager: Some(FIELD_MANAGER.into()),
    };
    let (claims, _task) = runtime.spawn_lease(params).await?;
    Ok(claims)
}
