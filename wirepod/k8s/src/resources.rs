//! The cluster objects created alongside a run: the config secret, the
//! optional load-balancer ingress service, and the network policy admitting
//! tunnel traffic. All are applied server-side with a fixed field manager so
//! reruns converge, and deleted on teardown tolerating not-found.

use crate::{Api, Client, DeleteParams, NetworkPolicy, Patch, PatchParams, Secret, Service};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};
use wirepod_core::{OverlayConfig, CONFIG_FILE_NAME, TUNNEL_PORT};

/// Annotations requesting a layer-4 pass-through balancer from the major
/// cloud providers. Azure needs none.
const LOAD_BALANCER_ANNOTATIONS: &[(&str, &str)] = &[
    ("service.beta.kubernetes.io/aws-load-balancer-backend-protocol", "tcp"),
    ("service.beta.kubernetes.io/aws-load-balancer-internal", "false"),
    ("service.beta.kubernetes.io/aws-load-balancer-type", "nlb"),
    (
        "service.beta.kubernetes.io/aws-load-balancer-cross-zone-load-balancing-enabled",
        "true",
    ),
    ("cloud.google.com/l4-rbs", "enabled"),
];

fn apply_params() -> PatchParams {
    PatchParams::apply(crate::FIELD_MANAGER).force()
}

/// Serializes the overlay config and applies it as a secret under the
/// `wg.yml` key.
pub async fn apply_config_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    config: &OverlayConfig,
) -> Result<()> {
    let doc = serde_yaml::to_string(config).context("unable to serialize overlay config")?;

    let secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name, "namespace": namespace },
        "stringData": { CONFIG_FILE_NAME: doc },
    });

    Api::<Secret>::namespaced(client.clone(), namespace)
        .patch(name, &apply_params(), &Patch::Apply(&secret))
        .await
        .with_context(|| format!("unable to apply secret {namespace}/{name}"))?;

    debug!(%namespace, %name, "Applied config secret");
    Ok(())
}

/// Applies the UDP load-balancer service fronting the tunnel port. Traffic
/// policies are `Local` on both paths so source addresses survive
/// translation.
pub async fn apply_load_balancer(
    client: &Client,
    namespace: &str,
    name: &str,
    selector: &BTreeMap<String, String>,
) -> Result<()> {
    let annotations: BTreeMap<&str, &str> = LOAD_BALANCER_ANNOTATIONS.iter().copied().collect();

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "annotations": annotations,
        },
        "spec": {
            "type": "LoadBalancer",
            "selector": selector,
            "ports": [{
                "name": "wireguard",
                "protocol": "UDP",
                "port": TUNNEL_PORT,
                "targetPort": TUNNEL_PORT,
            }],
            "externalTrafficPolicy": "Local",
            "internalTrafficPolicy": "Local",
        },
    });

    Api::<Service>::namespaced(client.clone(), namespace)
        .patch(name, &apply_params(), &Patch::Apply(&service))
        .await
        .with_context(|| format!("unable to apply service {namespace}/{name}"))?;

    debug!(%namespace, %name, "Applied load balancer service");
    Ok(())
}

/// Applies the ingress policy admitting UDP on the reachability port to the
/// target pods.
pub async fn apply_network_policy(
    client: &Client,
    namespace: &str,
    name: &str,
    selector: &BTreeMap<String, String>,
    port: u16,
) -> Result<()> {
    let policy = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "podSelector": { "matchLabels": selector },
            "ingress": [{
                "ports": [{ "protocol": "UDP", "port": port }],
            }],
            "policyTypes": ["Ingress"],
        },
    });

    Api::<NetworkPolicy>::namespaced(client.clone(), namespace)
        .patch(name, &apply_params(), &Patch::Apply(&policy))
        .await
        .with_context(|| format!("unable to apply network policy {namespace}/{name}"))?;

    debug!(%namespace, %name, "Applied network policy");
    Ok(())
}

/// Deletes everything a run may have created, tolerating objects that were
/// never created (load-balancer service in direct-access mode, for example).
/// Failures are logged; teardown keeps going.
pub async fn delete_side_resources(client: &Client, namespace: &str, name: &str) {
    delete::<Service>(client, namespace, name).await;
    delete::<NetworkPolicy>(client, namespace, name).await;
    delete::<Secret>(client, namespace, name).await;
}

async fn delete<K>(client: &Client, namespace: &str, name: &str)
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let api = Api::<K>::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => info!(%kind, %namespace, %name, "Deleted"),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(%kind, %namespace, %name, "Already gone")
        }
        Err(error) => {
            tracing::warn!(%error, %kind, %namespace, %name, "Unable to delete resource")
        }
    }
}
