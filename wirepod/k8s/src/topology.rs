//! Infers the cluster's pod, service, and node address ranges from live
//! cluster state, honoring any user-supplied overrides.

use crate::{Api, Client, ListParams, Node, Pod, Service};
use std::net::Ipv4Addr;
use thiserror::Error;
use wirepod_core::{ClusterTopology, Ipv4Net};

const DNS_SERVICE_NAMESPACE: &str = "kube-system";
const DNS_SERVICE_NAME: &str = "kube-dns";

/// A coarse inference that matches the default layout of common managed
/// clusters; users can override each range individually.
const INFERRED_PREFIX_LEN: u8 = 16;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no pod with a routable IPv4 address found in namespace {0}")]
    NoSuitablePod(String),

    #[error("unable to find DNS service kube-system/kube-dns")]
    DnsServiceMissing(#[source] kube::Error),

    #[error("DNS service kube-system/kube-dns has no usable cluster IP ({0:?})")]
    DnsServiceAddress(Option<String>),

    #[error("no node with an IPv4 internal address found")]
    NoSuitableNode,

    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// User-supplied address ranges; anything unset is inferred from the cluster.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopologyOverrides {
    pub pod_prefix: Option<Ipv4Net>,
    pub service_prefix: Option<Ipv4Net>,
    pub node_prefix: Option<Ipv4Net>,
}

/// Resolves the full topology. The DNS service is always read, even when the
/// service prefix is supplied, because its cluster IP doubles as the resolver
/// address for cluster-domain DNS.
pub async fn resolve(
    client: &Client,
    namespace: &str,
    overrides: &TopologyOverrides,
) -> Result<ClusterTopology, TopologyError> {
    let pod_prefix = match overrides.pod_prefix {
        Some(prefix) => prefix,
        None => {
            let pods = Api::<Pod>::namespaced(client.clone(), namespace)
                .list(&ListParams::default())
                .await?;
            pod_prefix_from(&pods.items)
                .ok_or_else(|| TopologyError::NoSuitablePod(namespace.to_string()))?
        }
    };

    let dns = Api::<Service>::namespaced(client.clone(), DNS_SERVICE_NAMESPACE)
        .get(DNS_SERVICE_NAME)
        .await
        .map_err(TopologyError::DnsServiceMissing)?;
    let service_ip = dns_service_ip(&dns)?;
    let service_prefix = overrides
        .service_prefix
        .unwrap_or_else(|| containing_prefix(service_ip));

    let node_prefix = match overrides.node_prefix {
        Some(prefix) => prefix,
        None => {
            let nodes = Api::<Node>::all(client.clone())
                .list(&ListParams::default())
                .await?;
            node_prefix_from(&nodes.items).ok_or(TopologyError::NoSuitableNode)?
        }
    };

    Ok(ClusterTopology {
        service_ip,
        pod_prefix,
        service_prefix,
        node_prefix,
    })
}

fn containing_prefix(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::new(addr, INFERRED_PREFIX_LEN)
        .expect("/16 is a valid prefix length")
        .trunc()
}

/// The first pod with its own (non-host-network) IPv4 address stands in for
/// the whole pod range.
fn pod_prefix_from(pods: &[Pod]) -> Option<Ipv4Net> {
    pods.iter().find_map(|pod| {
        if pod
            .spec
            .as_ref()
            .and_then(|spec| spec.host_network)
            .unwrap_or(false)
        {
            return None;
        }
        let ip = pod.status.as_ref()?.pod_ip.as_deref()?;
        ip.parse::<Ipv4Addr>().ok().map(containing_prefix)
    })
}

fn dns_service_ip(service: &Service) -> Result<Ipv4Addr, TopologyError> {
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.clone());
    cluster_ip
        .as_deref()
        .and_then(|ip| ip.parse().ok())
        .ok_or(TopologyError::DnsServiceAddress(cluster_ip))
}

fn node_prefix_from(nodes: &[Node]) -> Option<Ipv4Net> {
    nodes.iter().find_map(|node| {
        node.status
            .as_ref()?
            .addresses
            .as_ref()?
            .iter()
            .filter(|address| address.type_ == "InternalIP")
            .find_map(|address| address.address.parse::<Ipv4Addr>().ok())
            .map(containing_prefix)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(host_network: bool, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(Into::into),
                ..Default::default()
            }),
        }
    }

    fn node(addresses: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".into()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: (*type_).into(),
                            address: (*address).into(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn pod_prefix_skips_host_network_pods() {
        assert_eq!(pod_prefix_from(&[pod(true, Some("10.0.0.5"))]), None);
    }

    #[test]
    fn pod_prefix_skips_pods_without_addresses() {
        assert_eq!(pod_prefix_from(&[pod(false, None)]), None);
        assert_eq!(pod_prefix_from(&[pod(false, Some(""))]), None);
    }

    #[test]
    fn pod_prefix_skips_unparseable_addresses() {
        let pods = [pod(false, Some("100.")), pod(false, Some("100.64.0.1"))];
        assert_eq!(pod_prefix_from(&pods), Some("100.64.0.0/16".parse().unwrap()));
    }

    #[test]
    fn pod_prefix_takes_containing_slash_sixteen() {
        let pods = [pod(false, Some("100.64.12.34"))];
        assert_eq!(pod_prefix_from(&pods), Some("100.64.0.0/16".parse().unwrap()));
    }

    #[test]
    fn node_prefix_requires_internal_addresses() {
        assert_eq!(node_prefix_from(&[node(&[("ExternalIP", "34.123.34.12")])]), None);
        assert_eq!(node_prefix_from(&[node(&[("InternalIP", "100.")])]), None);
    }

    #[test]
    fn node_prefix_skips_invalid_nodes() {
        let nodes = [
            node(&[("InternalIP", "100.")]),
            node(&[("ExternalIP", "34.123.34.12"), ("InternalIP", "10.0.0.1")]),
        ];
        assert_eq!(node_prefix_from(&nodes), Some("10.0.0.0/16".parse().unwrap()));
    }

    #[test]
    fn dns_service_ip_rejects_empty() {
        let service = Service {
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                cluster_ip: Some("".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(dns_service_ip(&service).is_err());
    }

    #[test]
    fn dns_service_ip_parses_cluster_ip() {
        let service = Service {
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                cluster_ip: Some("172.0.0.1".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            dns_service_ip(&service).unwrap(),
            "172.0.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }
}
