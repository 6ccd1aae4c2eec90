//! Wait routines: the first ready pod of a revision, and a load balancer's
//! ingress address. Both consume long-polled watch streams under a fixed
//! budget; both are injectable so the orchestration can be tested without a
//! cluster.

use crate::{workload::REVISION_ANNOTATION, Api, Client, Pod, ResourceExt, Service};
use async_trait::async_trait;
use futures::prelude::*;
use k8s_openapi::api::core::v1::LoadBalancerIngress;
use kube::runtime::watcher::{watcher, Config, Event};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info};
use wirepod_core::TUNNEL_PORT;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pause before re-polling a watch stream that errored.
const WATCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {}s waiting for a ready pod with revision {revision}", WAIT_TIMEOUT.as_secs())]
    PodReadyTimeout { revision: String },

    #[error("timed out after {}s waiting for the agent's advertised address", WAIT_TIMEOUT.as_secs())]
    PodAddressTimeout,

    #[error("timed out after {}s waiting for load balancer {namespace}/{name} to be ready", WAIT_TIMEOUT.as_secs())]
    IngressNotReady { namespace: String, name: String },

    #[error("load balancer {namespace}/{name} reported an ingress entry with no address")]
    IngressAddressMissing { namespace: String, name: String },

    #[error("unable to resolve load balancer hostname {hostname:?} to an IPv4 address")]
    DnsResolveFailed { hostname: String },

    #[error("load balancer {namespace}/{name} reported an unparseable ingress address {address:?}")]
    BadIngressAddress {
        namespace: String,
        name: String,
        address: String,
    },
}

/// Waits for the first ready pod carrying the given revision annotation.
#[async_trait]
pub trait PodWaiter {
    async fn ready_pod(
        &self,
        client: &Client,
        namespace: &str,
        selector: &BTreeMap<String, String>,
        revision: &str,
    ) -> Result<Pod, WaitError>;
}

/// Waits for a load-balancer service to publish a reachable IPv4 address.
#[async_trait]
pub trait LoadBalancerWaiter {
    async fn ingress_address(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<SocketAddr, WaitError>;
}

/// The objects a watch event reports as live. A restart event carries the
/// whole current set, so an object that already satisfies the wait when the
/// watch starts is still seen.
fn live_objects<K>(event: Event<K>) -> Vec<K> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) => vec![obj],
        Event::Delete(_) | Event::Init | Event::InitDone => Vec::new(),
    }
}

pub struct WatchPodWaiter;

#[async_trait]
impl PodWaiter for WatchPodWaiter {
    async fn ready_pod(
        &self,
        client: &Client,
        namespace: &str,
        selector: &BTreeMap<String, String>,
        revision: &str,
    ) -> Result<Pod, WaitError> {
        let api = Api::<Pod>::namespaced(client.clone(), namespace);
        let config = Config::default().labels(&label_selector(selector));
        let stream = watcher(api, config);
        tokio::pin!(stream);

        info!(%revision, "Waiting for new pod to be ready");

        time::timeout(WAIT_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(event)) => {
                        for pod in live_objects(event) {
                            if pod_revision_matches(&pod, revision) && pod_ready(&pod) {
                                info!(pod = %pod.name_any(), "Pod is ready");
                                return pod;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        debug!(%error, "Pod watch interrupted; retrying");
                        time::sleep(WATCH_RETRY_PAUSE).await;
                    }
                    None => time::sleep(WATCH_RETRY_PAUSE).await,
                }
            }
        })
        .await
        .map_err(|_| WaitError::PodReadyTimeout {
            revision: revision.to_string(),
        })
    }
}

pub struct WatchLoadBalancerWaiter;

#[async_trait]
impl LoadBalancerWaiter for WatchLoadBalancerWaiter {
    async fn ingress_address(
        &self,
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<SocketAddr, WaitError> {
        let api = Api::<Service>::namespaced(client.clone(), namespace);
        let config = Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(api, config);
        tokio::pin!(stream);

        info!(%namespace, %name, "Waiting for load balancer to be ready");

        // The wait is over as soon as any ingress entry appears; an entry
        // without an address is its own failure, not a reason to keep
        // waiting.
        let entry = time::timeout(WAIT_TIMEOUT, async {
            loop {
                match stream.next().await {
                    Some(Ok(event)) => {
                        let found = live_objects(event)
                            .iter()
                            .find_map(|svc| first_ingress(svc));
                        if let Some(entry) = found {
                            return entry;
                        }
                    }
                    Some(Err(error)) => {
                        debug!(%error, "Service watch interrupted; retrying");
                        time::sleep(WATCH_RETRY_PAUSE).await;
                    }
                    None => time::sleep(WATCH_RETRY_PAUSE).await,
                }
            }
        })
        .await
        .map_err(|_| WaitError::IngressNotReady {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

        let target = ingress_target(&entry).ok_or_else(|| WaitError::IngressAddressMissing {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

        match target {
            IngressTarget::Ip(address) => {
                let ip: Ipv4Addr =
                    address
                        .parse()
                        .map_err(|_| WaitError::BadIngressAddress {
                            namespace: namespace.to_string(),
                            name: name.to_string(),
                            address,
                        })?;
                Ok(SocketAddr::new(IpAddr::V4(ip), TUNNEL_PORT))
            }
            IngressTarget::Hostname(hostname) => {
                info!(%hostname, "Load balancer ready, waiting for DNS to resolve");
                let ip = resolve_ipv4(&hostname).await?;
                Ok(SocketAddr::new(IpAddr::V4(ip), TUNNEL_PORT))
            }
        }
    }
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn pod_revision_matches(pod: &Pod, revision: &str) -> bool {
    pod.annotations()
        .get(REVISION_ANNOTATION)
        .is_some_and(|value| value == revision)
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn first_ingress(service: &Service) -> Option<LoadBalancerIngress> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()
        .cloned()
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum IngressTarget {
    Ip(String),
    Hostname(String),
}

fn ingress_target(entry: &LoadBalancerIngress) -> Option<IngressTarget> {
    if let Some(hostname) = entry.hostname.as_ref().filter(|h| !h.is_empty()) {
        return Some(IngressTarget::Hostname(hostname.clone()));
    }
    entry
        .ip
        .as_ref()
        .filter(|ip| !ip.is_empty())
        .map(|ip| IngressTarget::Ip(ip.clone()))
}

/// Polls DNS until the hostname resolves to an IPv4 address, under its own
/// wait budget.
async fn resolve_ipv4(hostname: &str) -> Result<Ipv4Addr, WaitError> {
    time::timeout(WAIT_TIMEOUT, async {
        loop {
            let found = tokio::net::lookup_host((hostname, TUNNEL_PORT))
                .await
                .ok()
                .and_then(|addrs| {
                    addrs.into_iter().find_map(|addr| match addr.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })
                });
            match found {
                Some(ip) => return ip,
                None => time::sleep(POLL_INTERVAL).await,
            }
        }
    })
    .await
    .map_err(|_| WaitError::DnsResolveFailed {
        hostname: hostname.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerStatus, PodCondition, PodStatus, ServiceStatus};
    use kube::api::ObjectMeta;
    use maplit::{btreemap, convert_args};

    fn pod(revision: Option<&str>, conditions: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".into()),
                annotations: revision.map(|r| {
                    convert_args!(btreemap!(REVISION_ANNOTATION => r))
                }),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|(type_, status)| PodCondition {
                            type_: (*type_).into(),
                            status: (*status).into(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    fn service(ingress: Option<LoadBalancerIngress>) -> Service {
        Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: ingress.map(|i| vec![i]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_acceptance_requires_revision_and_readiness() {
        let ready = [("PodScheduled", "True"), ("Ready", "True")];
        assert!(pod_ready(&pod(Some("rev"), &ready)));
        assert!(pod_revision_matches(&pod(Some("rev"), &ready), "rev"));

        assert!(!pod_ready(&pod(Some("rev"), &[("Ready", "False")])));
        assert!(!pod_ready(&pod(Some("rev"), &[])));
        assert!(!pod_revision_matches(&pod(Some("stale"), &ready), "rev"));
        assert!(!pod_revision_matches(&pod(None, &ready), "rev"));
    }

    #[test]
    fn live_objects_covers_restarts() {
        let ready = [("Ready", "True")];

        let applied = live_objects(Event::Apply(pod(Some("rev"), &ready)));
        assert_eq!(applied.len(), 1);

        // A pod that predates the watch only shows up via InitApply events.
        let restarted: Vec<_> = [
            pod(Some("stale"), &ready),
            pod(Some("rev"), &ready),
        ]
        .into_iter()
        .flat_map(|p| live_objects(Event::InitApply(p)))
        .collect();
        assert_eq!(restarted.len(), 2);
        assert!(restarted
            .iter()
            .any(|pod| pod_revision_matches(pod, "rev") && pod_ready(pod)));

        assert!(live_objects(Event::Delete(pod(Some("rev"), &ready))).is_empty());
    }

    #[test]
    fn first_ingress_requires_an_entry() {
        let entry = LoadBalancerIngress {
            ip: Some("198.51.100.7".into()),
            ..Default::default()
        };
        assert_eq!(first_ingress(&service(Some(entry.clone()))), Some(entry));
        assert_eq!(first_ingress(&service(None)), None);
        assert_eq!(first_ingress(&Service::default()), None);
    }

    #[test]
    fn ingress_target_prefers_hostname() {
        assert_eq!(
            ingress_target(&LoadBalancerIngress {
                hostname: Some("lb.example.com".into()),
                ip: Some("198.51.100.7".into()),
                ..Default::default()
            }),
            Some(IngressTarget::Hostname("lb.example.com".into()))
        );
        assert_eq!(
            ingress_target(&LoadBalancerIngress {
                ip: Some("198.51.100.7".into()),
                ..Default::default()
            }),
            Some(IngressTarget::Ip("198.51.100.7".into()))
        );
        // An entry can exist before its address is published; that is a
        // failure for the caller to report, not a target.
        assert_eq!(
            ingress_target(&LoadBalancerIngress {
                hostname: Some("".into()),
                ip: Some("".into()),
                ..Default::default()
            }),
            None
        );
        assert_eq!(ingress_target(&LoadBalancerIngress::default()), None);
    }

    #[test]
    fn label_selector_joins_pairs() {
        let selector: BTreeMap<String, String> =
            convert_args!(btreemap!("app" => "echo", "tier" => "web"));
        assert_eq!(label_selector(&selector), "app=echo,tier=web");
    }
}
