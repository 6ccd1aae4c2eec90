//! Workstation-side orchestration: resolve the cluster topology, synthesize
//! the overlay config, hijack the workload, establish reachability, and bring
//! up the local end of the tunnel.

use crate::teardown::TeardownStack;
use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::SocketAddr;
use tracing::{debug, info};
use wirepod_core::{
    overlay_hosts, select_overlay_prefix, ClusterTopology, Keypair, OverlayConfig, TUNNEL_PORT,
};
use wirepod_k8s::{
    exec, resources, side_resource_name,
    topology::{self, TopologyOverrides},
    wait::{LoadBalancerWaiter, PodWaiter, WatchLoadBalancerWaiter, WatchPodWaiter},
    workload::{AgentSpec, RevisionSource, TargetRef, TargetWorkload, UuidRevisions},
    Client, ResourceExt,
};
use wirepod_tunnel as tunnel;

pub(crate) struct Settings {
    pub namespace: String,
    pub container: Option<String>,
    pub agent_image: String,
    pub keep_resources: bool,
    pub direct: bool,
    pub overlay: Option<String>,
    pub local_address: Option<SocketAddr>,
    pub overrides: TopologyOverrides,
    pub target: Vec<String>,
}

pub(crate) async fn run(client: Client, settings: Settings) -> Result<()> {
    let target = TargetRef::parse(&settings.target)
        .context("unable to resolve target kubernetes object")?;

    let topology = topology::resolve(&client, &settings.namespace, &settings.overrides)
        .await
        .context("unable to obtain Kubernetes cluster details")?;
    debug!(
        service_ip = %topology.service_ip,
        service_prefix = %topology.service_prefix,
        pod_prefix = %topology.pod_prefix,
        node_prefix = %topology.node_prefix,
        "Resolved Kubernetes cluster details",
    );

    let config = build_overlay_config(
        &topology,
        settings.overlay.as_deref(),
        settings.direct,
        settings.local_address,
    )
    .context("unable to create overlay config")?;

    let mut teardown = TeardownStack::new();
    let started = start(&client, &settings, &target, &config, &topology, &mut teardown).await;

    let result = match started {
        Ok(()) => {
            info!("Started. Use Ctrl-C to exit...");
            crate::signal::shutdown().await
        }
        Err(error) => Err(error),
    };

    teardown.unwind().await;
    result
}

/// Builds the shared overlay config. A user-supplied overlay prefix is
/// accepted without overlap checks; an invalid one fails here, before any
/// cluster mutation.
fn build_overlay_config(
    topology: &ClusterTopology,
    overlay: Option<&str>,
    direct: bool,
    local_address: Option<SocketAddr>,
) -> Result<OverlayConfig> {
    let overlay_prefix = match overlay {
        Some(prefix) => prefix
            .parse::<Ipv4Net>()
            .with_context(|| format!("unable to parse overlay prefix {prefix:?}"))?,
        None => select_overlay_prefix(topology)?,
    };
    debug!(overlay = %overlay_prefix, "Determined overlay prefix");

    let (local_overlay_addr, agent_overlay_addr) = overlay_hosts(overlay_prefix);

    Ok(OverlayConfig {
        direct_access: direct,
        local_key: Keypair::generate(),
        agent_key: Keypair::generate(),
        local_endpoint: local_address,
        overlay_prefix,
        local_overlay_addr,
        agent_overlay_addr,
        allowed_prefixes: vec![
            topology.pod_prefix,
            topology.service_prefix,
            topology.node_prefix,
            overlay_prefix,
        ],
    })
}

async fn start(
    client: &Client,
    settings: &Settings,
    target: &TargetRef,
    config: &OverlayConfig,
    topology: &ClusterTopology,
    teardown: &mut TeardownStack,
) -> Result<()> {
    if config.local_endpoint.is_some() {
        // The workstation is the listener; bring it up before the agent
        // starts dialing.
        tunnel_setup(config, topology, None, teardown).await?;
        cluster_setup(
            client,
            settings,
            target,
            config,
            &UuidRevisions,
            &WatchPodWaiter,
            &WatchLoadBalancerWaiter,
            teardown,
        )
        .await?;
    } else {
        let agent_endpoint = cluster_setup(
            client,
            settings,
            target,
            config,
            &UuidRevisions,
            &WatchPodWaiter,
            &WatchLoadBalancerWaiter,
            teardown,
        )
        .await?;
        tunnel_setup(config, topology, agent_endpoint, teardown).await?;
    }

    Ok(())
}

/// Applies the config secret, hijacks the workload, and establishes the
/// chosen reachability path. Returns the agent endpoint the local tunnel
/// should dial, when there is one.
#[allow(clippy::too_many_arguments)]
async fn cluster_setup(
    client: &Client,
    settings: &Settings,
    target: &TargetRef,
    config: &OverlayConfig,
    revisions: &dyn RevisionSource,
    pods: &dyn PodWaiter,
    balancers: &dyn LoadBalancerWaiter,
    teardown: &mut TeardownStack,
) -> Result<Option<SocketAddr>> {
    debug!("Starting Kubernetes setup");

    let mut workload = TargetWorkload::fetch(client, &settings.namespace, target).await?;
    let workload_name = workload.name();
    let namespace = settings.namespace.clone();
    let resource_name = side_resource_name(&workload_name);
    let selector = workload.selector_labels();
    let revision = revisions.fresh();

    // Rewrite the template locally first; a bad container name must fail
    // before anything is written to the cluster.
    workload.inject_agent(
        settings.container.as_deref(),
        &AgentSpec {
            image: settings.agent_image.clone(),
            config_secret: resource_name.clone(),
        },
        &revision,
    )?;

    if !settings.keep_resources {
        let client = client.clone();
        let ns = namespace.clone();
        let name = resource_name.clone();
        teardown.push("cluster resources", async move {
            resources::delete_side_resources(&client, &ns, &name).await;
            Ok(())
        });
    }

    resources::apply_config_secret(client, &namespace, &resource_name, config)
        .await
        .with_context(|| format!("unable to create config for {namespace}/{workload_name}"))?;

    workload.update(client).await?;

    info!("Kubernetes setup complete");

    if config.direct_access {
        let pod = pods
            .ready_pod(client, &namespace, &selector, &revision)
            .await
            .with_context(|| format!("failed to find new pod for {namespace}/{workload_name}"))?;
        let address = exec::await_advertised_address(client, &namespace, &pod.name_any()).await?;
        resources::apply_network_policy(client, &namespace, &resource_name, &selector, address.port())
            .await
            .with_context(|| {
                format!("failed to create network policy for {namespace}/{workload_name}")
            })?;
        Ok(Some(address))
    } else if config.local_endpoint.is_none() {
        resources::apply_load_balancer(client, &namespace, &resource_name, &selector)
            .await
            .with_context(|| {
                format!("failed to create load balancer service for {namespace}/{workload_name}")
            })?;
        let address = balancers
            .ingress_address(client, &namespace, &resource_name)
            .await?;
        resources::apply_network_policy(client, &namespace, &resource_name, &selector, TUNNEL_PORT)
            .await
            .with_context(|| {
                format!("failed to create network policy for {namespace}/{workload_name}")
            })?;
        Ok(Some(address))
    } else {
        Ok(None)
    }
}

/// Brings up the local tunnel device and installs host routes and DNS.
async fn tunnel_setup(
    config: &OverlayConfig,
    topology: &ClusterTopology,
    peer_endpoint: Option<SocketAddr>,
    teardown: &mut TeardownStack,
) -> Result<()> {
    debug!("Starting wireguard device setup");

    let listen_port = config
        .local_endpoint
        .map(|address| i32::from(address.port()))
        .unwrap_or(0);

    let device = tunnel::bring_up(&tunnel::DeviceSpec {
        private_key: config.local_key.private_key(),
        listen_port,
        address: config.local_overlay_addr,
        peer: tunnel::PeerSpec {
            public_key: config.agent_key.public_key(),
            endpoint: peer_endpoint,
            allowed_prefixes: config.allowed_prefixes.clone(),
        },
    })
    .await
    .context("unable to set up the tunnel device")?;

    let device_name = device.name().to_string();
    teardown.push("tunnel device", async move {
        device.tear_down().await;
        Ok(())
    });
    info!(device = %device_name, "Wireguard device setup complete");

    debug!("Starting route setup");
    let host_network = tunnel::install(tunnel::HostNetworkSpec {
        device: device_name,
        routes: config.allowed_prefixes.clone(),
        dns: Some(tunnel::DnsHint {
            server: topology.service_ip,
        }),
    })
    .await
    .context("unable to set up routing")?;
    teardown.push("host routes", async move {
        host_network.tear_down().await;
        Ok(())
    });
    info!("Routing setup complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_topology() -> ClusterTopology {
        ClusterTopology {
            service_ip: "172.0.0.1".parse().unwrap(),
            pod_prefix: "100.64.0.0/16".parse().unwrap(),
            service_prefix: "172.0.0.0/16".parse().unwrap(),
            node_prefix: "10.0.0.0/16".parse().unwrap(),
        }
    }

    #[test]
    fn rejects_invalid_overlay_prefix() {
        assert!(build_overlay_config(&cluster_topology(), Some("1.2./1"), false, None).is_err());
    }

    #[test]
    fn fails_when_no_overlay_candidate_fits() {
        let topology = ClusterTopology {
            service_ip: "172.0.0.1".parse().unwrap(),
            pod_prefix: "100.64.51.0/16".parse().unwrap(),
            service_prefix: "172.0.0.0/16".parse().unwrap(),
            node_prefix: "10.1.0.0/16".parse().unwrap(),
        };
        // Both default candidates collide; the pod range as given swallows
        // 100.64.51.0/28 and the node range swallows 10.1.0.0/28.
        assert!(build_overlay_config(&topology, None, false, None).is_err());
    }

    #[test]
    fn selects_defaults() {
        let topology = cluster_topology();
        let config = build_overlay_config(&topology, None, false, None).unwrap();

        assert!(!config.direct_access);
        assert_eq!(config.local_endpoint, None);
        assert_eq!(config.overlay_prefix, "10.1.0.0/28".parse().unwrap());
        assert_eq!(config.local_overlay_addr, "10.1.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(config.agent_overlay_addr, "10.1.0.2".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(
            config.allowed_prefixes,
            vec![
                topology.pod_prefix,
                topology.service_prefix,
                topology.node_prefix,
                config.overlay_prefix,
            ]
        );
        assert_ne!(config.local_key, config.agent_key);
    }

    #[test]
    fn honors_a_user_overlay_prefix() {
        let config =
            build_overlay_config(&cluster_topology(), Some("192.168.0.0/16"), false, None).unwrap();
        assert_eq!(config.overlay_prefix, "192.168.0.0/16".parse().unwrap());
        assert_eq!(config.local_overlay_addr, "192.168.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(config.agent_overlay_addr, "192.168.0.2".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(config.allowed_prefixes[3], config.overlay_prefix);
    }

    #[test]
    fn direct_access_and_local_address_are_carried() {
        let local: SocketAddr = "198.51.100.4:51820".parse().unwrap();
        let config =
            build_overlay_config(&cluster_topology(), None, true, Some(local)).unwrap();
        assert!(config.direct_access);
        assert_eq!(config.local_endpoint, Some(local));
    }
}
