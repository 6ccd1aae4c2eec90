#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The cluster-side agent: publishes its reachable address (direct-access
//! mode), brings up its end of the tunnel, and redirects pod traffic into it.

pub mod firewall;
pub mod nat;

use crate::{
    firewall::{install_rules, ForwardingSpec, IptablesSink, INTERCEPT_HEALTH_PORTS},
    nat::NatDiscovery,
};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::{debug, info};
use wirepod_core::{Ipv4Net, OverlayConfig, ADVERTISED_ADDRESS_PATH};
use wirepod_tunnel as tunnel;

pub const LOCAL_PORTS_EXCLUDE_PROXY_ENV: &str = "LOCAL_PORTS_EXCLUDE_PROXY";
pub const ISTIO_INTERCEPTION_MODE_ENV: &str = "ISTIO_INTERCEPTION_MODE";

/// Live agent-side state, torn down in reverse bring-up order when the
/// process is told to stop. Forwarding rules are left in place: the pod is
/// going away with the process.
pub struct AgentGuards {
    device: tunnel::TunnelDevice,
    host_network: tunnel::HostNetworkHandle,
}

impl AgentGuards {
    pub async fn tear_down(self) {
        self.host_network.tear_down().await;
        self.device.tear_down().await;
    }
}

/// Brings the agent side up: NAT discovery and address publication when
/// direct access is on, then the tunnel device, the route back to the
/// workstation, and the forwarding rules.
pub async fn start(config_path: &Path, discovery: &dyn NatDiscovery) -> Result<AgentGuards> {
    let contents = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("unable to open config file {}", config_path.display()))?;
    let config: OverlayConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("unable to read config file {}", config_path.display()))?;

    let mut excluded_ports =
        split_ports(std::env::var(LOCAL_PORTS_EXCLUDE_PROXY_ENV).ok().as_deref());
    let interception = std::env::var(ISTIO_INTERCEPTION_MODE_ENV)
        .map(|mode| !mode.is_empty())
        .unwrap_or(false);
    if interception {
        // The interception proxy's health and admin endpoints must stay
        // reachable without traversing the tunnel.
        excluded_ports.extend(INTERCEPT_HEALTH_PORTS.iter().map(u16::to_string));
    }

    let mut listen_port = 0;
    if config.direct_access {
        debug!("Starting NAT address lookup");
        let (host, port) = discovery
            .reflexive_address()
            .await
            .context("unable to find a connectable address for NAT traversal")?;
        listen_port = i32::from(port);

        let address = format!("{host}:{port}");
        tokio::fs::write(ADVERTISED_ADDRESS_PATH, &address)
            .await
            .context("unable to write the advertised address")?;
        info!(%address, "NAT address lookup complete");
    } else if config.local_endpoint.is_some() {
        // The workstation listens on a fixed address; any source port will do
        // for dialing out.
        listen_port = -1;
    }

    debug!("Starting wireguard device setup");
    let device = tunnel::bring_up(&tunnel::DeviceSpec {
        private_key: config.agent_key.private_key(),
        listen_port,
        address: config.agent_overlay_addr,
        peer: tunnel::PeerSpec {
            public_key: config.local_key.public_key(),
            endpoint: config.local_endpoint,
            allowed_prefixes: config.allowed_prefixes.clone(),
        },
    })
    .await
    .context("unable to set up the tunnel device")?;
    info!(device = device.name(), "Wireguard device setup complete");

    debug!("Starting route setup");
    let host_network = match tunnel::install(tunnel::HostNetworkSpec {
        device: device.name().to_string(),
        routes: vec![
            Ipv4Net::new(config.local_overlay_addr, 32).expect("/32 is a valid prefix length")
        ],
        dns: None,
    })
    .await
    .context("unable to set up routing")
    {
        Ok(host_network) => host_network,
        Err(error) => {
            device.tear_down().await;
            return Err(error);
        }
    };
    info!("Routing setup complete");

    let guards = AgentGuards {
        device,
        host_network,
    };

    debug!("Starting IPTables setup");
    if let Err(error) = forwarding_setup(&config, guards.device.name(), interception, &excluded_ports)
    {
        guards.tear_down().await;
        return Err(error);
    }
    info!("IPTables setup complete");

    Ok(guards)
}

fn forwarding_setup(
    config: &OverlayConfig,
    tunnel_interface: &str,
    interception: bool,
    excluded_ports: &[String],
) -> Result<()> {
    let data = netdev::get_default_interface()
        .map_err(|error| anyhow!("unable to determine default device name: {error}"))?;
    let data_address = data
        .ipv4
        .first()
        .map(|net| net.addr())
        .ok_or_else(|| anyhow!("default interface {} has no IPv4 address", data.name))?;

    let mut sink = IptablesSink::new()?;
    install_rules(
        &mut sink,
        &ForwardingSpec {
            data_interface: &data.name,
            data_address,
            tunnel_interface,
            local_overlay_addr: config.local_overlay_addr,
            interception,
            excluded_ports,
        },
    )?;
    Ok(())
}

fn split_ports(value: Option<&str>) -> Vec<String> {
    value
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|port| !port.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_the_exclusion_list() {
        assert_eq!(split_ports(None), Vec::<String>::new());
        assert_eq!(split_ports(Some("")), Vec::<String>::new());
        assert_eq!(split_ports(Some("15001,12345")), vec!["15001", "12345"]);
        assert_eq!(split_ports(Some(" 8080 , 9090 ")), vec!["8080", "9090"]);
    }

    #[test]
    fn interception_augments_the_exclusion_list() {
        let mut ports = split_ports(Some("12345,23456"));
        ports.extend(INTERCEPT_HEALTH_PORTS.iter().map(u16::to_string));
        assert_eq!(ports, vec!["12345", "23456", "15020", "15021"]);
    }
}
