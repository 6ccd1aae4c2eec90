//! WireGuard device bring-up: one interface, one peer.

use crate::command::CommandError;
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use wireguard_control::{Backend, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};
use wirepod_core::TUNNEL_PORT;

const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel interface name {0:?}")]
    InterfaceName(String),

    #[error("invalid key material")]
    Key,

    #[cfg(target_os = "linux")]
    #[error("netlink operation failed")]
    Netlink(#[from] rtnetlink::Error),

    #[error("tunnel interface {0} not found after creation")]
    Missing(String),

    #[error("unable to configure wireguard device {name}")]
    Configure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The single peer programmed into the device. The endpoint may be unset on
/// the side that only passively receives keepalives.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub public_key: wirepod_core::Key,
    pub endpoint: Option<SocketAddr>,
    pub allowed_prefixes: Vec<Ipv4Net>,
}

#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub private_key: wirepod_core::Key,
    /// Positive: bind exactly that port. Negative: ephemeral. Zero: the
    /// well-known tunnel port.
    pub listen_port: i32,
    /// Overlay address assigned to the interface as a /32.
    pub address: Ipv4Addr,
    pub peer: PeerSpec,
}

/// A live tunnel interface; torn down explicitly at shutdown.
pub struct TunnelDevice {
    pub(crate) name: String,
    #[cfg(target_os = "linux")]
    pub(crate) index: u32,
    #[cfg(target_os = "linux")]
    pub(crate) handle: rtnetlink::Handle,
}

impl TunnelDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn tear_down(self) {
        #[cfg(target_os = "linux")]
        crate::linux::device_down(self).await;
        #[cfg(target_os = "macos")]
        crate::macos::device_down(self).await;
    }
}

/// Creates the platform's tunnel interface, assigns the overlay address, and
/// programs keys and the peer.
pub async fn bring_up(spec: &DeviceSpec) -> Result<TunnelDevice, TunnelError> {
    #[cfg(target_os = "linux")]
    {
        crate::linux::device_up(spec).await
    }
    #[cfg(target_os = "macos")]
    {
        crate::macos::device_up(spec).await
    }
}

pub fn effective_listen_port(listen_port: i32) -> u16 {
    if listen_port < 0 {
        0
    } else if listen_port == 0 {
        TUNNEL_PORT
    } else {
        listen_port as u16
    }
}

pub(crate) fn configure_device(
    name: &str,
    spec: &DeviceSpec,
    backend: Backend,
) -> Result<(), TunnelError> {
    let interface: InterfaceName = name
        .parse()
        .map_err(|_| TunnelError::InterfaceName(name.to_string()))?;

    let private_key = wg_key(&spec.private_key)?;
    let public_key = wg_key(&spec.peer.public_key)?;

    let mut peer = PeerConfigBuilder::new(&public_key)
        .replace_allowed_ips()
        .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);
    for prefix in &spec.peer.allowed_prefixes {
        peer = peer.add_allowed_ip(IpAddr::V4(prefix.network()), prefix.prefix_len());
    }
    if let Some(endpoint) = spec.peer.endpoint {
        peer = peer.set_endpoint(endpoint);
    }

    DeviceUpdate::new()
        .set_private_key(private_key)
        .set_listen_port(effective_listen_port(spec.listen_port))
        .replace_peers()
        .add_peer(peer)
        .apply(&interface, backend)
        .map_err(|source| TunnelError::Configure {
            name: name.to_string(),
            source,
        })
}

fn wg_key(key: &wirepod_core::Key) -> Result<Key, TunnelError> {
    Key::from_base64(&key.to_base64()).map_err(|_| TunnelError::Key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_port_mapping() {
        // Positive ports bind exactly.
        assert_eq!(effective_listen_port(51820), 51820);
        assert_eq!(effective_listen_port(1), 1);
        // Negative means ephemeral.
        assert_eq!(effective_listen_port(-1), 0);
        // Zero means the well-known tunnel port.
        assert_eq!(effective_listen_port(0), TUNNEL_PORT);
    }
}
