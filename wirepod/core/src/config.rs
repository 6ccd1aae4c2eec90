use crate::key::Keypair;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// UDP port the tunnel listens on unless told otherwise.
pub const TUNNEL_PORT: u16 = 19070;

/// Name of the secret data entry carrying the serialized config.
pub const CONFIG_FILE_NAME: &str = "wg.yml";

/// Directory the config secret is mounted at inside the agent container.
pub const CONFIG_MOUNT_PATH: &str = "/app/config";

/// In-container file the agent writes its NAT-discovered `host:port` to.
pub const ADVERTISED_ADDRESS_PATH: &str = "/app/address";

/// The shared state both sides of the tunnel must agree on.
///
/// Built once on the workstation, serialized into a secret, and read back by
/// the agent. Immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Whether the agent reaches back via NAT traversal rather than a load
    /// balancer.
    pub direct_access: bool,

    /// The workstation's tunnel identity.
    pub local_key: Keypair,

    /// The agent's tunnel identity.
    pub agent_key: Keypair,

    /// Workstation address the agent dials; set only when the user supplies
    /// one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_endpoint: Option<SocketAddr>,

    /// Private subnet used only by the two tunnel peers.
    pub overlay_prefix: Ipv4Net,

    /// Workstation address inside `overlay_prefix`.
    pub local_overlay_addr: Ipv4Addr,

    /// Agent address inside `overlay_prefix`.
    pub agent_overlay_addr: Ipv4Addr,

    /// Prefixes routed across the tunnel: pod, service, node, and overlay.
    pub allowed_prefixes: Vec<Ipv4Net>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_config() -> OverlayConfig {
        let overlay_prefix: Ipv4Net = "10.1.0.0/28".parse().unwrap();
        OverlayConfig {
            direct_access: false,
            local_key: Keypair::generate(),
            agent_key: Keypair::generate(),
            local_endpoint: None,
            overlay_prefix,
            local_overlay_addr: "10.1.0.1".parse().unwrap(),
            agent_overlay_addr: "10.1.0.2".parse().unwrap(),
            allowed_prefixes: vec![
                "100.64.0.0/16".parse().unwrap(),
                "172.0.0.0/16".parse().unwrap(),
                "10.0.0.0/16".parse().unwrap(),
                overlay_prefix,
            ],
        }
    }

    #[test]
    fn yaml_round_trip() {
        let config = example_config();
        let doc = serde_yaml::to_string(&config).expect("config must serialize");
        let parsed: OverlayConfig = serde_yaml::from_str(&doc).expect("config must deserialize");
        assert_eq!(config, parsed);
    }

    #[test]
    fn yaml_round_trip_with_endpoint() {
        let config = OverlayConfig {
            direct_access: true,
            local_endpoint: Some("203.0.113.9:51820".parse().unwrap()),
            ..example_config()
        };
        let doc = serde_yaml::to_string(&config).expect("config must serialize");
        let parsed: OverlayConfig = serde_yaml::from_str(&doc).expect("config must deserialize");
        assert_eq!(config, parsed);
    }

    #[test]
    fn keys_serialize_as_base64_text() {
        let config = example_config();
        let doc = serde_yaml::to_string(&config).expect("config must serialize");
        assert!(doc.contains(&config.local_key.private_key().to_base64()));
        assert!(doc.contains(&config.agent_key.private_key().to_base64()));
        // The absent endpoint is omitted entirely.
        assert!(!doc.contains("local_endpoint"));
    }
}
