#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod key;
pub mod topology;

pub use self::{
    config::{
        OverlayConfig, ADVERTISED_ADDRESS_PATH, CONFIG_FILE_NAME, CONFIG_MOUNT_PATH, TUNNEL_PORT,
    },
    key::{Key, Keypair},
    topology::{overlay_hosts, select_overlay_prefix, ClusterTopology, OverlayUnavailable},
};
pub use ipnet::{IpNet, Ipv4Net};
