//! Host-side network state: routes for the allowed prefixes through the
//! tunnel interface, and (optionally) cluster-domain DNS pointed at the
//! in-cluster resolver. The returned handle reverses every change on
//! teardown, logging and continuing past individual failures.

use crate::command::CommandError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const CLUSTER_DNS_DOMAIN: &str = "cluster.local";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unable to add route for {prefix}")]
    Install {
        prefix: Ipv4Net,
        #[source]
        source: CommandError,
    },

    #[error("unable to configure DNS for {device}")]
    Dns {
        device: String,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Directs queries for the cluster DNS domain at the in-cluster resolver.
#[derive(Clone, Debug)]
pub struct DnsHint {
    pub server: Ipv4Addr,
}

#[derive(Clone, Debug)]
pub struct HostNetworkSpec {
    /// Tunnel interface the routes go through.
    pub device: String,
    pub routes: Vec<Ipv4Net>,
    pub dns: Option<DnsHint>,
}

/// Installed host network state, undone by `tear_down`.
pub struct HostNetworkHandle {
    pub(crate) spec: HostNetworkSpec,
}

impl HostNetworkHandle {
    pub async fn tear_down(self) {
        #[cfg(target_os = "linux")]
        crate::linux::host_network_down(&self.spec).await;
        #[cfg(target_os = "macos")]
        crate::macos::host_network_down(&self.spec).await;
    }
}

pub async fn install(spec: HostNetworkSpec) -> Result<HostNetworkHandle, RouteError> {
    #[cfg(target_os = "linux")]
    crate::linux::host_network_up(&spec).await?;
    #[cfg(target_os = "macos")]
    crate::macos::host_network_up(&spec).await?;

    Ok(HostNetworkHandle { spec })
}
