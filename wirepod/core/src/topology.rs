use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Cluster address ranges observed (or supplied) once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterTopology {
    /// Cluster address of the in-cluster DNS service.
    pub service_ip: Ipv4Addr,
    pub pod_prefix: Ipv4Net,
    pub service_prefix: Ipv4Net,
    pub node_prefix: Ipv4Net,
}

impl ClusterTopology {
    pub fn prefixes(&self) -> [Ipv4Net; 3] {
        [self.pod_prefix, self.service_prefix, self.node_prefix]
    }
}

/// Overlay candidates, tried in order. Two well-separated /28s from
/// private-use space so at least one survives common cluster layouts.
const OVERLAY_CANDIDATES: &[&str] = &["10.1.0.0/28", "100.64.51.0/28"];

#[derive(Debug, Error)]
#[error("no overlay prefix candidate avoids the cluster's pod, service, and node ranges")]
pub struct OverlayUnavailable;

/// Picks the first candidate prefix that overlaps none of the cluster ranges.
pub fn select_overlay_prefix(topology: &ClusterTopology) -> Result<Ipv4Net, OverlayUnavailable> {
    OVERLAY_CANDIDATES
        .iter()
        .map(|candidate| {
            candidate
                .parse::<Ipv4Net>()
                .expect("overlay candidates must parse")
        })
        .find(|candidate| {
            !topology
                .prefixes()
                .iter()
                .any(|prefix| overlaps(candidate, prefix))
        })
        .ok_or(OverlayUnavailable)
}

/// The first two host addresses of the overlay prefix: the workstation's and
/// the agent's overlay addresses, in that order.
pub fn overlay_hosts(prefix: Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    let base = u32::from(prefix.network());
    (Ipv4Addr::from(base + 1), Ipv4Addr::from(base + 2))
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}
