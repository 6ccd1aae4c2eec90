//! NAT discovery: asks public STUN servers for a server-reflexive UDP
//! candidate, which becomes the agent's advertised address.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc_ice::{
    agent::{agent_config::AgentConfig, Agent},
    candidate::{Candidate, CandidateType},
    network_type::NetworkType,
    url::Url,
};

pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

const STUN_SERVERS: &[&str] = &["stun:stun.cloudflare.com:3478", "stun:stun.l.google.com:19302"];

#[derive(Debug, Error)]
pub enum NatError {
    #[error("unable to initialize NAT discovery client")]
    Client(#[source] webrtc_ice::Error),

    #[error("unable to gather server-reflexive candidates")]
    Gather(#[source] webrtc_ice::Error),

    #[error("no server-reflexive candidate found: timeout after {}s", DISCOVERY_TIMEOUT.as_secs())]
    Timeout,
}

/// Discovers the publicly reachable `host:port` of this process. Injectable
/// so the agent run loop can be exercised without network access.
#[async_trait]
pub trait NatDiscovery {
    async fn reflexive_address(&self) -> Result<(String, u16), NatError>;
}

pub struct IceDiscovery;

#[async_trait]
impl NatDiscovery for IceDiscovery {
    async fn reflexive_address(&self) -> Result<(String, u16), NatError> {
        let urls = STUN_SERVERS
            .iter()
            .map(|server| Url::parse_url(server))
            .collect::<Result<Vec<_>, _>>()
            .map_err(NatError::Client)?;

        let agent = Agent::new(AgentConfig {
            urls,
            network_types: vec![NetworkType::Udp4],
            candidate_types: vec![CandidateType::ServerReflexive],
            ..Default::default()
        })
        .await
        .map_err(NatError::Client)?;

        // Only the first candidate matters; the buffered slot keeps the
        // callback from ever blocking.
        let (tx, mut rx) = mpsc::channel::<(String, u16)>(1);
        agent.on_candidate(Box::new(
            move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        debug!(candidate = %candidate, "NAT discovery candidate");
                        let _ = tx.try_send((candidate.address(), candidate.port()));
                    }
                })
            },
        ));

        agent.gather_candidates().map_err(NatError::Gather)?;

        let result = tokio::time::timeout(DISCOVERY_TIMEOUT, rx.recv())
            .await
            .map_err(|_| NatError::Timeout)?
            .ok_or(NatError::Timeout);

        if let Err(error) = agent.close().await {
            debug!(%error, "Error closing NAT discovery client");
        }

        result
    }
}
