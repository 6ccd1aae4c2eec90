//! Reads the agent's advertised address file over the pod exec subresource.

use crate::{
    wait::{WaitError, POLL_INTERVAL, WAIT_TIMEOUT},
    workload::AGENT_CONTAINER_NAME,
    Api, Client, Pod,
};
use anyhow::{Context, Result};
use kube::api::AttachParams;
use std::net::SocketAddr;
use tokio::{io::AsyncReadExt, time};
use tracing::{debug, info};
use wirepod_core::ADVERTISED_ADDRESS_PATH;

/// Reads a file out of the agent container. The exec transport is
/// websocket-based.
pub async fn file_contents(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: &str,
    path: &str,
) -> Result<String> {
    let api = Api::<Pod>::namespaced(client.clone(), namespace);
    let params = AttachParams::default()
        .container(container)
        .stdin(false)
        .stdout(true)
        .stderr(false);

    let mut process = api
        .exec(pod, ["cat", path], &params)
        .await
        .with_context(|| format!("unable to exec in pod {namespace}/{pod}"))?;

    let mut out = String::new();
    if let Some(mut stdout) = process.stdout() {
        stdout
            .read_to_string(&mut out)
            .await
            .with_context(|| format!("unable to read exec output from {namespace}/{pod}"))?;
    }
    process
        .join()
        .await
        .with_context(|| format!("exec in pod {namespace}/{pod} failed"))?;

    Ok(out)
}

/// Polls the advertised-address file until it holds a well-formed
/// `host:port` line.
pub async fn await_advertised_address(
    client: &Client,
    namespace: &str,
    pod: &str,
) -> Result<SocketAddr, WaitError> {
    info!(%pod, "Waiting for the agent's advertised address");

    time::timeout(WAIT_TIMEOUT, async {
        loop {
            match file_contents(client, namespace, pod, AGENT_CONTAINER_NAME, ADVERTISED_ADDRESS_PATH)
                .await
            {
                Ok(contents) => {
                    if let Some(address) = parse_advertised_address(&contents) {
                        return address;
                    }
                    debug!(%pod, "Advertised address not yet written");
                }
                Err(error) => debug!(%pod, %error, "Unable to read address from pod"),
            }
            time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| WaitError::PodAddressTimeout)
}

fn parse_advertised_address(contents: &str) -> Option<SocketAddr> {
    contents.lines().next()?.trim().parse().ok()
}
