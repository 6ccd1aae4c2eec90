//! Linux: kernel WireGuard over netlink, routes via ip(8), DNS via
//! systemd-resolved's per-link state.

use crate::{
    command::run,
    device::{configure_device, DeviceSpec, TunnelDevice, TunnelError},
    routes::{HostNetworkSpec, RouteError, CLUSTER_DNS_DOMAIN},
};
use futures::TryStreamExt;
use netlink_packet_route::nlas::link::{InfoKind, Nla};
use netlink_packet_route::IFF_UP;
use std::net::IpAddr;
use tracing::{debug, warn};
use wireguard_control::Backend;

const DEVICE_NAME: &str = "wg0";

pub(crate) async fn device_up(spec: &DeviceSpec) -> Result<TunnelDevice, TunnelError> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    let mut request = handle.link().add();
    {
        let message = request.message_mut();
        message.nlas.push(Nla::IfName(DEVICE_NAME.to_string()));
        message.nlas.push(Nla::Info(vec![
            netlink_packet_route::nlas::link::Info::Kind(InfoKind::Wireguard),
        ]));
        message.header.flags |= IFF_UP;
        message.header.change_mask |= IFF_UP;
    }
    request.execute().await?;

    let index = link_index(&handle, DEVICE_NAME).await?;

    handle
        .address()
        .add(index, IpAddr::V4(spec.address), 32)
        .execute()
        .await?;

    configure_device(DEVICE_NAME, spec, Backend::Kernel)?;

    handle.link().set(index).up().execute().await?;

    debug!(device = DEVICE_NAME, index, "Tunnel interface up");

    Ok(TunnelDevice {
        name: DEVICE_NAME.to_string(),
        index,
        handle,
    })
}

pub(crate) async fn device_down(device: TunnelDevice) {
    if let Err(error) = device.handle.link().del(device.index).execute().await {
        warn!(%error, device = %device.name, "Unable to delete tunnel interface");
    }
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, TunnelError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await?
        .ok_or_else(|| TunnelError::Missing(name.to_string()))?;
    Ok(link.header.index)
}

pub(crate) async fn host_network_up(spec: &HostNetworkSpec) -> Result<(), RouteError> {
    for prefix in &spec.routes {
        let route = prefix.to_string();
        run("ip", &["route", "replace", &route, "dev", &spec.device])
            .await
            .map_err(|source| RouteError::Install {
                prefix: *prefix,
                source,
            })?;
    }

    if let Some(dns) = &spec.dns {
        let server = dns.server.to_string();
        let domain = format!("~{CLUSTER_DNS_DOMAIN}");
        let dns_err = |source| RouteError::Dns {
            device: spec.device.clone(),
            source,
        };

        // Per-link resolved state: cluster-domain queries only, and never the
        // default route for everything else.
        run("resolvectl", &["dns", &spec.device, &server])
            .await
            .map_err(dns_err)?;
        run("resolvectl", &["domain", &spec.device, &domain])
            .await
            .map_err(dns_err)?;
        run("resolvectl", &["default-route", &spec.device, "false"])
            .await
            .map_err(dns_err)?;
    }

    Ok(())
}

pub(crate) async fn host_network_down(spec: &HostNetworkSpec) {
    if spec.dns.is_some() {
        if let Err(error) = run("resolvectl", &["revert", &spec.device]).await {
            warn!(%error, device = %spec.device, "Unable to revert DNS configuration");
        }
    }

    for prefix in &spec.routes {
        let route = prefix.to_string();
        if let Err(error) = run("ip", &["route", "del", &route, "dev", &spec.device]).await {
            warn!(%error, %prefix, "Unable to remove route");
        }
    }
}
