//! macOS: userspace WireGuard through a spawned `wireguard-go`, routes and
//! addressing via the system tools, DNS via a `/etc/resolver` entry.

use crate::{
    command::run,
    device::{configure_device, DeviceSpec, TunnelDevice, TunnelError},
    routes::{HostNetworkSpec, RouteError, CLUSTER_DNS_DOMAIN},
};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};
use wireguard_control::Backend;

const RESOLVER_FILE: &str = "/etc/resolver/cluster.local";
const MDNS_RESPONDER_PLIST: &str = "/Library/Preferences/com.apple.mDNSResponder.plist";

fn name_file() -> PathBuf {
    std::env::temp_dir().join("wirepod-utun-name")
}

fn socket_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/wireguard/{name}.sock"))
}

pub(crate) async fn device_up(spec: &DeviceSpec) -> Result<TunnelDevice, TunnelError> {
    // wireguard-go daemonizes and reports the utun name it was assigned.
    let name_file = name_file();
    let output = Command::new("wireguard-go")
        .env("WG_TUN_NAME_FILE", &name_file)
        .arg("utun")
        .output()
        .await?;
    if !output.status.success() {
        return Err(TunnelError::Configure {
            name: "utun".to_string(),
            source: std::io::Error::other(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    let name = tokio::fs::read_to_string(&name_file).await?.trim().to_string();
    if name.is_empty() {
        return Err(TunnelError::Missing("utun".to_string()));
    }

    configure_device(&name, spec, Backend::Userspace)?;

    let address = spec.address.to_string();
    run("ifconfig", &[&name, "inet", &address, &address]).await?;
    run("ifconfig", &[&name, "up"]).await?;

    debug!(device = %name, "Tunnel interface up");

    Ok(TunnelDevice { name })
}

pub(crate) async fn device_down(device: TunnelDevice) {
    // Removing the UAPI socket makes the userspace process exit and destroy
    // its utun device.
    if let Err(error) = tokio::fs::remove_file(socket_path(&device.name)).await {
        warn!(%error, device = %device.name, "Unable to stop userspace wireguard");
    }
}

pub(crate) async fn host_network_up(spec: &HostNetworkSpec) -> Result<(), RouteError> {
    for prefix in &spec.routes {
        let route = prefix.to_string();
        run("route", &["add", "-net", &route, "-interface", &spec.device])
            .await
            .map_err(|source| RouteError::Install {
                prefix: *prefix,
                source,
            })?;
    }

    if let Some(dns) = &spec.dns {
        let dns_err = |source| RouteError::Dns {
            device: spec.device.clone(),
            source,
        };

        tokio::fs::create_dir_all("/etc/resolver").await?;
        let contents = format!(
            "domain {CLUSTER_DNS_DOMAIN}\nnameserver {}\nsearch svc.{CLUSTER_DNS_DOMAIN} {CLUSTER_DNS_DOMAIN} local\n",
            dns.server
        );
        tokio::fs::write(RESOLVER_FILE, contents).await?;

        // Unqualified service names only resolve if the search domains are
        // appended for every query.
        run(
            "defaults",
            &["write", MDNS_RESPONDER_PLIST, "AlwaysAppendSearchDomains", "-bool", "yes"],
        )
        .await
        .map_err(dns_err)?;
        run("killall", &["mDNSResponder"]).await.map_err(dns_err)?;
    }

    Ok(())
}

pub(crate) async fn host_network_down(spec: &HostNetworkSpec) {
    if spec.dns.is_some() {
        if let Err(error) = run(
            "defaults",
            &["write", MDNS_RESPONDER_PLIST, "AlwaysAppendSearchDomains", "-bool", "no"],
        )
        .await
        {
            warn!(%error, "Unable to reset mDNSResponder search domains");
        }
        if let Err(error) = run("killall", &["mDNSResponder"]).await {
            warn!(%error, "Unable to restart mDNSResponder");
        }
        if let Err(error) = tokio::fs::remove_file(RESOLVER_FILE).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(%error, "Unable to remove resolver file");
            }
        }
    }

    for prefix in &spec.routes {
        let route = prefix.to_string();
        if let Err(error) = run("route", &["delete", "-net", &route]).await {
            warn!(%error, %prefix, "Unable to remove route");
        }
    }
}
