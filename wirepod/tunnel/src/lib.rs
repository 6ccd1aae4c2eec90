#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod command;
pub mod device;
pub mod routes;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

pub use self::{
    device::{bring_up, effective_listen_port, DeviceSpec, PeerSpec, TunnelDevice, TunnelError},
    routes::{install, DnsHint, HostNetworkHandle, HostNetworkSpec, RouteError},
};
