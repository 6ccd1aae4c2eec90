#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod exec;
pub mod resources;
pub mod topology;
pub mod wait;
pub mod workload;

pub use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{Container, ContainerPort, Node, Pod, PodSpec, PodTemplateSpec, Secret, Service},
    networking::v1::NetworkPolicy,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};

/// Field manager for server-side applies, so reruns converge instead of
/// conflicting.
pub const FIELD_MANAGER: &str = "wirepod";

/// Name shared by every cluster object created alongside a run.
pub fn side_resource_name(workload: &str) -> String {
    format!("wg-{workload}")
}
