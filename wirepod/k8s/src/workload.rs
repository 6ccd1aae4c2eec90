//! The target workload: resolution from CLI tokens, the in-place pod template
//! rewrite that swaps one container for the tunnel agent, and the
//! read-modify-write update back to the cluster.

use crate::{Api, Client, Deployment, PodSpec, PostParams, StatefulSet};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, ObjectFieldSelector, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use std::collections::BTreeMap;
use thiserror::Error;
use wirepod_core::CONFIG_MOUNT_PATH;

/// Name given to the injected container.
pub const AGENT_CONTAINER_NAME: &str = "agent";

/// Per-run sentinel attached to the pod template so the readiness wait can
/// tell the newly-scheduled pod from pre-existing ones.
pub const REVISION_ANNOTATION: &str = "wirepod.io/revision";

const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";
const CONFIG_VOLUME_NAME: &str = "wireguard-config";
const ISTIO_INTERCEPTION_FIELD_PATH: &str =
    "metadata.annotations['sidecar.istio.io/interceptionMode']";

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload target must be <kind>/<name> or <kind> <name>")]
    InvalidTarget,

    #[error("unsupported workload kind {0:?}")]
    UnsupportedKind(String),

    #[error("unable to fetch {kind} {namespace}/{name}")]
    Fetch {
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("workload {namespace}/{name} has no pod template")]
    MissingTemplate { namespace: String, name: String },

    #[error("unable to find container to replace in {namespace}/{name}")]
    ContainerNotFound { namespace: String, name: String },

    #[error("failed to update {namespace}/{name}")]
    UpdateFailed {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Produces the per-run revision identifier. Injectable so tests can pin it.
pub trait RevisionSource {
    fn fresh(&self) -> String;
}

pub struct UuidRevisions;

impl RevisionSource for UuidRevisions {
    fn fresh(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// What gets injected in place of the target container.
#[derive(Clone, Debug)]
pub struct AgentSpec {
    pub image: String,
    pub config_secret: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

/// A parsed `<kind>/<name>` (or `<kind> <name>`) target argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl TargetRef {
    pub fn parse(tokens: &[String]) -> Result<Self, WorkloadError> {
        let (kind, name) = match tokens {
            [target] => target
                .split_once('/')
                .ok_or(WorkloadError::InvalidTarget)?,
            [kind, name] => (kind.as_str(), name.as_str()),
            _ => return Err(WorkloadError::InvalidTarget),
        };

        if name.is_empty() {
            return Err(WorkloadError::InvalidTarget);
        }

        let kind = match kind.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => WorkloadKind::Deployment,
            "statefulset" | "statefulsets" | "sts" => WorkloadKind::StatefulSet,
            other => return Err(WorkloadError::UnsupportedKind(other.to_string())),
        };

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

/// The workload being hijacked for the duration of a run.
#[derive(Clone, Debug)]
pub enum TargetWorkload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

impl TargetWorkload {
    pub async fn fetch(
        client: &Client,
        namespace: &str,
        target: &TargetRef,
    ) -> Result<Self, WorkloadError> {
        let fetch_err = |kind: &'static str, source| WorkloadError::Fetch {
            kind,
            namespace: namespace.to_string(),
            name: target.name.clone(),
            source,
        };

        match target.kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(client.clone(), namespace)
                .get(&target.name)
                .await
                .map(Self::Deployment)
                .map_err(|e| fetch_err("deployment", e)),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client.clone(), namespace)
                .get(&target.name)
                .await
                .map(Self::StatefulSet)
                .map_err(|e| fetch_err("statefulset", e)),
        }
    }

    pub fn name(&self) -> String {
        let meta = match self {
            Self::Deployment(d) => &d.metadata,
            Self::StatefulSet(s) => &s.metadata,
        };
        meta.name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        let meta = match self {
            Self::Deployment(d) => &d.metadata,
            Self::StatefulSet(s) => &s.metadata,
        };
        meta.namespace.clone().unwrap_or_default()
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let selector = match self {
            Self::Deployment(d) => d.spec.as_ref().map(|spec| &spec.selector),
            Self::StatefulSet(s) => s.spec.as_ref().map(|spec| &spec.selector),
        };
        selector
            .and_then(|selector| selector.match_labels.clone())
            .unwrap_or_default()
    }

    /// Rewrites the pod template so one replica runs the agent: revision
    /// annotation, replica count 1, probes cleared, target container swapped
    /// for the agent, config volume mounted.
    pub fn inject_agent(
        &mut self,
        container: Option<&str>,
        agent: &AgentSpec,
        revision: &str,
    ) -> Result<(), WorkloadError> {
        let namespace = self.namespace();
        let name = self.name();
        let missing = || WorkloadError::MissingTemplate {
            namespace: namespace.clone(),
            name: name.clone(),
        };

        let (replicas, template) = match self {
            Self::Deployment(d) => {
                let spec = d.spec.as_mut().ok_or_else(|| missing())?;
                (&mut spec.replicas, &mut spec.template)
            }
            Self::StatefulSet(s) => {
                let spec = s.spec.as_mut().ok_or_else(|| missing())?;
                (&mut spec.replicas, &mut spec.template)
            }
        };

        *replicas = Some(1);

        let annotations = template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new);
        annotations.insert(REVISION_ANNOTATION.to_string(), revision.to_string());
        let default_container = annotations.get(DEFAULT_CONTAINER_ANNOTATION).cloned();

        let pod_spec = template
            .spec
            .as_mut()
            .ok_or_else(|| missing())?;

        let index = container_index(container, default_container.as_deref(), &pod_spec.containers)
            .ok_or(WorkloadError::ContainerNotFound { namespace, name })?;

        replace_container_with_agent(pod_spec, agent, index);

        Ok(())
    }

    pub async fn update(&self, client: &Client) -> Result<(), WorkloadError> {
        let namespace = self.namespace();
        let name = self.name();
        let failed = |source| WorkloadError::UpdateFailed {
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        };

        match self {
            Self::Deployment(d) => {
                Api::<Deployment>::namespaced(client.clone(), &namespace)
                    .replace(&name, &PostParams::default(), d)
                    .await
                    .map_err(failed)?;
            }
            Self::StatefulSet(s) => {
                Api::<StatefulSet>::namespaced(client.clone(), &namespace)
                    .replace(&name, &PostParams::default(), s)
                    .await
                    .map_err(failed)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn template(&self) -> &crate::PodTemplateSpec {
        match self {
            Self::Deployment(d) => &d.spec.as_ref().unwrap().template,
            Self::StatefulSet(s) => &s.spec.as_ref().unwrap().template,
        }
    }
}

/// Resolves the container to replace: the explicit name, then the workload's
/// default-container annotation, then the first container.
fn container_index(
    explicit: Option<&str>,
    default_container: Option<&str>,
    containers: &[Container],
) -> Option<usize> {
    let name = explicit
        .filter(|name| !name.is_empty())
        .or(default_container)
        .or_else(|| containers.first().map(|c| c.name.as_str()))?;
    containers.iter().position(|c| c.name == name)
}

fn replace_container_with_agent(spec: &mut PodSpec, agent: &AgentSpec, index: usize) {
    let mut exclude_ports = Vec::new();

    for (i, container) in spec.containers.iter_mut().enumerate() {
        // Probes may traverse the network path that's about to change; if
        // they're checking the replaced container they'd fail outright.
        container.liveness_probe = None;
        container.readiness_probe = None;
        container.startup_probe = None;

        if i != index {
            // Ports of the surviving containers stay directly reachable
            // instead of being redirected into the tunnel.
            for port in container.ports.iter().flatten() {
                exclude_ports.push(port.container_port.to_string());
            }
        }
    }

    // Retain the replaced container's ports in case they're named at the
    // service level.
    let ports = spec.containers[index].ports.clone();

    spec.containers[index] = Container {
        name: AGENT_CONTAINER_NAME.to_string(),
        image: Some(agent.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        ports,
        env: Some(vec![
            EnvVar {
                name: "LOCAL_PORTS_EXCLUDE_PROXY".to_string(),
                value: Some(exclude_ports.join(",")),
                value_from: None,
            },
            EnvVar {
                name: "ISTIO_INTERCEPTION_MODE".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        api_version: None,
                        field_path: ISTIO_INTERCEPTION_FIELD_PATH.to_string(),
                    }),
                    ..Default::default()
                }),
            },
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: None,
            }),
            run_as_user: Some(0),
            run_as_group: Some(0),
            run_as_non_root: Some(false),
            read_only_root_filesystem: Some(false),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            read_only: Some(true),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let volume = Volume {
        name: CONFIG_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(agent.config_secret.clone()),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == CONFIG_VOLUME_NAME) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}
