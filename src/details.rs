use crate::config::{Config, Owner, SidecarConfig};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::ResourceExt;
use log::debug;
use std::collections::HashMap;

/// Owner references carry no namespace, so the pod's own namespace is
/// paired with the referenced name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

/// One configured sidecar joined with the container status observed on
/// the pod. Lives for a single reconcile.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerDetail<'a> {
    pub sidecar_config: &'a SidecarConfig,
    pub container_status: &'a ContainerStatus,
}

/// Maps the pod's owner references onto the supported workload kinds.
/// Unsupported kinds are skipped; a later duplicate of the same kind
/// overwrites the earlier entry.
pub fn resolve_owners(pod: &Pod) -> HashMap<Owner, NamespacedName> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut res = HashMap::new();
    for owner_ref in pod.owner_references() {
        let owner = match owner_ref.kind.as_str() {
            "Deployment" => Owner::Deployment,
            "ReplicaSet" => Owner::ReplicaSet,
            "DaemonSet" => Owner::DaemonSet,
            other => {
                debug!("unsupported owner kind {} on pod {}", other, pod.name_any());
                continue;
            }
        };
        res.insert(
            owner,
            NamespacedName {
                namespace: namespace.clone(),
                name: owner_ref.name.clone(),
            },
        );
    }
    res
}

/// The configured sidecar table drives the join: containers not in the
/// config are ignored, configured containers absent from the pod are
/// ignored.
pub fn match_details<'a>(conf: &'a Config, pod: &'a Pod) -> Vec<ContainerDetail<'a>> {
    let mut res = Vec::new();
    for (name, sidecar_config) in &conf.sidecars {
        let statuses = pod
            .status
            .iter()
            .flat_map(|s| s.container_statuses.iter().flatten());
        for container_status in statuses {
            if *name == container_status.name {
                res.push(ContainerDetail {
                    sidecar_config,
                    container_status,
                });
            }
        }
    }
    res
}

/// Keeps only containers sitting in a terminated state whose exit code
/// is one of the sidecar's declared out-of-resource codes. Waiting and
/// running states are transient and dropped.
pub fn filter_terminated(details: Vec<ContainerDetail<'_>>) -> Vec<ContainerDetail<'_>> {
    details
        .into_iter()
        .filter(|detail| {
            detail
                .container_status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .map(|terminated| {
                    let matched = detail.sidecar_config.err_codes.contains(&terminated.exit_code);
                    if matched {
                        debug!(
                            "container {} terminated with listed exit code {}",
                            detail.container_status.name, terminated.exit_code
                        );
                    }
                    matched
                })
                .unwrap_or(false)
        })
        .collect()
}

pub fn group_by_owner(details: Vec<ContainerDetail<'_>>) -> HashMap<Owner, Vec<ContainerDetail<'_>>> {
    let mut res: HashMap<Owner, Vec<ContainerDetail<'_>>> = HashMap::new();
    for detail in details {
        res.entry(detail.sidecar_config.owner).or_default().push(detail);
    }
    res
}
