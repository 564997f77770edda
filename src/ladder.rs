use crate::config::{ResourceStep, SidecarConfig};
use crate::details::ContainerDetail;
use crate::errors::*;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Owner annotation carrying the per-container ladder state.
pub const DETAILS_ANNOTATION: &str = "das/details";

/// The rung a container currently occupies and the failures seen on it.
/// `restart_count` 0 is the just-promoted sentinel; the first failure on
/// a fresh rung moves it to 1 through the stay rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StepState {
    pub name: String,
    #[serde(default)]
    pub restart_count: u32,
}

/// Decoded form of the `das/details` annotation, keyed by container name.
pub type LadderState = BTreeMap<String, StepState>;

/// Everything one engine invocation decides: the annotations to write
/// back on the owner and its pod template, and the steps that were newly
/// chosen (promotions only) for export.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewAnnotations {
    pub owner_annotations: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub promoted: HashMap<String, ResourceStep>,
}

/// Looks the named rung up in the sidecar's ladder. A missing rung
/// (operator edited the ladder) comes back as the empty step, whose
/// restart_limit of 0 forces promotion on the next failure.
fn current_step(sidecar_config: &SidecarConfig, step_name: &str) -> ResourceStep {
    match sidecar_config.steps.iter().find(|step| step.name == step_name) {
        Some(step) => step.clone(),
        None => {
            info!("no step found for name {}, returning empty step", step_name);
            ResourceStep::default()
        }
    }
}

/// Index of the rung to promote to. Clamps to the top rung when the
/// current rung is the top one or cannot be found at all.
fn next_step_index(sidecar_config: &SidecarConfig, current_name: &str) -> usize {
    let last = sidecar_config.steps.len() - 1;
    match sidecar_config.steps.iter().position(|step| step.name == current_name) {
        None => {
            info!("current step {} not found, returning last step to be safe", current_name);
            last
        }
        Some(i) if i == last => {
            debug!("already on last step {}", current_name);
            last
        }
        Some(i) => i + 1,
    }
}

fn parse_state(raw: &str) -> Result<LadderState> {
    serde_json::from_str(raw).chain_err(|| ErrorKind::DetailsParse(raw.to_string()))
}

/// The transition function. Takes the surviving details for one owner
/// together with the owner's current annotations and pod-template
/// annotations, and returns the updated annotation sets plus the newly
/// chosen steps. Inputs are never mutated; absent maps read as empty.
pub fn compute_new_annotations(
    details: &[ContainerDetail<'_>],
    current_owner_annotations: Option<&BTreeMap<String, String>>,
    current_pod_annotations: Option<&BTreeMap<String, String>>,
) -> Result<NewAnnotations> {
    let mut owner_annotations = current_owner_annotations.cloned().unwrap_or_default();
    let mut pod_annotations = current_pod_annotations.cloned().unwrap_or_default();
    let mut promoted: HashMap<String, ResourceStep> = HashMap::new();

    let mut state: LadderState = match owner_annotations.get(DETAILS_ANNOTATION) {
        Some(raw) => parse_state(raw)?,
        None => LadderState::new(),
    };

    for detail in details {
        let container = detail.container_status.name.clone();
        let sidecar_config = detail.sidecar_config;

        let existing = match state.get(&container) {
            Some(existing) => existing.clone(),
            None => {
                // First observed failure: the container is on rung 0 by
                // construction, counting this failure as 1.
                let first = &sidecar_config.steps[0];
                debug!(
                    "no existing detail for container {}, adding first step {} with restart count 1",
                    container, first.name
                );
                state.insert(
                    container,
                    StepState {
                        name: first.name.clone(),
                        restart_count: 1,
                    },
                );
                continue;
            }
        };

        let current = current_step(sidecar_config, &existing.name);
        if existing.restart_count + 1 < current.restart_limit {
            debug!(
                "restart count {} below limit {} for container {} on step {}",
                existing.restart_count + 1,
                current.restart_limit,
                container,
                existing.name
            );
            state.insert(
                container,
                StepState {
                    name: existing.name.clone(),
                    restart_count: existing.restart_count + 1,
                },
            );
            continue;
        }

        let next = &sidecar_config.steps[next_step_index(sidecar_config, &existing.name)];
        if next.name == current.name {
            debug!(
                "container {} is on the last step {}, incrementing count to {}",
                container,
                next.name,
                existing.restart_count + 1
            );
            state.insert(
                container,
                StepState {
                    name: next.name.clone(),
                    restart_count: existing.restart_count + 1,
                },
            );
            continue;
        }

        info!("promoting container {} to step {}", container, next.name);
        state.insert(
            container.clone(),
            StepState {
                name: next.name.clone(),
                restart_count: 0,
            },
        );
        pod_annotations.insert(
            sidecar_config.cpu_annotation_key.clone(),
            next.cpu_request.clone(),
        );
        pod_annotations.insert(
            sidecar_config.cpu_limit_annotation_key.clone(),
            next.cpu_limit.clone(),
        );
        pod_annotations.insert(
            sidecar_config.mem_annotation_key.clone(),
            next.mem_request.clone(),
        );
        pod_annotations.insert(
            sidecar_config.mem_limit_annotation_key.clone(),
            next.mem_limit.clone(),
        );
        promoted.insert(container, next.clone());
    }

    let serialised = serde_json::to_string(&state)
        .chain_err(|| "error serialising updated step details")?;
    owner_annotations.insert(DETAILS_ANNOTATION.to_string(), serialised);

    Ok(NewAnnotations {
        owner_annotations,
        pod_annotations,
        promoted,
    })
}
