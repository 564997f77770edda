use crate::config::{Config, Owner, ResourceStep};
use crate::details::{self, ContainerDetail, NamespacedName};
use crate::errors::*;
use crate::ladder;
use crate::store::StepStore;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Context shared by every reconcile worker.
pub struct Data {
    pub client: Client,
    pub conf: Config,
    pub store: Box<dyn StepStore>,
    pub backoff: Backoff,
}

/// Per-key exponential backoff with jitter. The framework re-queues on
/// whatever delay the error policy picks; successful reconciles reset
/// the key so a later unrelated failure starts cheap again.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl Backoff {
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        *attempt += 1;
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
        let capped = exp.min(self.max);
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter)
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().unwrap().remove(key);
    }
}

/// What the owner writer hands back for the export stage.
struct UpdateOutcome {
    app_name: String,
    promoted: HashMap<String, ResourceStep>,
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

/// Per-event orchestration: refetch the pod, classify its failing
/// sidecars, update the owning workload, then export any promotions.
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Data>) -> Result<Action> {
    let key = pod_key(&pod);
    let namespace = pod.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pod = match pods.get_opt(&pod.name_any()).await? {
        Some(pod) => pod,
        None => {
            // Deletion race. A persistent failure pattern resurfaces on the
            // next pod under the same owner.
            debug!("pod {} gone before reconcile, dropping event", key);
            ctx.backoff.reset(&key);
            return Ok(Action::await_change());
        }
    };

    let owners = details::resolve_owners(&pod);
    let matched = details::match_details(&ctx.conf, &pod);
    let failing = details::filter_terminated(matched);
    let grouped = details::group_by_owner(failing);
    if grouped.is_empty() {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    if grouped.contains_key(&Owner::Deployment) && grouped.contains_key(&Owner::DaemonSet) {
        bail!(ErrorKind::ConflictingOwners(key));
    }

    let mut outcome = None;
    if let Some(group) = grouped.get(&Owner::Deployment) {
        outcome = Some(update_deployment(&ctx, group, &owners).await?);
    }
    if let Some(group) = grouped.get(&Owner::DaemonSet) {
        outcome = Some(update_daemon_set(&ctx, group, &owners).await?);
    }
    if grouped.contains_key(&Owner::ReplicaSet) {
        debug!(
            "replica-set-owned sidecars on {} have no direct update path, skipping",
            key
        );
    }

    if let Some(outcome) = outcome {
        if !outcome.promoted.is_empty() {
            match ctx
                .store
                .upload_new_steps(&outcome.app_name, &outcome.promoted)
                .await
            {
                Ok(receipt) => {
                    info!(
                        "exported new steps for {} (receipt {:?})",
                        outcome.app_name, receipt
                    );
                }
                Err(e) => {
                    if matches!(e.kind(), ErrorKind::ExportTimeout) {
                        return Err(e);
                    }
                    // The owner update already landed; see ErrorKind::ExportFailed.
                    return Err(Error::with_chain(
                        e,
                        ErrorKind::ExportFailed(outcome.app_name),
                    ));
                }
            }
        }
    }

    ctx.backoff.reset(&key);
    Ok(Action::await_change())
}

/// Terminal errors are logged and left alone until the pod changes
/// again; everything else re-queues on the per-key backoff.
pub fn error_policy(pod: Arc<Pod>, err: &Error, ctx: Arc<Data>) -> Action {
    let key = pod_key(&pod);
    match err.kind() {
        ErrorKind::ExportFailed(app_name) => {
            error!(
                "reconcile of {} failed terminally, not retrying (app {}): {}",
                key, app_name, err
            );
            ctx.backoff.reset(&key);
            Action::await_change()
        }
        _ => {
            let delay = ctx.backoff.next_delay(&key);
            warn!(
                "reconcile of {} failed, retrying in {:?}: {}",
                key, delay, err
            );
            Action::requeue(delay)
        }
    }
}

/// Deployment-owned pods are updated through the chain the cluster
/// builds for them: the pod's ReplicaSet owner names the Deployment that
/// carries the pod template.
async fn update_deployment(
    ctx: &Data,
    group: &[ContainerDetail<'_>],
    owners: &HashMap<Owner, NamespacedName>,
) -> Result<UpdateOutcome> {
    let rs_ref = owners
        .get(&Owner::ReplicaSet)
        .ok_or_else(|| Error::from(ErrorKind::MissingOwnerRef(Owner::ReplicaSet)))?;

    let replica_sets: Api<ReplicaSet> = Api::namespaced(ctx.client.clone(), &rs_ref.namespace);
    let replica_set = replica_sets
        .get(&rs_ref.name)
        .await
        .chain_err(|| format!("error retrieving replica set {} as owner of pod", rs_ref.name))?;

    let deployment_name = replica_set
        .owner_references()
        .iter()
        .find(|owner_ref| owner_ref.kind == "Deployment")
        .map(|owner_ref| owner_ref.name.clone())
        .ok_or_else(|| Error::from(ErrorKind::OwnerChainBroken(rs_ref.name.clone())))?;

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &rs_ref.namespace);
    let mut deployment = deployments
        .get(&deployment_name)
        .await
        .chain_err(|| format!("error retrieving deployment {}", deployment_name))?;

    let new = ladder::compute_new_annotations(
        group,
        deployment.metadata.annotations.as_ref(),
        deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|metadata| metadata.annotations.as_ref()),
    )?;

    let app_name = deployment
        .labels()
        .get(&ctx.conf.label_name)
        .cloned()
        .unwrap_or_default();

    deployment.metadata.annotations = Some(new.owner_annotations);
    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| Error::from(format!("deployment {} has no spec", deployment_name)))?;
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations = Some(new.pod_annotations);

    deployments
        .replace(&deployment_name, &PostParams::default(), &deployment)
        .await
        .chain_err(|| format!("error updating annotations on deployment {}", deployment_name))?;
    info!("updated annotations on deployment {}", deployment_name);

    Ok(UpdateOutcome {
        app_name,
        promoted: new.promoted,
    })
}

async fn update_daemon_set(
    ctx: &Data,
    group: &[ContainerDetail<'_>],
    owners: &HashMap<Owner, NamespacedName>,
) -> Result<UpdateOutcome> {
    let ds_ref = owners
        .get(&Owner::DaemonSet)
        .ok_or_else(|| Error::from(ErrorKind::MissingOwnerRef(Owner::DaemonSet)))?;

    let daemon_sets: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), &ds_ref.namespace);
    let mut daemon_set = daemon_sets
        .get(&ds_ref.name)
        .await
        .chain_err(|| format!("error retrieving daemonset {}", ds_ref.name))?;

    let new = ladder::compute_new_annotations(
        group,
        daemon_set.metadata.annotations.as_ref(),
        daemon_set
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|metadata| metadata.annotations.as_ref()),
    )?;

    let app_name = daemon_set
        .labels()
        .get(&ctx.conf.label_name)
        .cloned()
        .unwrap_or_default();

    daemon_set.metadata.annotations = Some(new.owner_annotations);
    let spec = daemon_set
        .spec
        .as_mut()
        .ok_or_else(|| Error::from(format!("daemonset {} has no spec", ds_ref.name)))?;
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations = Some(new.pod_annotations);

    daemon_sets
        .replace(&ds_ref.name, &PostParams::default(), &daemon_set)
        .await
        .chain_err(|| format!("error updating annotations on daemonset {}", ds_ref.name))?;
    info!("updated annotations on daemonset {}", ds_ref.name);

    Ok(UpdateOutcome {
        app_name,
        promoted: new.promoted,
    })
}
