use crate::config::Config;
use crate::elector::LeaderElector;
use crate::errors::*;
use crate::reconciler::{self, Backoff, Data};
use crate::store;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use kube_runtime::controller::Controller;
use kube_runtime::watcher;
use log::{debug, info, warn};
use std::sync::Arc;

/// Wires the pod controller together: cluster client, leadership gate,
/// step store, then the reconcile loop. Returns only if the watch
/// stream ends; leadership loss exits the process from the renewal task.
pub async fn start(conf: Config) -> Result<()> {
    // Reads the environment for client config: in-cluster first, then
    // a kubeconfig file.
    let client = Client::try_default()
        .await
        .chain_err(|| "error creating client from cluster config")?;

    let elector = LeaderElector::new(client.clone());
    elector.acquire().await?;
    let _renewal = elector.spawn_renewal();

    let store = store::from_env().await?;
    let context = Arc::new(Data {
        client: client.clone(),
        conf,
        store,
        backoff: Backoff::default(),
    });

    let pods: Api<Pod> = Api::all(client);
    info!("starting pod controller");
    Controller::new(pods, watcher::Config::default())
        .run(reconciler::reconcile, reconciler::error_policy, context)
        .for_each(|res| {
            match res {
                Ok(o) => debug!("reconciled {:?}", o),
                Err(e) => warn!("reconcile stream error: {}", e),
            }
            futures::future::ready(())
        })
        .await;

    Ok(())
}
