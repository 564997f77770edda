use crate::errors::*;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use log::{debug, error, info, warn};
use std::env;
use std::time::Duration;

pub const LEASE_NAME: &str = "das-controller";
pub const LEASE_NAMESPACE: &str = "das";

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(2);
const RENEW_PERIOD: Duration = Duration::from_secs(5);

/// Single-writer gate for the controller replicas. One coordination
/// lease, compare-and-set through the resource version the same way the
/// owner updates are, so two replicas cannot both believe they hold it.
pub struct LeaderElector {
    leases: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client) -> LeaderElector {
        let identity =
            env::var("HOSTNAME").unwrap_or_else(|_| format!("das-{}", std::process::id()));
        LeaderElector {
            leases: Api::namespaced(client, LEASE_NAMESPACE),
            identity,
        }
    }

    /// Blocks until this replica holds the lease.
    pub async fn acquire(&self) -> Result<()> {
        info!(
            "waiting for leadership lease {}/{} as {}",
            LEASE_NAMESPACE, LEASE_NAME, self.identity
        );
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!("acquired leadership lease as {}", self.identity);
                    return Ok(());
                }
                Ok(false) => debug!("leadership lease held elsewhere, waiting"),
                Err(e) => warn!("error acquiring leadership lease: {}", e),
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.leases.get_opt(LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(LEASE_NAMESPACE.to_string()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                match self.leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
                if !held_by_us && !expired(&spec) {
                    return Ok(false);
                }
                let transitions = spec.lease_transitions.unwrap_or(0);
                lease.spec = Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                    acquire_time: if held_by_us {
                        spec.acquire_time
                    } else {
                        Some(now.clone())
                    },
                    renew_time: Some(now),
                    lease_transitions: Some(if held_by_us {
                        transitions
                    } else {
                        transitions + 1
                    }),
                    ..Default::default()
                });
                match self
                    .leases
                    .replace(LEASE_NAME, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Re-asserts holdership in the background. Losing the lease ends
    /// the process; the orchestrator restarts the replica, which then
    /// queues behind the new holder.
    pub fn spawn_renewal(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                tokio::time::sleep(RENEW_PERIOD).await;
                match self.try_acquire().await {
                    Ok(true) => failures = 0,
                    Ok(false) => {
                        error!(
                            "leadership lease {} taken over by another holder, exiting",
                            LEASE_NAME
                        );
                        std::process::exit(1);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "error renewing leadership lease (attempt {}): {}",
                            failures, e
                        );
                        if RENEW_PERIOD * failures >= LEASE_DURATION {
                            error!("could not renew leadership lease within its duration, exiting");
                            std::process::exit(1);
                        }
                    }
                }
            }
        })
    }
}

fn expired(spec: &LeaseSpec) -> bool {
    let duration = chrono::Duration::seconds(
        spec.lease_duration_seconds
            .unwrap_or(LEASE_DURATION.as_secs() as i32) as i64,
    );
    match &spec.renew_time {
        Some(renew) => renew.0 + duration < Utc::now(),
        None => true,
    }
}
