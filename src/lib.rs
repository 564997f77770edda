#[macro_use]
extern crate error_chain;

pub mod config;
pub mod controller;
pub mod details;
pub mod elector;
pub mod ladder;
pub mod reconciler;
pub mod store;

pub mod errors {
    use crate::config::Owner;

    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Json(serde_json::Error);
            Kube(kube::Error);
        }

        errors {
            // The das/details annotation exists on the owner but does not
            // decode to a ladder state. External editors can cause this and
            // the next fetch may look different, so the reconcile is retried.
            DetailsParse(raw: String) {
                description("could not parse step details annotation")
                display("could not parse step details annotation: {}", raw)
            }

            // A pod cannot be co-owned by a deployment and a daemonset, so
            // no update is attempted when sidecars group to both.
            ConflictingOwners(pod: String) {
                description("pod groups to both a deployment and a daemonset")
                display("pod {} groups to both a deployment and a daemonset", pod)
            }

            // The pod's owner references have no entry of the kind the
            // update path needs.
            MissingOwnerRef(owner: Owner) {
                description("required owner reference not found on pod")
                display("no {:?} owner reference found on pod", owner)
            }

            OwnerChainBroken(replica_set: String) {
                description("owner chain broken")
                display("no deployment owner reference on replica set {}", replica_set)
            }

            // The store reported a deadline expiry. The cluster write already
            // landed, but a timeout is transient enough to retry.
            ExportTimeout {
                description("step export timed out")
                display("step export timed out")
            }

            // The store failed after the cluster write succeeded. Retrying
            // would re-run the ladder transition against the new rung and
            // silently skip the export, so no retry is scheduled.
            ExportFailed(app_name: String) {
                description("step export failed after owner update")
                display("step export failed after owner update for {}", app_name)
            }
        }
    }
}
