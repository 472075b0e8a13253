//! Node activation tracking
//!
//! After the orchestrator has asked the provider for every VM, the
//! tracker watches them come up: one watcher task per node polling
//! instance status, results fanned in over a channel. The wait ends when
//! every node is active, when any node fails terminally, or when the
//! global deadline expires with the stuck nodes named in the error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compute::{ComputeProvider, Instance, InstanceStatus};
use crate::config::Timing;
use crate::model::{AuthOptions, Cluster, Node};
use crate::{Error, Result};

/// Watches provisioned instances until the whole cluster is active
pub struct NodeTracker {
    compute: Arc<dyn ComputeProvider>,
    timing: Timing,
}

enum WatchOutcome {
    Active(Instance),
    Failed(Error),
}

impl NodeTracker {
    /// Create a tracker polling through `compute` with the given timing
    pub fn new(compute: Arc<dyn ComputeProvider>, timing: Timing) -> Self {
        Self { compute, timing }
    }

    /// Wait until every node of `cluster` reports active, then fold the
    /// observed addresses back into the node records.
    ///
    /// Fails on the first terminally failed node, on cancellation, or
    /// when the global deadline passes; the deadline error names every
    /// node still pending.
    pub async fn wait_all_active(
        &self,
        auth: &AuthOptions,
        cluster: &mut Cluster,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let nodes = cluster.all_nodes();
        if nodes.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<(String, WatchOutcome)>(nodes.len());
        for node in &nodes {
            tokio::spawn(Self::watch_node(
                Arc::clone(&self.compute),
                auth.clone(),
                node.clone(),
                self.timing.clone(),
                cancel.clone(),
                tx.clone(),
            ));
        }
        drop(tx);

        let mut pending: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let mut observed: HashMap<String, Instance> = HashMap::new();
        let global_deadline = tokio::time::sleep(self.timing.global_node_deadline);
        tokio::pin!(global_deadline);

        while !pending.is_empty() {
            tokio::select! {
                outcome = rx.recv() => {
                    let Some((name, outcome)) = outcome else {
                        // All watchers gone without reporting; treat as failure
                        return Err(Error::compute(format!(
                            "lost track of nodes: {}", pending.join(", ")
                        )));
                    };
                    pending.retain(|n| n != &name);
                    match outcome {
                        WatchOutcome::Active(instance) => {
                            debug!(node = %name, ip = %instance.access_ip, "node active");
                            observed.insert(name, instance);
                        }
                        WatchOutcome::Failed(err) => return Err(err),
                    }
                }
                _ = &mut global_deadline => {
                    return Err(Error::timeout(format!(
                        "nodes not active within bound: {}", pending.join(", ")
                    )));
                }
                _ = cancel.cancelled() => {
                    return Err(Error::Canceled(format!(
                        "canceled while waiting for nodes of {}", cluster.name
                    )));
                }
            }
        }

        for group in [
            &mut cluster.master_nodes,
            &mut cluster.worker_nodes,
            &mut cluster.etcd_nodes,
        ] {
            for node in group.iter_mut() {
                apply_observation(node, &observed);
            }
        }

        info!(cluster = %cluster.name, nodes = nodes.len(), "all nodes active");
        Ok(())
    }

    async fn watch_node(
        compute: Arc<dyn ComputeProvider>,
        auth: AuthOptions,
        node: Node,
        timing: Timing,
        cancel: CancellationToken,
        tx: mpsc::Sender<(String, WatchOutcome)>,
    ) {
        let deadline = tokio::time::Instant::now() + timing.node_deadline;
        let outcome = loop {
            match compute.get_instance(&auth, &node.uuid).await {
                Ok(instance) if instance.status.is_active() => {
                    break WatchOutcome::Active(instance);
                }
                Ok(instance) if instance.status == InstanceStatus::Error => {
                    break WatchOutcome::Failed(Error::compute(format!(
                        "node {} entered error state during boot",
                        node.name
                    )));
                }
                Ok(instance) => {
                    debug!(node = %node.name, status = ?instance.status, "node still booting");
                }
                // Transient poll failures are retried until the deadline
                Err(e) => warn!(node = %node.name, error = %e, "instance poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                break WatchOutcome::Failed(Error::timeout(format!(
                    "node {} not active within bound",
                    node.name
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(timing.node_poll_interval) => {}
                _ = cancel.cancelled() => return,
            }
        };

        // Receiver may already have given up; nothing to do then
        let _ = tx.send((node.name, outcome)).await;
    }
}

fn apply_observation(node: &mut Node, observed: &HashMap<String, Instance>) {
    if let Some(instance) = observed.get(&node.name) {
        node.ip = instance.access_ip.clone();
        if node.internal_ip.is_empty() {
            node.internal_ip = instance.access_ip.clone();
        }
    }
}
