//! Control-plane bootstrap sequencing
//!
//! Once every VM is active this module turns them into a Kubernetes
//! cluster: kubeadm init on the first master against the load balancer's
//! virtual address, credential extraction from the init output,
//! sequential control-plane joins, CNI installation, then worker joins.
//! The sequence is strictly linear; the first failed command aborts the
//! rest and nothing is rolled back.

mod credentials;

pub use credentials::JoinCredentials;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Timing;
use crate::model::{Cluster, Node, CONTROL_PLANE_PORT};
use crate::ssh::RemoteRunner;
use crate::{Error, Result};

const KUBEADM: &str = "sudo /usr/bin/kubeadm";
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";
const CNI_MANIFEST_URL: &str = "https://docs.projectcalico.org/manifests/calico.yaml";

/// Where a bootstrap run currently stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Not started
    Idle,
    /// kubeadm init running on the first master
    FirstMasterInit,
    /// Join credentials parsed from the init output
    CredentialsExtracted,
    /// Every additional master has joined the control plane
    AdditionalMastersJoined,
    /// CNI manifest applied
    NetworkPluginInstalled,
    /// Every worker has joined
    WorkersJoined,
    /// Bootstrap finished
    Done,
    /// A step failed; the sequence stopped here
    Failed,
}

/// Drives kubeadm across a cluster's nodes in the required order
pub struct BootstrapSequencer {
    runner: Arc<dyn RemoteRunner>,
    timing: Timing,
    phase: std::sync::Mutex<BootstrapPhase>,
}

impl BootstrapSequencer {
    /// Create a sequencer issuing commands through `runner`
    pub fn new(runner: Arc<dyn RemoteRunner>, timing: Timing) -> Self {
        Self {
            runner,
            timing,
            phase: std::sync::Mutex::new(BootstrapPhase::Idle),
        }
    }

    /// Last phase the sequence reached
    pub fn phase(&self) -> BootstrapPhase {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, cluster: &str, phase: BootstrapPhase) {
        info!(cluster, ?phase, "bootstrap phase");
        *self.phase.lock().expect("phase lock") = phase;
    }

    /// Bootstrap the control plane and join every node.
    ///
    /// Requires all nodes active with addresses recorded and the load
    /// balancer's virtual address resolvable. Any command failure aborts
    /// the remaining steps and leaves the phase at `Failed`.
    pub async fn run(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<()> {
        match self.run_inner(cluster, cancel).await {
            Ok(()) => {
                self.set_phase(&cluster.name, BootstrapPhase::Done);
                Ok(())
            }
            Err(e) => {
                self.set_phase(&cluster.name, BootstrapPhase::Failed);
                Err(e)
            }
        }
    }

    async fn run_inner(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<()> {
        let first = cluster.first_master().ok_or_else(|| {
            Error::validation(format!(
                "cluster {} has no node named {}",
                cluster.name,
                cluster.first_master_name()
            ))
        })?;
        let lb = cluster
            .load_balancer
            .as_ref()
            .ok_or_else(|| Error::validation("cluster has no load balancer"))?;
        let endpoint = format!("{}:{}", lb.virtual_address()?, CONTROL_PLANE_PORT);

        // Freshly active nodes need a moment before sshd and cloud-init
        // are actually done
        tokio::select! {
            _ = tokio::time::sleep(self.timing.settle_delay) => {}
            _ = cancel.cancelled() => {
                return Err(Error::Canceled(format!(
                    "canceled before bootstrapping {}", cluster.name
                )));
            }
        }

        self.set_phase(&cluster.name, BootstrapPhase::FirstMasterInit);
        let init = format!("{KUBEADM} init --control-plane-endpoint '{endpoint}' --upload-certs");
        let output = self.runner.run(&init, &first.ip, &first.password).await?;

        let creds = JoinCredentials::extract(&output)?;
        self.set_phase(&cluster.name, BootstrapPhase::CredentialsExtracted);

        self.spawn_kubelet_restarts(cluster);

        let additional: Vec<&Node> = cluster.additional_masters().collect();
        if !additional.is_empty() {
            let join = format!(
                "{KUBEADM} join {endpoint} {} --control-plane --certificate-key {}",
                creds.join_args(),
                creds.certificate_key()?
            );
            for master in additional {
                self.check_cancel(cancel, cluster)?;
                info!(cluster = %cluster.name, node = %master.name, "joining control plane");
                self.runner.run(&join, &master.ip, &master.password).await?;
            }
        }
        self.set_phase(&cluster.name, BootstrapPhase::AdditionalMastersJoined);

        self.check_cancel(cancel, cluster)?;
        let cni = format!("sudo kubectl --kubeconfig {ADMIN_KUBECONFIG} apply -f {CNI_MANIFEST_URL}");
        self.runner.run(&cni, &first.ip, &first.password).await?;
        self.set_phase(&cluster.name, BootstrapPhase::NetworkPluginInstalled);

        let join = format!("{KUBEADM} join {endpoint} {}", creds.join_args());
        for worker in &cluster.worker_nodes {
            self.check_cancel(cancel, cluster)?;
            info!(cluster = %cluster.name, node = %worker.name, "joining worker");
            self.runner.run(&join, &worker.ip, &worker.password).await?;
        }
        self.set_phase(&cluster.name, BootstrapPhase::WorkersJoined);

        Ok(())
    }

    /// Joining masters occasionally leave kubelet wedged against the not
    /// yet converged control plane; a delayed restart unsticks them.
    /// Best effort, never blocks or fails the sequence.
    fn spawn_kubelet_restarts(&self, cluster: &Cluster) {
        let delay = self.timing.kubelet_restart_delay;
        for master in cluster.additional_masters() {
            let runner = Arc::clone(&self.runner);
            let host = master.ip.clone();
            let credential = master.password.clone();
            let name = master.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = runner
                    .run("sudo service kubelet restart", &host, &credential)
                    .await
                {
                    warn!(node = %name, error = %e, "kubelet restart failed");
                }
            });
        }
    }

    fn check_cancel(&self, cancel: &CancellationToken, cluster: &Cluster) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Canceled(format!(
                "canceled while bootstrapping {}",
                cluster.name
            )));
        }
        Ok(())
    }
}
