//! Cluster lifecycle orchestration
//!
//! `create` persists a `Building` record and spawns the provisioning run;
//! callers observe progress by polling the record. The run provisions the
//! load balancer and the VMs concurrently, waits for everything to come
//! up, bootstraps the control plane, and wires the masters behind the
//! load balancer. Any terminal failure marks the cluster `Failed`.
//!
//! A single-writer guard serializes operations per cluster: a create or
//! delete for a cluster that already has an operation in flight is a
//! `Conflict`. Deleting a `Building` cluster first cancels its run.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bootstrap::BootstrapSequencer;
use crate::compute::{ComputeProvider, InstanceSpec};
use crate::config::Timing;
use crate::lb::{LbManager, LbSpec};
use crate::model::{
    lb_name, node_name, AuthOptions, Cluster, ClusterRequest, ClusterStatus, Node, NodeRole,
    CONTROL_PLANE_PORT,
};
use crate::ssh::RemoteRunner;
use crate::store::ClusterStore;
use crate::tracker::NodeTracker;
use crate::{Error, Result};

/// Instance parameters shared by every node this service creates
#[derive(Clone, Debug)]
pub struct ProvisionDefaults {
    /// Image id to boot from
    pub image: String,
    /// Flavor id sizing each node
    pub flavor: String,
    /// Base64-encoded cloud-init user data, when configured
    pub user_data: Option<String>,
}

struct Operation {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns the full create/delete lifecycle of clusters
pub struct Orchestrator {
    store: Arc<dyn ClusterStore>,
    compute: Arc<dyn ComputeProvider>,
    lb: LbManager,
    runner: Arc<dyn RemoteRunner>,
    timing: Timing,
    defaults: ProvisionDefaults,
    operations: DashMap<Uuid, Operation>,
}

/// Releases the single-writer guard when an operation ends
struct OperationGuard {
    orchestrator: Arc<Orchestrator>,
    uuid: Uuid,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.orchestrator.operations.remove(&self.uuid);
    }
}

impl Orchestrator {
    /// Wire up an orchestrator over the given adapters
    pub fn new(
        store: Arc<dyn ClusterStore>,
        compute: Arc<dyn ComputeProvider>,
        lb: LbManager,
        runner: Arc<dyn RemoteRunner>,
        timing: Timing,
        defaults: ProvisionDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            compute,
            lb,
            runner,
            timing,
            defaults,
            operations: DashMap::new(),
        })
    }

    /// All live clusters in the caller's project
    pub async fn list(&self, project_id: &str) -> Result<Vec<Cluster>> {
        self.store.find_all(project_id).await
    }

    /// One live cluster in the caller's project
    pub async fn get(&self, project_id: &str, uuid: Uuid) -> Result<Cluster> {
        self.store.find_one(project_id, uuid).await
    }

    /// Recover cluster membership straight from the provider: every
    /// managed instance, grouped by the cluster tag in its metadata.
    /// Catches drift between the store and what actually exists.
    pub async fn discover(
        &self,
        auth: &AuthOptions,
    ) -> Result<std::collections::BTreeMap<String, Vec<crate::compute::Instance>>> {
        let prefix = format!("{}-", crate::model::NODE_NAME_PREFIX);
        let instances = self.compute.list_instances(auth, &prefix).await?;

        let mut clusters = std::collections::BTreeMap::<String, Vec<_>>::new();
        for instance in instances {
            if let Some(cluster) = instance.cluster() {
                clusters.entry(cluster.to_string()).or_default().push(instance);
            }
        }
        Ok(clusters)
    }

    /// Validate and persist a new cluster, then spawn its provisioning
    /// run. Returns the `Building` record immediately.
    pub async fn create(
        self: &Arc<Self>,
        request: ClusterRequest,
        auth: AuthOptions,
    ) -> Result<Cluster> {
        request.validate()?;
        let cluster = request.into_cluster(&auth.project_id, &auth.username);
        self.store.insert(&cluster).await?;

        let cancel = self.acquire(cluster.uuid)?;
        let guard = OperationGuard {
            orchestrator: Arc::clone(self),
            uuid: cluster.uuid,
        };

        let this = Arc::clone(self);
        let record = cluster.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_create(record, auth, cancel).await;
        });
        if let Some(mut op) = self.operations.get_mut(&cluster.uuid) {
            op.handle = Some(handle);
        }

        info!(cluster = %cluster.name, uuid = %cluster.uuid, "cluster creation started");
        Ok(cluster)
    }

    /// Tear down a cluster's resources and soft-delete its record.
    ///
    /// A cluster with an operation already in flight is a `Conflict`; the
    /// in-flight run is canceled so a retry can proceed once it unwinds.
    pub async fn delete(self: &Arc<Self>, project_id: &str, uuid: Uuid, auth: AuthOptions) -> Result<()> {
        let mut cluster = self.store.find_one(project_id, uuid).await?;

        if let Some(op) = self.operations.get(&uuid) {
            let running = op.handle.as_ref().is_none_or(|h| !h.is_finished());
            op.cancel.cancel();
            warn!(cluster = %cluster.name, running, "delete requested with operation in flight");
            return Err(Error::conflict(format!(
                "cluster {} has an operation in progress; canceling it, retry shortly",
                cluster.name
            )));
        }
        let cancel = self.acquire(uuid)?;
        let _guard = OperationGuard {
            orchestrator: Arc::clone(self),
            uuid,
        };
        drop(cancel);

        // A record already in Deleting is a previous teardown that did
        // not finish; resume it instead of rejecting the retry
        if cluster.status == ClusterStatus::Deleting {
            info!(cluster = %cluster.name, "resuming interrupted deletion");
        } else {
            if !cluster.status.can_transition_to(ClusterStatus::Deleting) {
                return Err(Error::conflict(format!(
                    "cluster {} cannot be deleted while {}",
                    cluster.name, cluster.status
                )));
            }
            cluster.status = ClusterStatus::Deleting;
            self.store.update(&cluster).await?;
            info!(cluster = %cluster.name, "cluster deletion started");
        }

        // Workers first, then masters, then etcd; each delete best-effort
        let teardown: Vec<&Node> = cluster
            .worker_nodes
            .iter()
            .chain(cluster.master_nodes.iter())
            .chain(cluster.etcd_nodes.iter())
            .collect();
        for node in teardown {
            if let Err(e) = self.compute.delete_instance(&auth, &node.uuid).await {
                warn!(node = %node.name, error = %e, "instance delete failed, continuing");
            }
        }

        if let Some(lb) = &cluster.load_balancer {
            self.lb.delete_best_effort(&auth, lb).await;
        }

        cluster.status = ClusterStatus::Deleted;
        cluster.deleted = true;
        self.store.update(&cluster).await?;
        info!(cluster = %cluster.name, "cluster deleted");
        Ok(())
    }

    fn acquire(&self, uuid: Uuid) -> Result<CancellationToken> {
        let cancel = CancellationToken::new();
        match self.operations.entry(uuid) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::conflict(format!(
                "cluster {uuid} already has an operation in progress"
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Operation {
                    cancel: cancel.clone(),
                    handle: None,
                });
                Ok(cancel)
            }
        }
    }

    async fn run_create(&self, mut cluster: Cluster, auth: AuthOptions, cancel: CancellationToken) {
        let name = cluster.name.clone();
        if let Err(e) = self.try_create(&mut cluster, &auth, &cancel).await {
            error!(cluster = %name, error = %e, "cluster creation failed");
            cluster.status = ClusterStatus::Failed;
            if let Err(e) = self.store.update(&cluster).await {
                error!(cluster = %name, error = %e, "failed to record Failed status");
            }
        }
    }

    async fn try_create(
        &self,
        cluster: &mut Cluster,
        auth: &AuthOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let lb_spec = LbSpec {
            name: lb_name(&cluster.name),
            protocol: "HTTPS".to_string(),
            port: CONTROL_PLANE_PORT,
        };

        // The load balancer builds while the VMs are being requested; a
        // provisioning failure cancels the wait instead of riding out
        // the full bound
        let lb_cancel = cancel.child_token();
        let (lb_result, provision_result) = tokio::join!(
            self.lb.create_and_wait_active(auth, &lb_spec, &lb_cancel),
            async {
                let result = self.provision_nodes(cluster, auth, cancel).await;
                if result.is_err() {
                    lb_cancel.cancel();
                }
                result
            },
        );
        // Record whatever was created, active or not, so a later delete
        // can clean it up
        if let Ok(lb) = &lb_result {
            cluster.load_balancer = Some(lb.clone());
        }
        provision_result?;
        self.store.update(cluster).await?;

        let tracker = NodeTracker::new(Arc::clone(&self.compute), self.timing.clone());
        tracker.wait_all_active(auth, cluster, cancel).await?;
        self.store.update(cluster).await?;

        let lb = lb_result?;
        if !lb.status.is_active() {
            return Err(Error::load_balancer(format!(
                "{} did not become active",
                lb.name
            )));
        }

        let first_master_ip = cluster
            .first_master()
            .ok_or_else(|| Error::validation("no first master provisioned"))?
            .ip
            .clone();
        self.lb
            .attach_addresses(auth, &lb, &[first_master_ip])
            .await?;

        let sequencer = BootstrapSequencer::new(Arc::clone(&self.runner), self.timing.clone());
        sequencer.run(cluster, cancel).await?;

        let additional: Vec<String> = cluster
            .additional_masters()
            .map(|n| n.ip.clone())
            .collect();
        self.lb.attach_addresses(auth, &lb, &additional).await?;

        cluster.status = ClusterStatus::Active;
        self.store.update(cluster).await?;
        info!(cluster = %cluster.name, "cluster active");
        Ok(())
    }

    /// Request every VM sequentially, masters then workers then etcd.
    /// The first create failure stops issuing further requests.
    async fn provision_nodes(
        &self,
        cluster: &mut Cluster,
        auth: &AuthOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let groups = [
            (NodeRole::Master, cluster.masters, vec![NodeRole::Master, NodeRole::Controlplane]),
            (NodeRole::Worker, cluster.workers, vec![NodeRole::Worker]),
            (NodeRole::Etcd, cluster.etcd, vec![NodeRole::Etcd, NodeRole::Controlplane]),
        ];

        for (role, count, roles) in groups {
            for index in 1..=count {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled(format!(
                        "canceled while provisioning {}",
                        cluster.name
                    )));
                }
                let node = self
                    .provision_node(cluster, auth, role, index, &roles)
                    .await?;
                match role {
                    NodeRole::Master => cluster.master_nodes.push(node),
                    NodeRole::Worker => cluster.worker_nodes.push(node),
                    NodeRole::Etcd => cluster.etcd_nodes.push(node),
                    NodeRole::Controlplane => unreachable!("not a provisioning group"),
                }
            }
        }
        Ok(())
    }

    async fn provision_node(
        &self,
        cluster: &Cluster,
        auth: &AuthOptions,
        role: NodeRole,
        index: u32,
        roles: &[NodeRole],
    ) -> Result<Node> {
        let name = node_name(&cluster.name, role, index);
        let roles_hint = roles
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let spec = InstanceSpec::for_cluster(
            &name,
            &cluster.name,
            &roles_hint,
            &self.defaults.image,
            &self.defaults.flavor,
            self.defaults.user_data.clone(),
        );

        let instance = self.compute.create_instance(auth, &spec).await?;
        let password = instance.admin_pass.ok_or_else(|| {
            Error::compute(format!("provider issued no admin credential for {name}"))
        })?;
        info!(node = %name, id = %instance.id, "instance requested");

        Ok(Node {
            uuid: instance.id,
            name,
            password,
            ip: instance.access_ip,
            internal_ip: String::new(),
            roles: roles.to_vec(),
            cluster: cluster.name.clone(),
        })
    }
}
