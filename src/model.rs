//! Cluster, node, and load balancer data types
//!
//! These types are the system of record once persisted in the cluster
//! store. The orchestrator owns a cluster exclusively while it is being
//! created or deleted; everything else reads through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Prefix applied to every instance name so bare compute listings can be
/// recognized as gantry-managed
pub const NODE_NAME_PREFIX: &str = "k8s";

/// Control-plane port exposed through the load balancer
pub const CONTROL_PLANE_PORT: u16 = 6443;

/// Build the canonical instance name for a cluster node.
///
/// Index is 1-based; the first master of cluster `demo` is
/// `k8s-demo-master-1`.
pub fn node_name(cluster: &str, role: NodeRole, index: u32) -> String {
    format!("{}-{}-{}-{}", NODE_NAME_PREFIX, cluster, role, index)
}

/// Build the canonical load balancer name for a cluster
pub fn lb_name(cluster: &str) -> String {
    format!("{}-k8s-lb", cluster)
}

/// Cluster lifecycle status
///
/// Transitions only move along
/// `Building -> {Active, Failed} -> Deleting -> Deleted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// VMs are being provisioned and the control plane bootstrapped
    Building,
    /// The control plane is up and all nodes joined
    Active,
    /// A terminal error occurred during creation
    Failed,
    /// Teardown is in progress
    Deleting,
    /// Soft-deleted; never returned by normal queries
    Deleted,
}

impl ClusterStatus {
    /// Whether a transition from `self` to `next` is legal
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, next),
            (Building, Active)
                | (Building, Failed)
                | (Building, Deleting)
                | (Active, Deleting)
                | (Failed, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterStatus::Building => "Building",
            ClusterStatus::Active => "Active",
            ClusterStatus::Failed => "Failed",
            ClusterStatus::Deleting => "Deleting",
            ClusterStatus::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Role a node holds within its cluster. A node may hold several.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Kubernetes control-plane member
    Master,
    /// Workload node
    Worker,
    /// External etcd member
    Etcd,
    /// Runs control-plane components (assigned alongside Master/Etcd)
    Controlplane,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
            NodeRole::Etcd => "etcd",
            NodeRole::Controlplane => "controlplane",
        };
        f.write_str(s)
    }
}

/// A provisioned cluster node
///
/// Created by the compute provider, owned by its cluster for its entire
/// lifetime. The admin password is the credential the provider issued at
/// creation; it is persisted for SSH access during bootstrap but never
/// appears in Debug output or logs.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Instance id assigned by the compute provider
    pub uuid: String,
    /// Canonical instance name (`k8s-<cluster>-<role>-<n>`)
    pub name: String,
    /// Admin credential issued at instance creation
    pub password: String,
    /// External (access) IP, populated once the instance is active
    #[serde(default)]
    pub ip: String,
    /// Internal IP, when the provider reports one
    #[serde(default)]
    pub internal_ip: String,
    /// Roles this node holds
    #[serde(default)]
    pub roles: Vec<NodeRole>,
    /// Name of the owning cluster
    #[serde(default)]
    pub cluster: String,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the admin credential
        f.debug_struct("Node")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("roles", &self.roles)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Load balancer provisioning status as reported by the cloud API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbStatus {
    /// Still being built by the provider
    Build,
    /// Serving traffic
    Active,
    /// Provider-side error
    Error,
    /// Deletion requested
    PendingDelete,
}

impl LbStatus {
    /// Whether the load balancer can accept backend attachments
    pub fn is_active(self) -> bool {
        matches!(self, LbStatus::Active)
    }
}

/// Reference to the cloud load balancer fronting a cluster's control plane
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerRef {
    /// Provider-assigned id
    pub id: String,
    /// Canonical name (`<cluster>-k8s-lb`)
    pub name: String,
    /// Listener protocol (HTTPS for the Kubernetes API)
    pub protocol: String,
    /// Listener port
    pub port: u16,
    /// Last observed status
    pub status: LbStatus,
    /// Virtual IP addresses exposed once active
    #[serde(default)]
    pub virtual_ips: Vec<String>,
}

impl LoadBalancerRef {
    /// The address additional nodes use as the control-plane endpoint
    pub fn virtual_address(&self) -> Result<&str> {
        self.virtual_ips
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::load_balancer(format!("{} has no virtual IP", self.name)))
    }
}

/// A provisioned (or in-progress) Kubernetes cluster
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    /// Immutable, globally unique identity
    pub uuid: Uuid,
    /// User-supplied cluster name
    pub name: String,
    /// Owning project
    pub project_id: String,
    /// Username that requested the cluster
    pub created_by: String,
    /// Desired master count
    pub masters: u32,
    /// Desired worker count
    pub workers: u32,
    /// Desired external etcd count (0 unless external_etcd)
    pub etcd: u32,
    /// Whether etcd runs on dedicated nodes
    pub external_etcd: bool,
    /// Lifecycle status
    pub status: ClusterStatus,
    /// Master node group
    #[serde(default)]
    pub master_nodes: Vec<Node>,
    /// Worker node group
    #[serde(default)]
    pub worker_nodes: Vec<Node>,
    /// External etcd node group
    #[serde(default)]
    pub etcd_nodes: Vec<Node>,
    /// Load balancer fronting the control plane, once created
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerRef>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted: bool,
}

impl Cluster {
    /// Canonical name of this cluster's first master
    pub fn first_master_name(&self) -> String {
        node_name(&self.name, NodeRole::Master, 1)
    }

    /// The first master node, if provisioned
    pub fn first_master(&self) -> Option<&Node> {
        let name = self.first_master_name();
        self.master_nodes.iter().find(|n| n.name == name)
    }

    /// Masters other than the first, in node-list order
    pub fn additional_masters(&self) -> impl Iterator<Item = &Node> {
        let first = self.first_master_name();
        self.master_nodes.iter().filter(move |n| n.name != first)
    }

    /// Every node in the cluster: masters, then workers, then etcd
    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = self.master_nodes.clone();
        nodes.extend(self.worker_nodes.iter().cloned());
        nodes.extend(self.etcd_nodes.iter().cloned());
        nodes
    }
}

/// An incoming cluster creation request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterRequest {
    /// Cluster name; required, DNS-label-ish
    pub name: String,
    /// Desired master count; defaults to 3 when omitted
    #[serde(default)]
    pub masters: Option<u32>,
    /// Desired worker count
    #[serde(default)]
    pub workers: u32,
    /// Provision dedicated etcd nodes
    #[serde(default)]
    pub external_etcd: bool,
    /// Dedicated etcd count, only honored when external_etcd is set
    #[serde(default)]
    pub etcd: u32,
}

impl ClusterRequest {
    /// Validate the request before any resource is allocated
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation(format!(
                "cluster name '{}' may only contain alphanumerics and '-'",
                self.name
            )));
        }
        if let Some(masters) = self.masters {
            if masters == 0 {
                return Err(Error::validation("master count must be at least 1"));
            }
        }
        if self.external_etcd && self.etcd == 0 {
            return Err(Error::validation(
                "external etcd requested but etcd count is 0",
            ));
        }
        Ok(())
    }

    /// Materialize a `Building` cluster record with a fresh identity
    pub fn into_cluster(self, project_id: &str, created_by: &str) -> Cluster {
        Cluster {
            uuid: Uuid::new_v4(),
            name: self.name,
            project_id: project_id.to_string(),
            created_by: created_by.to_string(),
            masters: self.masters.unwrap_or(3),
            workers: self.workers,
            etcd: if self.external_etcd { self.etcd } else { 0 },
            external_etcd: self.external_etcd,
            status: ClusterStatus::Building,
            master_nodes: Vec::new(),
            worker_nodes: Vec::new(),
            etcd_nodes: Vec::new(),
            load_balancer: None,
            created_at: Utc::now(),
            deleted: false,
        }
    }
}

/// Authentication options threaded from the HTTP layer into every
/// provider call
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthOptions {
    /// "Token" or "Password"
    pub auth_type: String,
    /// Provider API token, when auth_type is Token
    pub token: String,
    /// Account username
    pub username: String,
    /// Account password, when auth_type is Password
    pub password: String,
    /// Owning project id
    pub project_id: String,
}

impl std::fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOptions")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("project_id", &self.project_id)
            .finish()
    }
}
