//! Compute provider abstraction and OpenStack-compatible adapter
//!
//! The orchestrator only needs four operations: create, inspect, delete,
//! and list instances. Instances are tagged with a service marker and
//! their cluster name so a bare listing can recover cluster membership
//! (the discovery read path).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::model::AuthOptions;
use crate::{Error, Result};

/// Metadata key marking an instance as managed by this service
pub const METADATA_MANAGED_KEY: &str = "k8saas";

/// Metadata key carrying the owning cluster's name
pub const METADATA_CLUSTER_KEY: &str = "cluster";

/// Metadata key carrying the node's roles hint
pub const METADATA_ROLES_KEY: &str = "roles";

/// Provider-reported instance status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Still booting
    Build,
    /// Running and reachable
    Active,
    /// Provider-side failure
    Error,
    /// Any state this adapter does not model
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// Whether the instance has finished booting
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Active)
    }
}

/// Request to create one instance
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSpec {
    /// Instance name (`k8s-<cluster>-<role>-<n>`)
    pub name: String,
    /// Image id to boot from
    pub image: String,
    /// Flavor id sizing the instance
    pub flavor: String,
    /// Metadata tags (service marker, cluster name, roles)
    pub metadata: HashMap<String, String>,
    /// Cloud-init user data, when configured
    pub user_data: Option<String>,
}

impl InstanceSpec {
    /// Build a spec tagged with the standard cluster-membership metadata
    pub fn for_cluster(
        name: impl Into<String>,
        cluster: &str,
        roles: &str,
        image: &str,
        flavor: &str,
        user_data: Option<String>,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_MANAGED_KEY.to_string(), "true".to_string());
        metadata.insert(METADATA_CLUSTER_KEY.to_string(), cluster.to_string());
        metadata.insert(METADATA_ROLES_KEY.to_string(), roles.to_string());
        Self {
            name: name.into(),
            image: image.to_string(),
            flavor: flavor.to_string(),
            metadata,
            user_data,
        }
    }
}

/// Observed state of one instance
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// Provider-assigned id
    pub id: String,
    /// Instance name
    pub name: String,
    /// Provider-reported status
    pub status: InstanceStatus,
    /// External (access) IP, empty until assigned
    #[serde(default)]
    pub access_ip: String,
    /// Admin credential, only present in the create response
    #[serde(default)]
    pub admin_pass: Option<String>,
    /// Metadata tags
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Instance {
    /// The cluster this instance belongs to, when tagged
    pub fn cluster(&self) -> Option<&str> {
        if !self.metadata.contains_key(METADATA_MANAGED_KEY) {
            return None;
        }
        self.metadata.get(METADATA_CLUSTER_KEY).map(String::as_str)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The admin credential never reaches logs
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("access_ip", &self.access_ip)
            .finish()
    }
}

/// Capability to manage VM instances on the IaaS provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create an instance; the response carries the issued admin credential
    async fn create_instance(&self, auth: &AuthOptions, spec: &InstanceSpec) -> Result<Instance>;

    /// Fetch current status, address, and metadata of an instance
    async fn get_instance(&self, auth: &AuthOptions, id: &str) -> Result<Instance>;

    /// Delete an instance; deleting an already-gone instance is not an error
    async fn delete_instance(&self, auth: &AuthOptions, id: &str) -> Result<()>;

    /// List instances whose name starts with `name_prefix`
    async fn list_instances(&self, auth: &AuthOptions, name_prefix: &str) -> Result<Vec<Instance>>;
}

/// OpenStack-compatible compute REST adapter
pub struct HttpComputeProvider {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct CreateServerBody<'a> {
    server: CreateServer<'a>,
}

#[derive(Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
    metadata: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    config_drive: bool,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: WireServer,
}

#[derive(Deserialize)]
struct ServerListEnvelope {
    servers: Vec<WireServer>,
}

#[derive(Deserialize)]
struct WireServer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default = "default_status")]
    status: InstanceStatus,
    #[serde(default, rename = "accessIPv4")]
    access_ipv4: String,
    #[serde(default, rename = "adminPass")]
    admin_pass: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_status() -> InstanceStatus {
    InstanceStatus::Build
}

impl From<WireServer> for Instance {
    fn from(s: WireServer) -> Self {
        Instance {
            id: s.id,
            name: s.name,
            status: s.status,
            access_ip: s.access_ipv4,
            admin_pass: s.admin_pass,
            metadata: s.metadata,
        }
    }
}

impl HttpComputeProvider {
    /// Create an adapter for the given compute API endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn authed(&self, req: reqwest::RequestBuilder, auth: &AuthOptions) -> reqwest::RequestBuilder {
        req.header("X-Auth-Token", &auth.token)
            .header("X-Auth-Project-Id", &auth.project_id)
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn create_instance(&self, auth: &AuthOptions, spec: &InstanceSpec) -> Result<Instance> {
        let body = CreateServerBody {
            server: CreateServer {
                name: &spec.name,
                image_ref: &spec.image,
                flavor_ref: &spec.flavor,
                metadata: &spec.metadata,
                user_data: spec.user_data.as_deref(),
                config_drive: true,
            },
        };

        let resp = self
            .authed(self.client.post(self.url("/servers")), auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::compute(format!("create {} failed: {e}", spec.name)))?;

        if !resp.status().is_success() {
            return Err(Error::compute(format!(
                "create {} rejected: {}",
                spec.name,
                resp.status()
            )));
        }

        let envelope: ServerEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::compute(format!("decoding create response: {e}")))?;

        debug!(name = %spec.name, id = %envelope.server.id, "instance requested");
        let mut instance: Instance = envelope.server.into();
        // The create response omits the name; keep the requested one
        if instance.name.is_empty() {
            instance.name = spec.name.clone();
        }
        Ok(instance)
    }

    async fn get_instance(&self, auth: &AuthOptions, id: &str) -> Result<Instance> {
        let resp = self
            .authed(self.client.get(self.url(&format!("/servers/{id}"))), auth)
            .send()
            .await
            .map_err(|e| Error::compute(format!("get instance {id}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::compute(format!(
                "get instance {id} rejected: {}",
                resp.status()
            )));
        }

        let envelope: ServerEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::compute(format!("decoding instance {id}: {e}")))?;
        Ok(envelope.server.into())
    }

    async fn delete_instance(&self, auth: &AuthOptions, id: &str) -> Result<()> {
        let resp = self
            .authed(self.client.delete(self.url(&format!("/servers/{id}"))), auth)
            .send()
            .await
            .map_err(|e| Error::compute(format!("delete instance {id}: {e}")))?;

        // An already-deleted instance is a success for teardown purposes
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::compute(format!(
                "delete instance {id} rejected: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn list_instances(&self, auth: &AuthOptions, name_prefix: &str) -> Result<Vec<Instance>> {
        let resp = self
            .authed(self.client.get(self.url("/servers/detail")), auth)
            .query(&[("name", format!("{name_prefix}*"))])
            .send()
            .await
            .map_err(|e| Error::compute(format!("list instances: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::compute(format!(
                "list instances rejected: {}",
                resp.status()
            )));
        }

        let envelope: ServerListEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::compute(format!("decoding instance list: {e}")))?;
        Ok(envelope.servers.into_iter().map(Instance::from).collect())
    }
}
