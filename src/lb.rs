//! Cloud load balancer management
//!
//! One load balancer fronts each cluster's control plane. The manager
//! half owns the orchestration-facing behavior: create-then-poll until
//! active within a wall-clock bound, the two-phase backend attachment
//! (master-1 first, remaining masters after join), and best-effort
//! deletion during teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::model::{AuthOptions, LbStatus, LoadBalancerRef};
use crate::{Error, Result};

/// Request to create one load balancer
#[derive(Clone, Debug, Serialize)]
pub struct LbSpec {
    /// Load balancer name (`<cluster>-k8s-lb`)
    pub name: String,
    /// Listener protocol
    pub protocol: String,
    /// Listener port
    pub port: u16,
}

/// Capability to manage cloud load balancers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Create a load balancer with a public virtual IP
    async fn create(&self, auth: &AuthOptions, spec: &LbSpec) -> Result<LoadBalancerRef>;

    /// Fetch current status and virtual IPs
    async fn get(&self, auth: &AuthOptions, id: &str) -> Result<LoadBalancerRef>;

    /// Delete a load balancer
    async fn delete(&self, auth: &AuthOptions, id: &str) -> Result<()>;

    /// Attach backend addresses at the given port, condition enabled
    async fn attach_nodes(
        &self,
        auth: &AuthOptions,
        id: &str,
        addresses: &[String],
        port: u16,
    ) -> Result<()>;
}

/// Orchestration-facing load balancer manager
pub struct LbManager {
    api: Arc<dyn LoadBalancerApi>,
    poll_interval: Duration,
    wait_bound: Duration,
}

impl LbManager {
    /// Create a manager polling every `poll_interval` for up to `wait_bound`
    pub fn new(api: Arc<dyn LoadBalancerApi>, poll_interval: Duration, wait_bound: Duration) -> Self {
        Self {
            api,
            poll_interval,
            wait_bound,
        }
    }

    /// Create a load balancer and poll until it reports active or the
    /// wall-clock bound expires.
    ///
    /// On timeout this returns the last observed reference rather than
    /// an error; callers must check [`LbStatus::is_active`] before
    /// attaching. Cancellation ends the wait the same way at the next
    /// poll boundary, so the created reference is never lost to the
    /// caller's cleanup path.
    pub async fn create_and_wait_active(
        &self,
        auth: &AuthOptions,
        spec: &LbSpec,
        cancel: &CancellationToken,
    ) -> Result<LoadBalancerRef> {
        let mut lb = self.api.create(auth, spec).await?;
        info!(name = %lb.name, id = %lb.id, "load balancer requested");

        let deadline = tokio::time::Instant::now() + self.wait_bound;
        loop {
            if lb.status.is_active() {
                info!(name = %lb.name, "load balancer active");
                return Ok(lb);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    name = %lb.name,
                    status = ?lb.status,
                    "load balancer not active within bound, giving up on attach"
                );
                return Ok(lb);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    warn!(name = %lb.name, "canceled while waiting for load balancer");
                    return Ok(lb);
                }
            }

            match self.api.get(auth, &lb.id).await {
                Ok(fresh) => lb = fresh,
                // Transient poll failures keep the last observation
                Err(e) => warn!(name = %lb.name, error = %e, "load balancer poll failed"),
            }
        }
    }

    /// Attach backend addresses at the load balancer's configured port
    pub async fn attach_addresses(
        &self,
        auth: &AuthOptions,
        lb: &LoadBalancerRef,
        addresses: &[String],
    ) -> Result<()> {
        if !lb.status.is_active() {
            return Err(Error::load_balancer(format!(
                "{} is not active; refusing to attach backends",
                lb.name
            )));
        }
        if addresses.is_empty() {
            return Ok(());
        }
        self.api.attach_nodes(auth, &lb.id, addresses, lb.port).await?;
        info!(name = %lb.name, count = addresses.len(), "backends attached");
        Ok(())
    }

    /// Delete the load balancer; failures are logged, never propagated
    pub async fn delete_best_effort(&self, auth: &AuthOptions, lb: &LoadBalancerRef) {
        if let Err(e) = self.api.delete(auth, &lb.id).await {
            warn!(name = %lb.name, error = %e, "load balancer delete failed, continuing teardown");
        }
    }
}

/// CloudLB-style REST adapter
pub struct HttpLoadBalancerApi {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct CreateLbBody<'a> {
    #[serde(rename = "loadBalancer")]
    load_balancer: CreateLb<'a>,
}

#[derive(Serialize)]
struct CreateLb<'a> {
    name: &'a str,
    protocol: &'a str,
    port: u16,
    #[serde(rename = "virtualIps")]
    virtual_ips: [VipSpec; 1],
}

#[derive(Serialize)]
struct VipSpec {
    #[serde(rename = "type")]
    type_: &'static str,
}

#[derive(Deserialize)]
struct LbEnvelope {
    #[serde(rename = "loadBalancer")]
    load_balancer: WireLb,
}

#[derive(Deserialize)]
struct WireLb {
    id: serde_json::Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    port: u16,
    status: LbStatus,
    #[serde(default, rename = "virtualIps")]
    virtual_ips: Vec<WireVip>,
}

#[derive(Deserialize)]
struct WireVip {
    address: String,
}

#[derive(Serialize)]
struct AttachNodesBody {
    nodes: Vec<AttachNode>,
}

#[derive(Serialize)]
struct AttachNode {
    address: String,
    port: u16,
    condition: &'static str,
}

impl From<WireLb> for LoadBalancerRef {
    fn from(lb: WireLb) -> Self {
        // Provider APIs disagree on numeric vs string ids
        let id = match lb.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        LoadBalancerRef {
            id,
            name: lb.name,
            protocol: lb.protocol,
            port: lb.port,
            status: lb.status,
            virtual_ips: lb.virtual_ips.into_iter().map(|v| v.address).collect(),
        }
    }
}

impl HttpLoadBalancerApi {
    /// Create an adapter for the given load balancer API endpoint
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
impl LoadBalancerApi for HttpLoadBalancerApi {
    async fn create(&self, auth: &AuthOptions, spec: &LbSpec) -> Result<LoadBalancerRef> {
        let body = CreateLbBody {
            load_balancer: CreateLb {
                name: &spec.name,
                protocol: &spec.protocol,
                port: spec.port,
                virtual_ips: [VipSpec { type_: "PUBLIC" }],
            },
        };

        let resp = self
            .authed(self.client.post(self.url("/loadbalancers")), auth)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::load_balancer(format!("create {}: {e}", spec.name)))?;

        if !resp.status().is_success() {
            return Err(Error::load_balancer(format!(
                "create {} rejected: {}",
                spec.name,
                resp.status()
            )));
        }

        let envelope: LbEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::load_balancer(format!("decoding create response: {e}")))?;
        Ok(envelope.load_balancer.into())
    }

    async fn get(&self, auth: &AuthOptions, id: &str) -> Result<LoadBalancerRef> {
        let resp = self
            .authed(self.client.get(self.url(&format!("/loadbalancers/{id}"))), auth)
            .send()
            .await
            .map_err(|e| Error::load_balancer(format!("get {id}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::load_balancer(format!(
                "get {id} rejected: {}",
                resp.status()
            )));
        }

        let envelope: LbEnvelope = resp
            .json()
            .await
            .map_err(|e| Error::load_balancer(format!("decoding {id}: {e}")))?;
        Ok(envelope.load_balancer.into())
    }

    async fn delete(&self, auth: &AuthOptions, id: &str) -> Result<()> {
        let resp = self
            .authed(
                self.client.delete(self.url(&format!("/loadbalancers/{id}"))),
                auth,
            )
            .send()
            .await
            .map_err(|e| Error::load_balancer(format!("delete {id}: {e}")))?;

        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::load_balancer(format!(
                "delete {id} rejected: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn attach_nodes(
        &self,
        auth: &AuthOptions,
        id: &str,
        addresses: &[String],
        port: u16,
    ) -> Result<()> {
        let body = AttachNodesBody {
            nodes: addresses
                .iter()
                .map(|a| AttachNode {
                    address: a.clone(),
                    port,
                    condition: "ENABLED",
                })
                .collect(),
        };

        let resp = self
            .authed(
                self.client
                    .post(self.url(&format!("/loadbalancers/{id}/nodes"))),
                auth,
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::load_balancer(format!("attach to {id}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::load_balancer(format!(
                "attach to {id} rejected: {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
