//! HTTP surface
//!
//! Thin axum layer over the orchestrator. Authentication material rides
//! in on `X-Auth-*` headers and is threaded into every provider call;
//! nothing here holds credentials beyond the request. Responses use view
//! types so stored admin passwords never leave the service.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::compute::Instance;
use crate::model::{AuthOptions, Cluster, ClusterRequest, ClusterStatus, LoadBalancerRef, Node, NodeRole};
use crate::orchestrator::Orchestrator;
use crate::Error;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Cluster lifecycle owner
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the service router
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/clusters", get(list_clusters).post(create_cluster))
        .route(
            "/api/clusters/{cluster}",
            get(get_cluster).delete(delete_cluster),
        )
        .route("/api/clusters/{cluster}/nodes", get(get_nodes))
        .route("/api/discovery", get(discovery))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { orchestrator })
}

/// Error as the HTTP layer reports it
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Compute(_) | Error::LoadBalancer(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Per-request authentication context parsed from `X-Auth-*` headers
pub struct AuthContext(pub AuthOptions);

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| -> String {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let auth = AuthOptions {
            auth_type: header("X-Auth-Type"),
            token: header("X-Auth-Token"),
            username: header("X-Auth-Username"),
            password: header("X-Auth-Password"),
            project_id: header("X-Auth-ProjectId"),
        };
        if auth.project_id.is_empty() {
            return Err(ApiError::unauthorized("X-Auth-ProjectId header required"));
        }
        Ok(AuthContext(auth))
    }
}

/// Node as exposed over the API; the admin credential stays inside
#[derive(Serialize)]
pub struct NodeView {
    uuid: String,
    name: String,
    ip: String,
    internal_ip: String,
    roles: Vec<NodeRole>,
}

impl From<&Node> for NodeView {
    fn from(n: &Node) -> Self {
        Self {
            uuid: n.uuid.clone(),
            name: n.name.clone(),
            ip: n.ip.clone(),
            internal_ip: n.internal_ip.clone(),
            roles: n.roles.clone(),
        }
    }
}

/// Cluster as exposed over the API
#[derive(Serialize)]
pub struct ClusterView {
    uuid: Uuid,
    name: String,
    status: ClusterStatus,
    created_by: String,
    created_at: DateTime<Utc>,
    masters: u32,
    workers: u32,
    etcd: u32,
    external_etcd: bool,
    master_nodes: Vec<NodeView>,
    worker_nodes: Vec<NodeView>,
    etcd_nodes: Vec<NodeView>,
    load_balancer: Option<LoadBalancerRef>,
}

impl From<&Cluster> for ClusterView {
    fn from(c: &Cluster) -> Self {
        Self {
            uuid: c.uuid,
            name: c.name.clone(),
            status: c.status,
            created_by: c.created_by.clone(),
            created_at: c.created_at,
            masters: c.masters,
            workers: c.workers,
            etcd: c.etcd,
            external_etcd: c.external_etcd,
            master_nodes: c.master_nodes.iter().map(NodeView::from).collect(),
            worker_nodes: c.worker_nodes.iter().map(NodeView::from).collect(),
            etcd_nodes: c.etcd_nodes.iter().map(NodeView::from).collect(),
            load_balancer: c.load_balancer.clone(),
        }
    }
}

/// Instance as reported by discovery
#[derive(Serialize)]
pub struct DiscoveredNode {
    id: String,
    name: String,
    ip: String,
}

impl From<Instance> for DiscoveredNode {
    fn from(i: Instance) -> Self {
        Self {
            id: i.id,
            name: i.name,
            ip: i.access_ip,
        }
    }
}

async fn list_clusters(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
) -> Result<Json<Vec<ClusterView>>, ApiError> {
    let clusters = state.orchestrator.list(&auth.project_id).await?;
    Ok(Json(clusters.iter().map(ClusterView::from).collect()))
}

async fn create_cluster(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
    Json(request): Json<ClusterRequest>,
) -> Result<(StatusCode, Json<ClusterView>), ApiError> {
    let cluster = state.orchestrator.create(request, auth).await?;
    Ok((StatusCode::ACCEPTED, Json(ClusterView::from(&cluster))))
}

async fn get_cluster(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
    Path(cluster): Path<Uuid>,
) -> Result<Json<ClusterView>, ApiError> {
    let cluster = state.orchestrator.get(&auth.project_id, cluster).await?;
    Ok(Json(ClusterView::from(&cluster)))
}

async fn delete_cluster(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
    Path(cluster): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .delete(&auth.project_id.clone(), cluster, auth)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_nodes(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
    Path(cluster): Path<Uuid>,
) -> Result<Json<Vec<NodeView>>, ApiError> {
    let cluster = state.orchestrator.get(&auth.project_id, cluster).await?;
    Ok(Json(
        cluster.all_nodes().iter().map(NodeView::from).collect(),
    ))
}

async fn discovery(
    State(state): State<AppState>,
    AuthContext(auth): AuthContext,
) -> Result<Json<std::collections::BTreeMap<String, Vec<DiscoveredNode>>>, ApiError> {
    let clusters = state.orchestrator.discover(&auth).await?;
    Ok(Json(
        clusters
            .into_iter()
            .map(|(name, instances)| {
                (
                    name,
                    instances.into_iter().map(DiscoveredNode::from).collect(),
                )
            })
            .collect(),
    ))
}
