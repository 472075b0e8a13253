//! gantry: Kubernetes cluster provisioning for IaaS clouds
//!
//! Takes a cluster request, fans out VM creation, waits for the nodes to
//! boot, bootstraps a highly available control plane with kubeadm over
//! SSH, and fronts it with a cloud load balancer. Cluster state is
//! durable; progress is observed by polling the cluster record.
//!
//! Module map:
//! - [`api`]: HTTP surface (axum)
//! - [`orchestrator`]: cluster create/delete lifecycle
//! - [`tracker`]: waits for provisioned VMs to become active
//! - [`bootstrap`]: kubeadm sequencing and join-credential extraction
//! - [`lb`]: load balancer management
//! - [`compute`], [`ssh`], [`store`]: provider and persistence adapters

pub mod api;
pub mod bootstrap;
pub mod compute;
pub mod config;
pub mod error;
pub mod lb;
pub mod model;
pub mod orchestrator;
pub mod ssh;
pub mod store;
pub mod tracker;

pub use error::Error;

/// Convenience result type for gantry operations
pub type Result<T> = std::result::Result<T, Error>;
