//! Service configuration
//!
//! Everything is settable from the command line or environment. Timing
//! knobs live in their own struct so the orchestration code can be
//! driven with millisecond values in tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use clap::Parser;

use crate::ssh::HostKeyPolicy;
use crate::{Error, Result};

/// Kubernetes cluster provisioning service
#[derive(Clone, Debug, Parser)]
#[command(name = "gantry", version, about)]
pub struct Config {
    /// Address the HTTP API listens on
    #[arg(long, env = "GANTRY_LISTEN", default_value = "0.0.0.0:9191")]
    pub listen: String,

    /// Cluster store database URL
    #[arg(long, env = "GANTRY_DATABASE_URL", default_value = "sqlite://gantry.db")]
    pub database_url: String,

    /// Compute provider API endpoint
    #[arg(long, env = "GANTRY_COMPUTE_ENDPOINT")]
    pub compute_endpoint: String,

    /// Load balancer API endpoint
    #[arg(long, env = "GANTRY_LB_ENDPOINT")]
    pub lb_endpoint: String,

    /// Image id used for every node
    #[arg(long, env = "GANTRY_IMAGE")]
    pub image: String,

    /// Flavor id used for every node
    #[arg(long, env = "GANTRY_FLAVOR", default_value = "5")]
    pub flavor: String,

    /// Cloud-init user data injected into every node, base64-encoded
    #[arg(long, env = "GANTRY_USER_DATA_FILE")]
    pub user_data_file: Option<PathBuf>,

    /// Accept any SSH host key instead of requiring pinned fingerprints.
    /// Lab use only.
    #[arg(long, env = "GANTRY_SSH_ACCEPT_ANY_HOST_KEY")]
    pub ssh_accept_any_host_key: bool,

    /// Pinned host key, `host=sha256hex`. Repeatable.
    #[arg(long = "ssh-host-key", value_name = "HOST=FINGERPRINT")]
    pub ssh_host_keys: Vec<String>,
}

impl Config {
    /// Resolve the SSH host-key policy from the flags
    pub fn host_key_policy(&self) -> Result<HostKeyPolicy> {
        if self.ssh_accept_any_host_key {
            return Ok(HostKeyPolicy::AcceptAny);
        }
        let mut pins = HashMap::new();
        for entry in &self.ssh_host_keys {
            let (host, fingerprint) = entry.split_once('=').ok_or_else(|| {
                Error::validation(format!(
                    "malformed --ssh-host-key '{entry}', expected HOST=FINGERPRINT"
                ))
            })?;
            pins.insert(host.to_string(), fingerprint.to_string());
        }
        Ok(HostKeyPolicy::Pinned(pins))
    }

    /// Read and base64-encode the user data file, if configured
    pub fn load_user_data(&self) -> Result<Option<String>> {
        match &self.user_data_file {
            None => Ok(None),
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    Error::validation(format!("reading user data {}: {e}", path.display()))
                })?;
                Ok(Some(
                    base64::engine::general_purpose::STANDARD.encode(&bytes),
                ))
            }
        }
    }
}

/// Wall-clock knobs for the provisioning pipeline
#[derive(Clone, Debug)]
pub struct Timing {
    /// Interval between instance status polls
    pub node_poll_interval: Duration,
    /// Per-node bound on reaching active
    pub node_deadline: Duration,
    /// Bound on the whole cluster's nodes reaching active
    pub global_node_deadline: Duration,
    /// Grace period after all nodes are active, before kubeadm starts
    pub settle_delay: Duration,
    /// Interval between load balancer status polls
    pub lb_poll_interval: Duration,
    /// Bound on the load balancer reaching active
    pub lb_wait_bound: Duration,
    /// Delay before restarting kubelet on joining masters
    pub kubelet_restart_delay: Duration,
    /// SSH TCP connect timeout
    pub ssh_connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            node_poll_interval: Duration::from_secs(30),
            node_deadline: Duration::from_secs(10 * 60),
            global_node_deadline: Duration::from_secs(15 * 60),
            settle_delay: Duration::from_secs(60),
            lb_poll_interval: Duration::from_secs(20),
            lb_wait_bound: Duration::from_secs(10 * 60),
            kubelet_restart_delay: Duration::from_secs(2 * 60),
            ssh_connect_timeout: Duration::from_secs(15),
        }
    }
}

impl Timing {
    /// Millisecond-scale timing for tests
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            node_poll_interval: Duration::from_millis(2),
            node_deadline: Duration::from_millis(200),
            global_node_deadline: Duration::from_millis(400),
            settle_delay: Duration::from_millis(1),
            lb_poll_interval: Duration::from_millis(2),
            lb_wait_bound: Duration::from_millis(100),
            kubelet_restart_delay: Duration::from_millis(1),
            ssh_connect_timeout: Duration::from_millis(50),
        }
    }
}
