//! Remote command execution over SSH
//!
//! The bootstrap sequencer drives kubeadm on freshly booted nodes through
//! this seam: one authenticated connection per command, combined
//! stdout/stderr capture, non-zero exit reported as an error carrying the
//! captured output.
//!
//! # Host keys
//!
//! Host-key verification is on by default: the runner only connects to
//! hosts whose SHA-256 fingerprint has been pinned. Accepting any host
//! key is an explicit configuration opt-in for lab environments, never
//! the default.

use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{HashType, Session};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// SSH port used for every node
const SSH_PORT: u16 = 22;

/// Account the compute image provisions for bootstrap access
const SSH_USER: &str = "root";

/// Capability to run a single command on a remote host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Run `command` on `host`, authenticating with `credential`.
    ///
    /// Returns the combined stdout and stderr of the command. A
    /// connection failure or non-zero exit status is an error; the error
    /// message for a non-zero exit includes the captured output.
    async fn run(&self, command: &str, host: &str, credential: &str) -> Result<String>;
}

/// How to verify the host key presented by a node
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    /// Only connect to hosts whose SHA-256 fingerprint is pinned
    Pinned(HashMap<String, String>),
    /// Accept any host key. Lab use only; must be opted into explicitly.
    AcceptAny,
}

impl HostKeyPolicy {
    fn verify(&self, host: &str, fingerprint: &str) -> Result<()> {
        match self {
            HostKeyPolicy::AcceptAny => {
                warn!(host, "host key verification disabled by configuration");
                Ok(())
            }
            HostKeyPolicy::Pinned(pins) => match pins.get(host) {
                Some(expected) if expected.eq_ignore_ascii_case(fingerprint) => Ok(()),
                Some(_) => Err(Error::remote(format!(
                    "host key mismatch for {host}: presented fingerprint {fingerprint}"
                ))),
                None => Err(Error::remote(format!(
                    "no pinned host key for {host}; pin its fingerprint or opt into accept-any"
                ))),
            },
        }
    }
}

/// SSH-backed [`RemoteRunner`]
///
/// Each call opens a fresh session. The blocking ssh2 work runs on the
/// tokio blocking pool so watchers and other tasks keep making progress.
pub struct SshRunner {
    policy: HostKeyPolicy,
    connect_timeout: Duration,
}

impl SshRunner {
    /// Create a runner with the given host-key policy
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn run_blocking(
        policy: &HostKeyPolicy,
        connect_timeout: Duration,
        command: &str,
        host: &str,
        credential: &str,
    ) -> Result<String> {
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host, SSH_PORT))
            .map_err(|e| Error::remote(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| Error::remote(format!("cannot resolve {host}")))?;

        let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| Error::remote(format!("connect to {host} failed: {e}")))?;

        let mut session = Session::new().map_err(|e| Error::remote(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::remote(format!("handshake with {host} failed: {e}")))?;

        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(hex_fingerprint)
            .ok_or_else(|| Error::remote(format!("{host} presented no host key")))?;
        policy.verify(host, &fingerprint)?;

        session
            .userauth_password(SSH_USER, credential)
            .map_err(|e| Error::remote(format!("authentication to {host} failed: {e}")))?;

        let mut channel = session
            .channel_session()
            .map_err(|e| Error::remote(e.to_string()))?;
        channel
            .exec(command)
            .map_err(|e| Error::remote(format!("exec on {host} failed: {e}")))?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| Error::remote(format!("reading output from {host} failed: {e}")))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| Error::remote(format!("reading stderr from {host} failed: {e}")))?;
        output.push_str(&stderr);

        channel
            .wait_close()
            .map_err(|e| Error::remote(e.to_string()))?;
        let status = channel
            .exit_status()
            .map_err(|e| Error::remote(e.to_string()))?;

        if status != 0 {
            return Err(Error::remote(format!(
                "command on {host} exited with status {status}: {output}"
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl RemoteRunner for SshRunner {
    async fn run(&self, command: &str, host: &str, credential: &str) -> Result<String> {
        debug!(host, "running remote command");
        let policy = self.policy.clone();
        let timeout = self.connect_timeout;
        let command = command.to_string();
        let host = host.to_string();
        let credential = credential.to_string();

        tokio::task::spawn_blocking(move || {
            Self::run_blocking(&policy, timeout, &command, &host, &credential)
        })
        .await
        .map_err(|e| Error::remote(format!("ssh task panicked: {e}")))?
    }
}

fn hex_fingerprint(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
