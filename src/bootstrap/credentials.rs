//! Join-credential extraction from kubeadm output
//!
//! `kubeadm init` prints the join command for additional nodes into its
//! free-text output. The token and discovery hash are mandatory for any
//! join; the certificate key is only present (and only needed) for
//! control-plane joins. Extraction must tolerate surrounding log noise
//! and must fail loudly when a mandatory pattern is missing, since a
//! join issued with empty credentials cannot succeed.

use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

/// Ephemeral credentials authorizing nodes to join a new control plane
///
/// Produced from the first master's init output, consumed by the join
/// commands, and dropped when the bootstrap sequence ends. Never
/// persisted; Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredentials {
    /// Bootstrap token (`<id>.<secret>`)
    token: String,
    /// Discovery CA certificate hash (`<alg>:<hex>`)
    discovery_hash: String,
    /// Certificate key for control-plane joins, when uploaded
    certificate_key: Option<String>,
}

impl JoinCredentials {
    /// Parse credentials out of combined kubeadm init output.
    ///
    /// Fails with [`Error::Extraction`] when the token or discovery hash
    /// cannot be found. A missing certificate key is tolerated here;
    /// [`JoinCredentials::certificate_key`] surfaces the error when a
    /// control-plane join actually needs it.
    pub fn extract(output: &str) -> Result<Self> {
        let token = capture(token_re(), output).ok_or_else(|| {
            Error::extraction("join token not found in cluster-init output")
        })?;
        let discovery_hash = capture(hash_re(), output).ok_or_else(|| {
            Error::extraction("discovery CA cert hash not found in cluster-init output")
        })?;
        let certificate_key = capture(cert_key_re(), output);

        Ok(Self {
            token,
            discovery_hash,
            certificate_key,
        })
    }

    /// The bootstrap token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The discovery CA certificate hash
    pub fn discovery_hash(&self) -> &str {
        &self.discovery_hash
    }

    /// The certificate key, required for control-plane joins
    pub fn certificate_key(&self) -> Result<&str> {
        self.certificate_key.as_deref().ok_or_else(|| {
            Error::extraction(
                "certificate key not found in cluster-init output; \
                 cannot join additional control-plane nodes",
            )
        })
    }

    /// Arguments shared by every join command
    pub fn join_args(&self) -> String {
        format!(
            "--token {} --discovery-token-ca-cert-hash {}",
            self.token, self.discovery_hash
        )
    }
}

impl std::fmt::Debug for JoinCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs; lengths are enough for debugging
        f.debug_struct("JoinCredentials")
            .field("token_len", &self.token.len())
            .field("discovery_hash_len", &self.discovery_hash.len())
            .field("has_certificate_key", &self.certificate_key.is_some())
            .finish()
    }
}

fn capture(re: &Regex, output: &str) -> Option<String> {
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--token\s+([0-9a-z]+\.[0-9a-z]+)").expect("valid regex"))
}

fn hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"--discovery-token-ca-cert-hash\s+(\w+:[0-9a-fA-F]+)").expect("valid regex")
    })
}

fn cert_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--certificate-key\s+([0-9a-fA-F]+)").expect("valid regex"))
}
