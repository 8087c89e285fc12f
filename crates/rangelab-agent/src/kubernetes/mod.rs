// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed facade over the container platform.
//!
//! All platform-managed objects carry the `platform` label plus the
//! identity labels (`labID`, `challengeID`, `instanceID`); `Apply*`
//! operations are server-side-apply upserts keyed by `(namespace, name)`
//! and safe to re-run.

mod config_map;
mod deployment;
mod metrics;
mod namespace;
mod network;
mod network_policy;

pub use network::{IPPool, IPPoolSpec};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ipnetwork::Ipv4Network;
use kube::api::PatchParams;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};

/// Label conventions shared by every platform-managed object.
pub mod labels {
    /// Object-kind label key.
    pub const PLATFORM: &str = "platform";
    /// Lab identity label key.
    pub const LAB_ID: &str = "labID";
    /// Challenge identity label key.
    pub const CHALLENGE_ID: &str = "challengeID";
    /// Instance identity label key.
    pub const INSTANCE_ID: &str = "instanceID";
    /// Encoded DNS record list label key.
    pub const RECORDS_LIST: &str = "recordsList";

    /// `platform` value for lab namespaces.
    pub const LAB: &str = "lab";
    /// `platform` value for lab IP pools.
    pub const LAB_NETWORK: &str = "labNetwork";
    /// `platform` value for lab DNS deployments.
    pub const LAB_DNS_SERVER: &str = "labDNSServer";
    /// `platform` value for lab DNS config maps.
    pub const LAB_DNS_CONFIG: &str = "labDNSConfig";
    /// `platform` value for challenge deployments.
    pub const CHALLENGE: &str = "challenge";
}

const FIELD_MANAGER: &str = "rangelab-agent";

/// Pod selector label key carried by every managed deployment's template.
pub const POD_SELECTOR_LABEL: &str = "lab-instance-id";

/// Kubernetes adapter.
#[derive(Clone)]
pub struct Kubernetes {
    client: kube::Client,
    /// The labs CIDR, excluded from lab egress to block cross-lab
    /// lateral movement.
    pods_cidr: Ipv4Network,
}

impl Kubernetes {
    /// Connect using the given kubeconfig path, falling back to the
    /// inferred (in-cluster) configuration.
    pub async fn new(kube_config_path: Option<&str>, pods_cidr: Ipv4Network) -> Result<Self> {
        let config = match kube_config_path {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path)
                    .map_err(|e| Error::OrchestratorConfig(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &kube::config::KubeConfigOptions::default(),
                )
                .await
                .map_err(|e| Error::OrchestratorConfig(e.to_string()))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::OrchestratorConfig(e.to_string()))?,
        };

        let client = kube::Client::try_from(config)?;

        info!(pods_cidr = %pods_cidr, "Kubernetes client initialized");

        Ok(Self { client, pods_cidr })
    }

    /// Build an adapter from an existing client (tests).
    pub fn from_client(client: kube::Client, pods_cidr: Ipv4Network) -> Self {
        Self { client, pods_cidr }
    }

    pub(crate) fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub(crate) fn pods_cidr(&self) -> Ipv4Network {
        self.pods_cidr
    }

    pub(crate) fn apply_params(&self) -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

/// True when the API error is a 404.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Deterministic pod-selector label value for `(lab, deployment)`.
/// Hashed so arbitrary names stay inside label value constraints, and
/// wrapped in alphanumerics to satisfy the leading/trailing character
/// rule.
pub fn selector_label(values: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.as_bytes());
    }
    let encoded = URL_SAFE_NO_PAD.encode(hasher.finalize());
    format!("A{encoded}A")
}

/// Parse an orchestrator CPU quantity into millicores.
pub(crate) fn parse_cpu_millis(quantity: &str) -> i64 {
    if let Some(value) = quantity.strip_suffix('n') {
        value.parse::<i64>().unwrap_or(0) / 1_000_000
    } else if let Some(value) = quantity.strip_suffix('u') {
        value.parse::<i64>().unwrap_or(0) / 1_000
    } else if let Some(value) = quantity.strip_suffix('m') {
        value.parse::<i64>().unwrap_or(0)
    } else {
        quantity.parse::<f64>().map(|v| (v * 1000.0) as i64).unwrap_or(0)
    }
}

/// Parse an orchestrator memory quantity into bytes.
pub(crate) fn parse_memory_bytes(quantity: &str) -> i64 {
    const UNITS: &[(&str, i64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1_i64 << 40),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    for (suffix, multiplier) in UNITS {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return value.parse::<i64>().unwrap_or(0) * multiplier;
        }
    }
    quantity.parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_label_is_deterministic_and_label_safe() {
        let a = selector_label(&["lab-1", "dns-server"]);
        let b = selector_label(&["lab-1", "dns-server"]);
        assert_eq!(a, b);
        assert!(a.len() <= 63);
        assert!(a.starts_with('A') && a.ends_with('A'));
        assert!(!a.contains('='));

        let c = selector_label(&["lab-2", "dns-server"]);
        assert_ne!(a, c);
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu_millis("250m"), 250);
        assert_eq!(parse_cpu_millis("1"), 1000);
        assert_eq!(parse_cpu_millis("0.5"), 500);
        assert_eq!(parse_cpu_millis("250000000n"), 250);
        assert_eq!(parse_cpu_millis("1500u"), 1);
        assert_eq!(parse_cpu_millis("garbage"), 0);
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory_bytes("52428800"), 52_428_800);
        assert_eq!(parse_memory_bytes("50Mi"), 50 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1Gi"), 1 << 30);
        assert_eq!(parse_memory_bytes("128K"), 128_000);
        assert_eq!(parse_memory_bytes("garbage"), 0);
    }
}
