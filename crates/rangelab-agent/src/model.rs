// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model shared across the agent's services.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use uuid::Uuid;

use crate::ipam::ChildCidr;

/// A provisioned laboratory: one namespace, one IP pool, one network
/// policy, one DNS deployment and any number of challenge deployments.
#[derive(Debug, Clone)]
pub struct Lab {
    /// Lab identity; also the namespace and IP-pool name.
    pub id: Uuid,
    /// Manager for the lab's child CIDR.
    pub child: ChildCidr,
}

impl Lab {
    /// The lab's child CIDR.
    pub fn cidr(&self) -> ipnetwork::Ipv4Network {
        self.child.cidr()
    }
}

/// A challenge deployed into a lab: a group of related instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeConfig {
    pub id: String,
    pub instances: Vec<InstanceConfig>,
}

/// A single deployment within a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub id: String,
    pub image: String,
    pub resources: ResourcesSpec,
    pub envs: Vec<EnvVar>,
    pub records: Vec<DnsRecord>,
}

/// Requests and limits for one container. CPU is millicores, memory is
/// bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcesSpec {
    pub requests: ResourceSpec,
    pub limits: ResourceSpec,
}

/// One resource quantity pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceSpec {
    /// True when neither quantity is set.
    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }
}

/// Container environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A DNS record in a lab zone. For type `A` the data is the instance IP,
/// filled at create time from the acquired address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub record_type: String,
    pub name: String,
    pub data: String,
}

const RECORD_SEPARATOR: &str = "---";
const FIELD_SEPARATOR: &str = "___";

impl DnsRecord {
    /// Serialize records into the single-label wire form: records joined by
    /// `---`, fields joined by `___`, empty trailing segments stripped.
    pub fn encode_list(records: &[DnsRecord]) -> String {
        records
            .iter()
            .map(|r| {
                let mut joined = [r.record_type.as_str(), r.name.as_str(), r.data.as_str()]
                    .join(FIELD_SEPARATOR);
                while joined.ends_with(FIELD_SEPARATOR) {
                    joined.truncate(joined.len() - FIELD_SEPARATOR.len());
                }
                joined
            })
            .collect::<Vec<_>>()
            .join(RECORD_SEPARATOR)
    }

    /// Parse the single-label wire form back into records.
    pub fn decode_list(encoded: &str) -> Vec<DnsRecord> {
        if encoded.is_empty() {
            return Vec::new();
        }

        encoded
            .split(RECORD_SEPARATOR)
            .map(|item| {
                let mut fields = item.split(FIELD_SEPARATOR);
                DnsRecord {
                    record_type: fields.next().unwrap_or_default().to_string(),
                    name: fields.next().unwrap_or_default().to_string(),
                    data: fields.next().unwrap_or_default().to_string(),
                }
            })
            .collect()
    }
}

/// Per-(lab, challenge, instance) flag environment variable merged into
/// the instance env list before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagEnvVariable {
    pub lab_id: Uuid,
    pub challenge_id: String,
    pub instance_id: String,
    pub variable: String,
    pub flag: String,
}

/// Derived deployment status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[repr(i32)]
pub enum DeploymentStatus {
    #[default]
    Unknown = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Error = 5,
}

/// Replica counters reported by the orchestrator for one deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replicas {
    pub total: i32,
    pub ready: i32,
    pub available: i32,
    pub unavailable: i32,
}

impl Replicas {
    /// Derive the deployment status from the counters.
    pub fn status(&self) -> DeploymentStatus {
        let Replicas {
            total: t,
            ready: r,
            available: a,
            unavailable: u,
        } = *self;

        if t == 0 && r == 0 && a == 0 && u == 0 {
            DeploymentStatus::Stopped
        } else if t > r || t > a {
            DeploymentStatus::Starting
        } else if t == r && r == a && u == 0 {
            DeploymentStatus::Running
        } else if t < r || t < a {
            DeploymentStatus::Stopping
        } else if t != r && u > 0 {
            DeploymentStatus::Error
        } else {
            DeploymentStatus::Unknown
        }
    }
}

/// One deployment as listed from the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    pub name: String,
    pub ip: String,
    pub labels: BTreeMap<String, String>,
    pub replicas: Replicas,
    pub reason: String,
}

/// Per-pod usage sample.
#[derive(Debug, Clone, Default)]
pub struct PodMetrics {
    pub labels: BTreeMap<String, String>,
    pub usage: ResourceSpec,
}

/// Everything needed to apply one deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentConfig {
    pub name: String,
    pub lab_id: String,
    pub labels: BTreeMap<String, String>,
    /// Defaults to 1 when left at 0.
    pub replica_count: i32,
    pub image: String,
    /// Fixed pod address inside the lab's child CIDR.
    pub ip: Option<Ipv4Addr>,
    /// Lab DNS server injected as the pod's only nameserver.
    pub dns_server: Option<Ipv4Addr>,
    /// Also add a public resolver behind the lab DNS.
    pub use_public_dns: bool,
    pub resources: ResourcesSpec,
    pub envs: Vec<EnvVar>,
    pub args: Vec<String>,
    pub volumes: Vec<Volume>,
    pub privileged: bool,
    pub cap_adds: Vec<String>,
    pub readiness_probe: Option<Probe>,
}

/// Config-map backed volume with its mounts.
#[derive(Debug, Clone, Default)]
pub struct Volume {
    pub name: String,
    pub config_map_name: String,
    pub mounts: Vec<Mount>,
}

/// A single volume mount.
#[derive(Debug, Clone, Default)]
pub struct Mount {
    pub mount_path: String,
    pub sub_path: Option<String>,
}

/// Exec readiness probe.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub cmd: Vec<String>,
    pub period_seconds: i32,
}

/// Status view of one lab, assembled by the status collector.
#[derive(Debug, Clone)]
pub struct LabStatus {
    pub id: Uuid,
    pub cidr: String,
    pub dns: DnsStatus,
    pub instances: Vec<InstanceStatus>,
}

/// DNS deployment status inside a lab.
#[derive(Debug, Clone, Default)]
pub struct DnsStatus {
    pub status: DeploymentStatus,
    pub reason: String,
    pub usage: ResourceSpec,
}

/// Challenge instance status inside a lab.
#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    pub id: String,
    pub challenge_id: String,
    pub status: DeploymentStatus,
    pub reason: String,
    pub usage: ResourceSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(t: &str, n: &str, d: &str) -> DnsRecord {
        DnsRecord {
            record_type: t.to_string(),
            name: n.to_string(),
            data: d.to_string(),
        }
    }

    #[test]
    fn records_list_round_trip() {
        let records = vec![
            record("A", "web.lab.local", "128.0.0.5"),
            record("CNAME", "www.lab.local", "web.lab.local"),
            record("TXT", "info.lab.local", "hello"),
        ];
        let encoded = DnsRecord::encode_list(&records);
        assert_eq!(DnsRecord::decode_list(&encoded), records);
    }

    #[test]
    fn empty_data_segment_is_stripped_and_restored() {
        let records = vec![record("A", "web.lab.local", "")];
        let encoded = DnsRecord::encode_list(&records);
        assert_eq!(encoded, "A___web.lab.local");
        assert_eq!(DnsRecord::decode_list(&encoded), records);
    }

    #[test]
    fn empty_list_round_trips() {
        assert_eq!(DnsRecord::encode_list(&[]), "");
        assert!(DnsRecord::decode_list("").is_empty());
    }

    #[test]
    fn status_all_zero_is_stopped() {
        assert_eq!(Replicas::default().status(), DeploymentStatus::Stopped);
        assert_eq!(Replicas::default().status().to_string(), "Stopped");
    }

    #[test]
    fn status_scale_up_is_starting() {
        let replicas = Replicas {
            total: 1,
            ready: 0,
            available: 0,
            unavailable: 1,
        };
        assert_eq!(replicas.status(), DeploymentStatus::Starting);
    }

    #[test]
    fn status_converged_is_running() {
        let replicas = Replicas {
            total: 1,
            ready: 1,
            available: 1,
            unavailable: 0,
        };
        assert_eq!(replicas.status(), DeploymentStatus::Running);
    }

    #[test]
    fn status_scale_down_is_stopping() {
        let replicas = Replicas {
            total: 0,
            ready: 1,
            available: 1,
            unavailable: 0,
        };
        assert_eq!(replicas.status(), DeploymentStatus::Stopping);
    }

    #[test]
    fn status_converged_with_unavailable_is_unknown() {
        let replicas = Replicas {
            total: 1,
            ready: 1,
            available: 1,
            unavailable: 1,
        };
        assert_eq!(replicas.status(), DeploymentStatus::Unknown);
    }
}
