// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-lab authoritative DNS.
//!
//! Each lab runs a CoreDNS server at the child CIDR's first address. The
//! Corefile and zone live in a config map mounted into the pod; CoreDNS
//! reloads on file change, so record updates never restart the pod. The
//! current record set is carried in the config map next to the zone and
//! is the source of truth for refreshes.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::info;

use super::DnsInfrastructure;
use crate::error::{Error, MultiError, Result};
use crate::kubernetes::labels;
use crate::model::{DeploymentConfig, DnsRecord, Mount, ResourceSpec, ResourcesSpec, Volume};

const DNS_NAME: &str = "dns-server";
const DNS_CONFIG_NAME: &str = "dns-config";

const IMAGE: &str = "coredns/coredns:1.10.0";

const CORE_FILE: &str = "Corefile";
const ZONE_FILE: &str = "zonefile";
const SERIAL_KEY: &str = "serial";

const CONFIG_MOUNT_PATH: &str = "/etc/coredns";

const CORE_FILE_CONTENT: &str = r#". {
    file /etc/coredns/zonefile
    reload 2s
    errors
    log
}
"#;

const ZONE_TEMPLATE: &str = r#"$ORIGIN .
@   3600 IN SOA ns.invalid. hostmaster.invalid. (
                {{ serial }} ; serial
                7200       ; refresh (2 hours)
                3600       ; retry (1 hour)
                1209600    ; expire (2 weeks)
                3600       ; minimum (1 hour)
                )

{% for record in records %}{{ record.name }} IN {{ record.type }} {{ record.data }}
{% endfor %}"#;

/// Generates and applies per-lab zones and the DNS deployment.
pub struct DnsService {
    infrastructure: Arc<dyn DnsInfrastructure>,
}

impl DnsService {
    pub fn new(infrastructure: Arc<dyn DnsInfrastructure>) -> Self {
        Self { infrastructure }
    }

    /// Create the lab's DNS server: config map with an empty zone, then
    /// the CoreDNS deployment pinned to `ip`.
    pub async fn create_dns_server(&self, lab_id: &str, ip: Ipv4Addr) -> Result<()> {
        self.set_config(lab_id, &[], next_serial(0)).await?;

        let resources = ResourceSpec {
            cpu_millis: 10,
            memory_bytes: 50 * 1024 * 1024,
        };

        self.infrastructure
            .apply_deployment(DeploymentConfig {
                name: DNS_NAME.to_string(),
                lab_id: lab_id.to_string(),
                image: IMAGE.to_string(),
                ip: Some(ip),
                labels: [
                    (
                        labels::PLATFORM.to_string(),
                        labels::LAB_DNS_SERVER.to_string(),
                    ),
                    (labels::LAB_ID.to_string(), lab_id.to_string()),
                ]
                .into(),
                resources: ResourcesSpec {
                    requests: resources,
                    limits: resources,
                },
                args: vec![
                    "-conf".to_string(),
                    format!("{CONFIG_MOUNT_PATH}/{CORE_FILE}"),
                ],
                volumes: vec![Volume {
                    name: DNS_NAME.to_string(),
                    config_map_name: DNS_CONFIG_NAME.to_string(),
                    mounts: vec![Mount {
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        sub_path: None,
                    }],
                }],
                ..Default::default()
            })
            .await
            .map_err(|e| Error::dns(lab_id, "failed to apply DNS deployment", Some(e)))?;

        info!(lab_id, ip = %ip, "DNS server created");
        Ok(())
    }

    /// Union (`add = true`) or difference (`add = false`) the given
    /// records into the lab zone, re-render it and re-apply the config
    /// map. The SOA serial strictly increases across updates.
    pub async fn refresh_dns_records(
        &self,
        lab_id: &str,
        records: Vec<DnsRecord>,
        add: bool,
    ) -> Result<()> {
        let data = self
            .infrastructure
            .get_config_map_data(DNS_CONFIG_NAME, lab_id)
            .await
            .map_err(|e| Error::dns(lab_id, "failed to read DNS config", Some(e)))?;

        let mut current = data
            .get(labels::RECORDS_LIST)
            .map(|encoded| DnsRecord::decode_list(encoded))
            .unwrap_or_default();
        let previous_serial = data
            .get(SERIAL_KEY)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let errs = if add {
            add_records(&mut current, &records)
        } else {
            delete_records(&mut current, &records)
        };
        if let Err(e) = errs.into_result() {
            return Err(Error::dns(lab_id, "failed to update records", Some(e)));
        }

        self.set_config(lab_id, &current, next_serial(previous_serial))
            .await
    }

    async fn set_config(&self, lab_id: &str, records: &[DnsRecord], serial: i64) -> Result<()> {
        let zone = render_zone(serial, records)
            .map_err(|e| Error::dns(lab_id, format!("failed to render zone: {e}"), None))?;

        let mut data = BTreeMap::new();
        data.insert(CORE_FILE.to_string(), CORE_FILE_CONTENT.to_string());
        data.insert(ZONE_FILE.to_string(), zone);
        data.insert(
            labels::RECORDS_LIST.to_string(),
            DnsRecord::encode_list(records),
        );
        data.insert(SERIAL_KEY.to_string(), serial.to_string());

        self.infrastructure
            .apply_config_map(DNS_CONFIG_NAME, lab_id, data)
            .await
            .map_err(|e| Error::dns(lab_id, "failed to apply DNS config", Some(e)))
    }
}

/// Render the zone file for the given serial and records.
fn render_zone(serial: i64, records: &[DnsRecord]) -> std::result::Result<String, minijinja::Error> {
    let mut env = minijinja::Environment::new();
    env.add_template("zone", ZONE_TEMPLATE)?;

    let records: Vec<minijinja::Value> = records
        .iter()
        .map(|r| {
            minijinja::Value::from_serialize(serde_json::json!({
                "name": r.name,
                "type": r.record_type,
                "data": r.data,
            }))
        })
        .collect();

    env.get_template("zone")?
        .render(minijinja::context! { serial => serial, records => records })
}

/// Next SOA serial: wall-clock seconds, bumped past the previous value so
/// two updates inside one second still increase it.
fn next_serial(previous: i64) -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    now.max(previous + 1)
}

/// Add records to the set. A duplicate `(name, type, data)` is an error;
/// the remaining records are still applied.
fn add_records(current: &mut Vec<DnsRecord>, records: &[DnsRecord]) -> MultiError {
    let mut errs = MultiError::new();

    for record in records {
        if current.contains(record) {
            errs.push(Error::InvalidArgument(format!(
                "record {} IN {} {} already exists",
                record.name, record.record_type, record.data
            )));
        } else {
            current.push(record.clone());
        }
    }

    errs
}

/// Remove records from the set; identity for delete-intent is
/// `(name, type)`. A record that matches nothing is an error.
fn delete_records(current: &mut Vec<DnsRecord>, records: &[DnsRecord]) -> MultiError {
    let mut errs = MultiError::new();

    for record in records {
        let before = current.len();
        current.retain(|existing| {
            !(existing.name == record.name && existing.record_type == record.record_type)
        });
        if current.len() == before {
            errs.push(Error::InvalidArgument(format!(
                "record {} IN {} does not exist",
                record.name, record.record_type
            )));
        }
    }

    errs
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
    fn zone_renders_soa_and_records() {
        let records = vec![
            record("A", "web.lab.local", "128.0.0.5"),
            record("TXT", "info.lab.local", "hello"),
        ];
        let zone = render_zone(1748000000, &records).unwrap();

        assert!(zone.contains("1748000000 ; serial"));
        assert!(zone.contains("web.lab.local IN A 128.0.0.5"));
        assert!(zone.contains("info.lab.local IN TXT hello"));
    }

    #[test]
    fn empty_zone_renders() {
        let zone = render_zone(1, &[]).unwrap();
        assert!(zone.contains("SOA"));
        assert!(!zone.contains(" IN A "));
    }

    #[test]
    fn serial_strictly_increases() {
        let first = next_serial(0);
        let second = next_serial(first);
        let third = next_serial(second);
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn add_rejects_duplicate_triples() {
        let mut current = vec![record("A", "web.lab.local", "128.0.0.5")];

        let errs = add_records(&mut current, &[record("A", "web.lab.local", "128.0.0.5")]);
        assert_eq!(errs.len(), 1);
        assert_eq!(current.len(), 1);

        // Same (name, type) with different data is a distinct record
        let errs = add_records(&mut current, &[record("A", "web.lab.local", "128.0.0.6")]);
        assert!(errs.is_empty());
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn add_applies_remaining_records_past_a_duplicate() {
        let mut current = vec![record("A", "web.lab.local", "128.0.0.5")];
        let errs = add_records(
            &mut current,
            &[
                record("A", "web.lab.local", "128.0.0.5"),
                record("A", "db.lab.local", "128.0.0.6"),
            ],
        );
        assert_eq!(errs.len(), 1);
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn delete_matches_on_name_and_type() {
        let mut current = vec![
            record("A", "web.lab.local", "128.0.0.5"),
            record("TXT", "web.lab.local", "hello"),
        ];

        let errs = delete_records(&mut current, &[record("A", "web.lab.local", "ignored")]);
        assert!(errs.is_empty());
        assert_eq!(current, vec![record("TXT", "web.lab.local", "hello")]);
    }

    #[test]
    fn delete_of_missing_record_is_an_error() {
        let mut current = vec![record("A", "web.lab.local", "128.0.0.5")];
        let errs = delete_records(&mut current, &[record("A", "gone.lab.local", "")]);
        assert_eq!(errs.len(), 1);
        assert_eq!(current.len(), 1);
    }
}
