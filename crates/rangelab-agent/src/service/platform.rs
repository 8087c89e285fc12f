// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status collector: joins the catalog with platform deployments and pod
//! metrics into a per-lab status view. One listing round trip for the
//! deployments and one for the metrics, bucketed by labels.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

use super::PlatformInfrastructure;
use crate::catalog;
use crate::error::{Error, Result};
use crate::kubernetes::labels;
use crate::model::{DnsStatus, InstanceStatus, LabStatus, PodMetrics};

/// Assembles the per-lab status snapshot.
pub struct PlatformService {
    infrastructure: Arc<dyn PlatformInfrastructure>,
    pool: PgPool,
}

impl PlatformService {
    pub fn new(infrastructure: Arc<dyn PlatformInfrastructure>, pool: PgPool) -> Self {
        Self {
            infrastructure,
            pool,
        }
    }

    /// Status of every lab in the catalog.
    pub async fn get_labs_status(&self) -> Result<Vec<LabStatus>> {
        let labs = catalog::list_laboratories(&self.pool)
            .await
            .map_err(|e| Error::platform("failed to list laboratories", e.into()))?;

        let mut by_lab: HashMap<String, LabStatus> = labs
            .into_iter()
            .map(|row| {
                (
                    row.id.to_string(),
                    LabStatus {
                        id: row.id,
                        cidr: row.cidr.to_string(),
                        dns: DnsStatus::default(),
                        instances: Vec::new(),
                    },
                )
            })
            .collect();

        let platform_selector = vec![labels::PLATFORM.to_string()];

        let deployments = self
            .infrastructure
            .get_deployments_by_selector("", &platform_selector)
            .await
            .map_err(|e| Error::platform("failed to list platform deployments", e))?;

        let pods = self
            .infrastructure
            .get_pods_metrics("", &platform_selector)
            .await
            .map_err(|e| Error::platform("failed to list platform pod metrics", e))?;

        // Usage samples: challenge pods keyed by instance, DNS pods
        // applied to their lab directly
        let mut usage_by_instance: HashMap<String, PodMetrics> = HashMap::new();
        for pod in pods {
            let platform = pod.labels.get(labels::PLATFORM).cloned();
            match platform.as_deref() {
                Some(labels::CHALLENGE) => {
                    if let Some(instance_id) = pod.labels.get(labels::INSTANCE_ID).cloned() {
                        usage_by_instance.insert(instance_id, pod);
                    }
                }
                Some(labels::LAB_DNS_SERVER) => {
                    if let Some(status) = pod
                        .labels
                        .get(labels::LAB_ID)
                        .and_then(|lab_id| by_lab.get_mut(lab_id))
                    {
                        status.dns.usage = pod.usage;
                    }
                }
                _ => {}
            }
        }

        for deployment in deployments {
            let Some(status) = deployment
                .labels
                .get(labels::LAB_ID)
                .and_then(|lab_id| by_lab.get_mut(lab_id))
            else {
                continue;
            };

            match deployment.labels.get(labels::PLATFORM).map(String::as_str) {
                Some(labels::CHALLENGE) => {
                    let instance_id = deployment
                        .labels
                        .get(labels::INSTANCE_ID)
                        .cloned()
                        .unwrap_or_else(|| deployment.name.clone());
                    status.instances.push(InstanceStatus {
                        usage: usage_by_instance
                            .get(&instance_id)
                            .map(|pod| pod.usage)
                            .unwrap_or_default(),
                        id: instance_id,
                        challenge_id: deployment
                            .labels
                            .get(labels::CHALLENGE_ID)
                            .cloned()
                            .unwrap_or_default(),
                        status: deployment.replicas.status(),
                        reason: deployment.reason,
                    });
                }
                Some(labels::LAB_DNS_SERVER) => {
                    status.dns.status = deployment.replicas.status();
                    status.dns.reason = deployment.reason;
                }
                _ => {}
            }
        }

        Ok(by_lab.into_values().collect())
    }
}
