// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boot-time probe: create a throwaway lab, deploy one challenge into
//! it, then tear everything down. Catches broken orchestrator or
//! database wiring before the agent starts serving.

use tracing::info;
use uuid::Uuid;

use super::Service;
use crate::error::{Error, MultiError, Result};
use crate::model::{ChallengeConfig, DnsRecord, EnvVar, InstanceConfig, ResourceSpec, ResourcesSpec};

const PROBE_MASK: u8 = 26;

impl Service {
    /// Exercise the full lab lifecycle once. Failures after the create
    /// step are collected so cleanup always runs.
    pub async fn self_check(&self) -> Result<()> {
        let lab = self.lab.create_lab(PROBE_MASK, Uuid::nil()).await?;
        let lab_id = lab.id.to_string();

        let mut errs = MultiError::new();

        let quantity = ResourceSpec {
            cpu_millis: 100,
            memory_bytes: 128 * 1024 * 1024,
        };
        let probe_challenge = ChallengeConfig {
            id: "probe-challenge".to_string(),
            instances: vec![InstanceConfig {
                id: "probe-instance".to_string(),
                image: "nginx:latest".to_string(),
                resources: ResourcesSpec {
                    requests: quantity,
                    limits: quantity,
                },
                envs: vec![EnvVar {
                    name: "PROBE_ENV".to_string(),
                    value: "probe".to_string(),
                }],
                records: vec![DnsRecord {
                    record_type: "A".to_string(),
                    name: "probe.lab.internal".to_string(),
                    data: String::new(),
                }],
            }],
        };

        if let Err(e) = self
            .lab
            .add_lab_challenges(&lab_id, vec![probe_challenge])
            .await
        {
            errs.push(Error::platform("probe challenge create failed", e));
        }

        if let Err(e) = self
            .lab
            .delete_lab_challenges(&lab_id, &["probe-challenge".to_string()])
            .await
        {
            errs.push(Error::platform("probe challenge delete failed", e));
        }

        if let Err(e) = self.lab.delete_lab(&lab_id).await {
            errs.push(Error::platform("probe lab delete failed", e));
        }

        errs.into_result()?;

        info!("self check passed");
        Ok(())
    }
}
