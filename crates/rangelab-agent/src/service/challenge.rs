// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Challenge instance operations.
//!
//! Every instance is one deployment in the lab's namespace with a fixed
//! IP from the lab's child CIDR. The instance's DNS records travel in the
//! `recordsList` label so deletion can recover them without reading state
//! elsewhere.

use std::sync::Arc;

use tracing::{debug, warn};

use super::ChallengeInfrastructure;
use crate::error::{Error, MultiError, Result};
use crate::kubernetes::labels;
use crate::model::{ChallengeConfig, DeploymentConfig, DnsRecord, Lab};

/// Deploys, deletes and scales challenge instances.
pub struct ChallengeService {
    infrastructure: Arc<dyn ChallengeInfrastructure>,
}

impl ChallengeService {
    pub fn new(infrastructure: Arc<dyn ChallengeInfrastructure>) -> Self {
        Self { infrastructure }
    }

    /// Create every instance of the challenge in the lab. Per-instance
    /// failures are collected; the records of the instances that were
    /// created are returned with type-`A` data filled from the acquired
    /// addresses.
    pub async fn create_challenge(
        &self,
        lab: &Lab,
        config: ChallengeConfig,
    ) -> (Vec<DnsRecord>, MultiError) {
        let lab_id = lab.id.to_string();
        let dns_ip = lab.child.first_ip();

        let mut records = Vec::new();
        let mut errs = MultiError::new();

        for instance in config.instances {
            let exists = match self
                .infrastructure
                .deployment_exists(&instance.id, &lab_id)
                .await
            {
                Ok(exists) => exists,
                Err(e) => {
                    errs.push(Error::challenge(
                        &lab_id,
                        &config.id,
                        Some(instance.id.clone()),
                        "failed to check if instance exists",
                        Some(e),
                    ));
                    continue;
                }
            };
            if exists {
                errs.push(Error::challenge(
                    &lab_id,
                    &config.id,
                    Some(instance.id.clone()),
                    "instance already exists",
                    None,
                ));
                continue;
            }

            let ip = match lab.child.acquire_single_ip(None).await {
                Ok(ip) => ip,
                Err(e) => {
                    errs.push(Error::challenge(
                        &lab_id,
                        &config.id,
                        Some(instance.id.clone()),
                        "failed to acquire instance address",
                        Some(e.into()),
                    ));
                    continue;
                }
            };

            let deployment = DeploymentConfig {
                name: instance.id.clone(),
                lab_id: lab_id.clone(),
                labels: [
                    (labels::PLATFORM.to_string(), labels::CHALLENGE.to_string()),
                    (labels::LAB_ID.to_string(), lab_id.clone()),
                    (labels::CHALLENGE_ID.to_string(), config.id.clone()),
                    (labels::INSTANCE_ID.to_string(), instance.id.clone()),
                    (
                        labels::RECORDS_LIST.to_string(),
                        DnsRecord::encode_list(&instance.records),
                    ),
                ]
                .into(),
                image: instance.image.clone(),
                ip: Some(ip),
                dns_server: Some(dns_ip),
                use_public_dns: true,
                resources: instance.resources,
                envs: instance.envs.clone(),
                ..Default::default()
            };

            if let Err(e) = self.infrastructure.apply_deployment(deployment).await {
                errs.push(Error::challenge(
                    &lab_id,
                    &config.id,
                    Some(instance.id.clone()),
                    "failed to apply instance deployment",
                    Some(e),
                ));
                if let Err(release_err) = lab.child.release_single_ip(ip).await {
                    errs.push(Error::challenge(
                        &lab_id,
                        &config.id,
                        Some(instance.id.clone()),
                        "failed to release instance address",
                        Some(release_err.into()),
                    ));
                }
                continue;
            }

            debug!(lab_id = %lab_id, instance = %instance.id, ip = %ip, "instance created");

            for mut record in instance.records {
                if record.record_type == "A" {
                    record.data = ip.to_string();
                }
                records.push(record);
            }
        }

        (records, errs)
    }

    /// Delete every instance of the challenge: remove the deployment,
    /// release its address and recover its records from the label.
    pub async fn delete_challenge(
        &self,
        lab: &Lab,
        challenge_id: &str,
    ) -> (Vec<DnsRecord>, MultiError) {
        let lab_id = lab.id.to_string();
        let mut records = Vec::new();
        let mut errs = MultiError::new();

        let deployments = match self
            .infrastructure
            .get_deployments_by_selector(&lab_id, &challenge_selector(&lab_id, challenge_id))
            .await
        {
            Ok(deployments) => deployments,
            Err(e) => {
                errs.push(Error::challenge(
                    &lab_id,
                    challenge_id,
                    None,
                    "failed to list instances",
                    Some(e),
                ));
                return (records, errs);
            }
        };

        for deployment in deployments {
            if let Err(e) = self
                .infrastructure
                .delete_deployment(&deployment.name, &lab_id)
                .await
            {
                errs.push(Error::challenge(
                    &lab_id,
                    challenge_id,
                    Some(deployment.name.clone()),
                    "failed to delete instance deployment",
                    Some(e),
                ));
            }

            match deployment.ip.parse() {
                Ok(ip) => {
                    if let Err(e) = lab.child.release_single_ip(ip).await {
                        errs.push(Error::challenge(
                            &lab_id,
                            challenge_id,
                            Some(deployment.name.clone()),
                            "failed to release instance address",
                            Some(e.into()),
                        ));
                    }
                }
                Err(_) => {
                    warn!(
                        lab_id = %lab_id,
                        instance = %deployment.name,
                        ip = %deployment.ip,
                        "instance has no usable address annotation"
                    );
                }
            }

            if let Some(encoded) = deployment.labels.get(labels::RECORDS_LIST) {
                records.extend(DnsRecord::decode_list(encoded));
            }
        }

        (records, errs)
    }

    /// Scale every instance of the challenge to one replica.
    pub async fn start_challenge(&self, lab_id: &str, challenge_id: &str) -> Result<()> {
        self.scale_challenge(lab_id, challenge_id, 1).await
    }

    /// Scale every instance of the challenge to zero replicas.
    pub async fn stop_challenge(&self, lab_id: &str, challenge_id: &str) -> Result<()> {
        self.scale_challenge(lab_id, challenge_id, 0).await
    }

    /// Scale every instance of the challenge to zero, then back to one.
    pub async fn reset_challenge(&self, lab_id: &str, challenge_id: &str) -> Result<()> {
        let deployments = self
            .infrastructure
            .get_deployments_by_selector(lab_id, &challenge_selector(lab_id, challenge_id))
            .await
            .map_err(|e| {
                Error::challenge(lab_id, challenge_id, None, "failed to list instances", Some(e))
            })?;

        let mut errs = MultiError::new();
        for deployment in deployments {
            if let Err(e) = self
                .infrastructure
                .reset_deployment(&deployment.name, lab_id)
                .await
            {
                errs.push(Error::challenge(
                    lab_id,
                    challenge_id,
                    Some(deployment.name),
                    "failed to reset instance deployment",
                    Some(e),
                ));
            }
        }
        errs.into_result()
    }

    async fn scale_challenge(&self, lab_id: &str, challenge_id: &str, replicas: i32) -> Result<()> {
        let deployments = self
            .infrastructure
            .get_deployments_by_selector(lab_id, &challenge_selector(lab_id, challenge_id))
            .await
            .map_err(|e| {
                Error::challenge(lab_id, challenge_id, None, "failed to list instances", Some(e))
            })?;

        let mut errs = MultiError::new();
        for deployment in deployments {
            if let Err(e) = self
                .infrastructure
                .scale_deployment(&deployment.name, lab_id, replicas)
                .await
            {
                errs.push(Error::challenge(
                    lab_id,
                    challenge_id,
                    Some(deployment.name),
                    "failed to scale instance deployment",
                    Some(e),
                ));
            }
        }
        errs.into_result()
    }
}

fn challenge_selector(lab_id: &str, challenge_id: &str) -> Vec<String> {
    vec![
        format!("{}={}", labels::PLATFORM, labels::CHALLENGE),
        format!("{}={}", labels::LAB_ID, lab_id),
        format!("{}={}", labels::CHALLENGE_ID, challenge_id),
    ]
}
