// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Business services: lab lifecycle, DNS zones, challenge instances and
//! the status collector.
//!
//! Each service sees the orchestrator through its own narrow trait, and
//! the lab service sees DNS + challenges through the
//! [`DnsChallengeBundle`] capability bundle passed in at construction,
//! so the challenge service never depends back on the lab service.

mod challenge;
mod dns;
mod lab;
mod platform;
mod self_check;

pub use challenge::ChallengeService;
pub use dns::DnsService;
pub use lab::LabService;
pub use platform::PlatformService;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{MultiError, Result};
use crate::ipam::IpamManager;
use crate::kubernetes::Kubernetes;
use crate::model::{
    ChallengeConfig, DeploymentConfig, DeploymentState, DnsRecord, Lab, PodMetrics,
};

/// Orchestrator surface used by the lab service.
#[async_trait]
pub trait LabInfrastructure: Send + Sync {
    async fn apply_network(&self, name: &str, cidr: &str, block_size: u8) -> Result<()>;
    async fn get_network_cidr(&self, name: &str) -> Result<String>;
    async fn delete_network(&self, name: &str) -> Result<()>;

    async fn apply_namespace(&self, name: &str, ip_pool_name: Option<&str>) -> Result<()>;
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn apply_network_policy(&self, lab_id: &str) -> Result<()>;

    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>>;
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()>;
}

/// Orchestrator surface used by the challenge service.
#[async_trait]
pub trait ChallengeInfrastructure: Send + Sync {
    async fn deployment_exists(&self, name: &str, namespace: &str) -> Result<bool>;
    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()>;
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>>;
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()>;
    async fn reset_deployment(&self, name: &str, namespace: &str) -> Result<()>;
    async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<()>;
}

/// Orchestrator surface used by the DNS service.
#[async_trait]
pub trait DnsInfrastructure: Send + Sync {
    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()>;
    async fn apply_config_map(
        &self,
        name: &str,
        lab_id: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
    async fn get_config_map_data(
        &self,
        name: &str,
        lab_id: &str,
    ) -> Result<BTreeMap<String, String>>;
}

/// Orchestrator surface used by the status collector.
#[async_trait]
pub trait PlatformInfrastructure: Send + Sync {
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>>;
    async fn get_pods_metrics(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<PodMetrics>>;
}

#[async_trait]
impl LabInfrastructure for Kubernetes {
    async fn apply_network(&self, name: &str, cidr: &str, block_size: u8) -> Result<()> {
        Kubernetes::apply_network(self, name, cidr, block_size).await
    }
    async fn get_network_cidr(&self, name: &str) -> Result<String> {
        Kubernetes::get_network_cidr(self, name).await
    }
    async fn delete_network(&self, name: &str) -> Result<()> {
        Kubernetes::delete_network(self, name).await
    }
    async fn apply_namespace(&self, name: &str, ip_pool_name: Option<&str>) -> Result<()> {
        Kubernetes::apply_namespace(self, name, ip_pool_name).await
    }
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Kubernetes::namespace_exists(self, name).await
    }
    async fn delete_namespace(&self, name: &str) -> Result<()> {
        Kubernetes::delete_namespace(self, name).await
    }
    async fn apply_network_policy(&self, lab_id: &str) -> Result<()> {
        Kubernetes::apply_network_policy(self, lab_id).await
    }
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        Kubernetes::get_deployments_by_selector(self, namespace, selectors).await
    }
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        Kubernetes::scale_deployment(self, name, namespace, replicas).await
    }
}

#[async_trait]
impl ChallengeInfrastructure for Kubernetes {
    async fn deployment_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        Kubernetes::deployment_exists(self, name, namespace).await
    }
    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()> {
        Kubernetes::apply_deployment(self, config).await
    }
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        Kubernetes::get_deployments_by_selector(self, namespace, selectors).await
    }
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        Kubernetes::scale_deployment(self, name, namespace, replicas).await
    }
    async fn reset_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        Kubernetes::reset_deployment(self, name, namespace).await
    }
    async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        Kubernetes::delete_deployment(self, name, namespace).await
    }
}

#[async_trait]
impl DnsInfrastructure for Kubernetes {
    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()> {
        Kubernetes::apply_deployment(self, config).await
    }
    async fn apply_config_map(
        &self,
        name: &str,
        lab_id: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        Kubernetes::apply_config_map(self, name, lab_id, data).await
    }
    async fn get_config_map_data(
        &self,
        name: &str,
        lab_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        Kubernetes::get_config_map_data(self, name, lab_id).await
    }
}

#[async_trait]
impl PlatformInfrastructure for Kubernetes {
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        Kubernetes::get_deployments_by_selector(self, namespace, selectors).await
    }
    async fn get_pods_metrics(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<PodMetrics>> {
        Kubernetes::get_pods_metrics(self, namespace, selectors).await
    }
}

/// DNS + challenge capabilities the lab service composes over.
#[async_trait]
pub trait DnsChallengeBundle: Send + Sync {
    async fn create_dns_server(&self, lab_id: &str, ip: Ipv4Addr) -> Result<()>;
    async fn refresh_dns_records(
        &self,
        lab_id: &str,
        records: Vec<DnsRecord>,
        add: bool,
    ) -> Result<()>;

    /// Create every instance of the challenge. Returns the finalized
    /// record list of the instances that were created alongside any
    /// per-instance failures.
    async fn create_challenge(
        &self,
        lab: &Lab,
        config: ChallengeConfig,
    ) -> (Vec<DnsRecord>, MultiError);

    /// Delete every instance of the challenge. Returns the records that
    /// must leave the zone alongside any per-instance failures.
    async fn delete_challenge(
        &self,
        lab: &Lab,
        challenge_id: &str,
    ) -> (Vec<DnsRecord>, MultiError);
}

/// Bundle implementation composing the DNS and challenge services.
pub struct ServiceBundle {
    dns: DnsService,
    challenge: Arc<ChallengeService>,
}

impl ServiceBundle {
    pub fn new(dns: DnsService, challenge: Arc<ChallengeService>) -> Self {
        Self { dns, challenge }
    }
}

#[async_trait]
impl DnsChallengeBundle for ServiceBundle {
    async fn create_dns_server(&self, lab_id: &str, ip: Ipv4Addr) -> Result<()> {
        self.dns.create_dns_server(lab_id, ip).await
    }
    async fn refresh_dns_records(
        &self,
        lab_id: &str,
        records: Vec<DnsRecord>,
        add: bool,
    ) -> Result<()> {
        self.dns.refresh_dns_records(lab_id, records, add).await
    }
    async fn create_challenge(
        &self,
        lab: &Lab,
        config: ChallengeConfig,
    ) -> (Vec<DnsRecord>, MultiError) {
        self.challenge.create_challenge(lab, config).await
    }
    async fn delete_challenge(
        &self,
        lab: &Lab,
        challenge_id: &str,
    ) -> (Vec<DnsRecord>, MultiError) {
        self.challenge.delete_challenge(lab, challenge_id).await
    }
}

/// Dependencies for [`Service::new`].
pub struct Dependencies {
    pub pool: PgPool,
    pub ipam: IpamManager,
    pub infrastructure: Arc<Kubernetes>,
}

/// All business services wired together.
pub struct Service {
    /// Lab lifecycle orchestration.
    pub lab: LabService,
    /// Challenge instance operations.
    pub challenge: Arc<ChallengeService>,
    /// Status collector.
    pub platform: PlatformService,
}

impl Service {
    /// Wire up the services over one orchestrator adapter.
    pub fn new(deps: Dependencies) -> Self {
        let challenge = Arc::new(ChallengeService::new(deps.infrastructure.clone()));
        let dns = DnsService::new(deps.infrastructure.clone());
        let bundle = Arc::new(ServiceBundle {
            dns,
            challenge: challenge.clone(),
        });

        let lab = LabService::new(
            deps.infrastructure.clone(),
            deps.ipam,
            deps.pool.clone(),
            bundle,
        );
        let platform = PlatformService::new(deps.infrastructure, deps.pool);

        Self {
            lab,
            challenge,
            platform,
        }
    }

    /// Start every instance of the given challenges in a lab.
    pub async fn start_lab_challenges(
        &self,
        lab_id: &str,
        challenge_ids: &[String],
    ) -> Result<()> {
        let mut errs = MultiError::new();
        for challenge_id in challenge_ids {
            errs.record(self.challenge.start_challenge(lab_id, challenge_id).await);
        }
        errs.into_result()
    }

    /// Stop every instance of the given challenges in a lab.
    pub async fn stop_lab_challenges(&self, lab_id: &str, challenge_ids: &[String]) -> Result<()> {
        let mut errs = MultiError::new();
        for challenge_id in challenge_ids {
            errs.record(self.challenge.stop_challenge(lab_id, challenge_id).await);
        }
        errs.into_result()
    }

    /// Reset (scale to zero, then one) every instance of the given
    /// challenges in a lab.
    pub async fn reset_lab_challenges(&self, lab_id: &str, challenge_ids: &[String]) -> Result<()> {
        let mut errs = MultiError::new();
        for challenge_id in challenge_ids {
            errs.record(self.challenge.reset_challenge(lab_id, challenge_id).await);
        }
        errs.into_result()
    }
}
