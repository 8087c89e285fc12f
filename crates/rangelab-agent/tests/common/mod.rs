// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test helpers: an in-memory orchestrator double and database
//! setup for the env-gated Postgres tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rangelab_agent::error::{Error, Result};
use rangelab_agent::model::{
    DeploymentConfig, DeploymentState, PodMetrics, Replicas,
};
use rangelab_agent::service::{
    ChallengeInfrastructure, DnsInfrastructure, LabInfrastructure, PlatformInfrastructure,
};

/// Skip test if the test database URL is not set
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Connect to the test database and ensure the schema exists.
pub async fn get_pool() -> Option<sqlx::PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = sqlx::PgPool::connect(&database_url).await.ok()?;
    rangelab_agent::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Drop all state under a test parent CIDR so re-runs start clean.
/// Each test uses its own parent, which keeps parallel tests apart.
pub async fn reset_parent(pool: &sqlx::PgPool, parent: &str) {
    sqlx::query("DELETE FROM ipam_parents WHERE cidr = $1::cidr")
        .bind(parent)
        .execute(pool)
        .await
        .expect("reset ipam parent");
    sqlx::query("DELETE FROM laboratory WHERE cidr <<= $1::cidr")
        .bind(parent)
        .execute(pool)
        .await
        .expect("reset laboratory rows");
}

#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    pub config: DeploymentConfig,
    pub replicas: i32,
}

/// In-memory orchestrator state.
#[derive(Debug, Default)]
pub struct MockState {
    /// IP pools: name -> (cidr, block size)
    pub networks: BTreeMap<String, (String, u8)>,
    pub namespaces: BTreeSet<String>,
    pub policies: BTreeSet<String>,
    /// Deployments keyed by (namespace, name)
    pub deployments: BTreeMap<(String, String), DeploymentRecord>,
    /// Config maps keyed by (namespace, name)
    pub config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    pub metrics: Vec<PodMetrics>,
    /// Operation name that fails on its next invocation
    pub fail_on: Option<&'static str>,
}

/// Orchestrator double implementing every infrastructure seam.
#[derive(Debug, Default)]
pub struct MockInfrastructure {
    pub state: Mutex<MockState>,
}

impl MockInfrastructure {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().unwrap().fail_on = Some(operation);
    }

    fn check_fail(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_on == Some(operation) {
            state.fail_on = None;
            return Err(Error::Transport(format!("injected {operation} failure")));
        }
        Ok(())
    }

    pub fn namespace_names(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().namespaces.clone()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<DeploymentRecord> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Simulate an externally deleted namespace (restore tests).
    pub fn wipe_namespace(&self, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        state.namespaces.remove(namespace);
        state.policies.remove(namespace);
        state.deployments.retain(|(ns, _), _| ns != namespace);
        state.config_maps.retain(|(ns, _), _| ns != namespace);
    }

    fn list_deployments(&self, namespace: &str, selectors: &[String]) -> Vec<DeploymentState> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .iter()
            .filter(|((ns, _), _)| namespace.is_empty() || ns == namespace)
            .filter(|(_, record)| selectors.iter().all(|s| matches_selector(&record.config, s)))
            .map(|(_, record)| DeploymentState {
                name: record.config.name.clone(),
                ip: record
                    .config
                    .ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_default(),
                labels: record.config.labels.clone(),
                replicas: Replicas {
                    total: record.replicas,
                    ready: record.replicas,
                    available: record.replicas,
                    unavailable: 0,
                },
                reason: String::new(),
            })
            .collect()
    }
}

fn matches_selector(config: &DeploymentConfig, selector: &str) -> bool {
    match selector.split_once('=') {
        Some((key, value)) => config.labels.get(key).map(String::as_str) == Some(value),
        None => config.labels.contains_key(selector),
    }
}

#[async_trait]
impl LabInfrastructure for MockInfrastructure {
    async fn apply_network(&self, name: &str, cidr: &str, block_size: u8) -> Result<()> {
        self.check_fail("apply_network")?;
        self.state
            .lock()
            .unwrap()
            .networks
            .entry(name.to_string())
            .or_insert((cidr.to_string(), block_size));
        Ok(())
    }

    async fn get_network_cidr(&self, name: &str) -> Result<String> {
        self.check_fail("get_network_cidr")?;
        self.state
            .lock()
            .unwrap()
            .networks
            .get(name)
            .map(|(cidr, _)| cidr.clone())
            .ok_or_else(|| Error::Transport(format!("network {name} not found")))
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.check_fail("delete_network")?;
        self.state.lock().unwrap().networks.remove(name);
        Ok(())
    }

    async fn apply_namespace(&self, name: &str, _ip_pool_name: Option<&str>) -> Result<()> {
        self.check_fail("apply_namespace")?;
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        self.check_fail("namespace_exists")?;
        Ok(self.state.lock().unwrap().namespaces.contains(name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.check_fail("delete_namespace")?;
        self.wipe_namespace(name);
        Ok(())
    }

    async fn apply_network_policy(&self, lab_id: &str) -> Result<()> {
        self.check_fail("apply_network_policy")?;
        self.state.lock().unwrap().policies.insert(lab_id.to_string());
        Ok(())
    }

    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        self.check_fail("get_deployments_by_selector")?;
        Ok(self.list_deployments(namespace, selectors))
    }

    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        self.check_fail("scale_deployment")?;
        if let Some(record) = self
            .state
            .lock()
            .unwrap()
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            record.replicas = replicas;
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeInfrastructure for MockInfrastructure {
    async fn deployment_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        self.check_fail("deployment_exists")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .contains_key(&(namespace.to_string(), name.to_string())))
    }

    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()> {
        self.check_fail("apply_deployment")?;
        let replicas = if config.replica_count == 0 {
            1
        } else {
            config.replica_count
        };
        self.state.lock().unwrap().deployments.insert(
            (config.lab_id.clone(), config.name.clone()),
            DeploymentRecord { config, replicas },
        );
        Ok(())
    }

    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        self.check_fail("get_deployments_by_selector")?;
        Ok(self.list_deployments(namespace, selectors))
    }

    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        LabInfrastructure::scale_deployment(self, name, namespace, replicas).await
    }

    async fn reset_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        LabInfrastructure::scale_deployment(self, name, namespace, 0).await?;
        LabInfrastructure::scale_deployment(self, name, namespace, 1).await
    }

    async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        self.check_fail("delete_deployment")?;
        self.state
            .lock()
            .unwrap()
            .deployments
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[async_trait]
impl DnsInfrastructure for MockInfrastructure {
    async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()> {
        ChallengeInfrastructure::apply_deployment(self, config).await
    }

    async fn apply_config_map(
        &self,
        name: &str,
        lab_id: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.check_fail("apply_config_map")?;
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert((lab_id.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn get_config_map_data(
        &self,
        name: &str,
        lab_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        self.check_fail("get_config_map_data")?;
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(lab_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::Transport(format!("config map {lab_id}/{name} not found")))
    }
}

#[async_trait]
impl PlatformInfrastructure for MockInfrastructure {
    async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        self.check_fail("get_deployments_by_selector")?;
        Ok(self.list_deployments(namespace, selectors))
    }

    async fn get_pods_metrics(
        &self,
        _namespace: &str,
        _selectors: &[String],
    ) -> Result<Vec<PodMetrics>> {
        self.check_fail("get_pods_metrics")?;
        Ok(self.state.lock().unwrap().metrics.clone())
    }
}
