// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lab lifecycle orchestration.
//!
//! Creating a lab is a compensating transaction: each completed step
//! pushes its undo action, and any failure unwinds the stack in reverse
//! order. A failed create leaves nothing behind; a successful one ends
//! with a catalog row, which is what makes the lab exist.

use std::sync::Arc;

use futures::future::BoxFuture;
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::PgPool;
use tracing::{error, info, warn};

use super::{DnsChallengeBundle, LabInfrastructure};
use crate::catalog::{self, Laboratory};
use crate::error::{Error, MultiError, Result};
use crate::ipam::IpamManager;
use crate::kubernetes::labels;
use crate::model::{ChallengeConfig, Lab};
use uuid::Uuid;

/// A named undo action, pushed after its step succeeds.
type UndoStep = (&'static str, BoxFuture<'static, Result<()>>);

/// Orchestrates the end-to-end lab lifecycle.
pub struct LabService {
    infrastructure: Arc<dyn LabInfrastructure>,
    ipam: IpamManager,
    pool: PgPool,
    bundle: Arc<dyn DnsChallengeBundle>,
}

impl LabService {
    pub fn new(
        infrastructure: Arc<dyn LabInfrastructure>,
        ipam: IpamManager,
        pool: PgPool,
        bundle: Arc<dyn DnsChallengeBundle>,
    ) -> Self {
        Self {
            infrastructure,
            ipam,
            pool,
            bundle,
        }
    }

    /// Create a lab: child CIDR, network, namespace, policy, DNS server,
    /// catalog row. On failure every completed step is compensated in
    /// reverse order and the primary failure is returned.
    pub async fn create_lab(&self, subnet_mask: u8, group_id: Uuid) -> Result<Lab> {
        let id = Uuid::now_v7();
        let lab_id = id.to_string();
        let mut undo: Vec<UndoStep> = Vec::new();

        let child = match self.ipam.acquire_child_cidr(subnet_mask).await {
            Ok(child) => child,
            Err(e) => return Err(Error::lab(&lab_id, "failed to acquire child cidr", e.into())),
        };
        {
            let ipam = self.ipam.clone();
            let cidr = child.cidr();
            undo.push((
                "release child cidr",
                Box::pin(async move { ipam.release_child_cidr(cidr).await.map_err(Into::into) }),
            ));
        }

        if let Err(e) = self
            .infrastructure
            .apply_network(&lab_id, &child.cidr().to_string(), subnet_mask)
            .await
        {
            self.unwind(&lab_id, undo).await;
            return Err(Error::lab(&lab_id, "failed to apply network", e));
        }
        {
            let infrastructure = self.infrastructure.clone();
            let name = lab_id.clone();
            undo.push((
                "delete network",
                Box::pin(async move { infrastructure.delete_network(&name).await }),
            ));
        }

        if let Err(e) = self
            .infrastructure
            .apply_namespace(&lab_id, Some(&lab_id))
            .await
        {
            self.unwind(&lab_id, undo).await;
            return Err(Error::lab(&lab_id, "failed to apply namespace", e));
        }
        {
            let infrastructure = self.infrastructure.clone();
            let name = lab_id.clone();
            undo.push((
                "delete namespace",
                Box::pin(async move { infrastructure.delete_namespace(&name).await }),
            ));
        }

        // The policy and DNS objects live in the namespace; its deletion
        // compensates them.
        if let Err(e) = self.infrastructure.apply_network_policy(&lab_id).await {
            self.unwind(&lab_id, undo).await;
            return Err(Error::lab(&lab_id, "failed to apply network policy", e));
        }

        let dns_ip = match child.acquire_single_ip(None).await {
            Ok(ip) => ip,
            Err(e) => {
                self.unwind(&lab_id, undo).await;
                return Err(Error::lab(&lab_id, "failed to acquire dns address", e.into()));
            }
        };

        if let Err(e) = self.bundle.create_dns_server(&lab_id, dns_ip).await {
            self.unwind(&lab_id, undo).await;
            return Err(Error::lab(&lab_id, "failed to create dns server", e));
        }

        if let Err(e) =
            catalog::create_laboratory(&self.pool, id, group_id, IpNetwork::V4(child.cidr())).await
        {
            self.unwind(&lab_id, undo).await;
            return Err(Error::lab(&lab_id, "failed to create catalog row", e.into()));
        }

        info!(lab_id = %lab_id, cidr = %child.cidr(), "lab created");

        Ok(Lab { id, child })
    }

    /// Rebuild the orchestrator objects of a lab that already owns its
    /// child CIDR (restore path). Partially rebuilt state is left for the
    /// next restore attempt; the catalog row stays authoritative.
    async fn create_specific_lab(&self, row: &Laboratory) -> Result<()> {
        let lab_id = row.id.to_string();
        let cidr = as_v4(&lab_id, row.cidr)?;

        let child = self
            .ipam
            .get_child_cidr(cidr)
            .await
            .map_err(|e| Error::lab(&lab_id, "lab cidr is not reserved in the ipam", e.into()))?;

        self.infrastructure
            .apply_network(&lab_id, &cidr.to_string(), cidr.prefix())
            .await
            .map_err(|e| Error::lab(&lab_id, "failed to apply network", e))?;

        self.infrastructure
            .apply_namespace(&lab_id, Some(&lab_id))
            .await
            .map_err(|e| Error::lab(&lab_id, "failed to apply namespace", e))?;

        self.infrastructure
            .apply_network_policy(&lab_id)
            .await
            .map_err(|e| Error::lab(&lab_id, "failed to apply network policy", e))?;

        self.bundle
            .create_dns_server(&lab_id, child.first_ip())
            .await
            .map_err(|e| Error::lab(&lab_id, "failed to create dns server", e))?;

        info!(lab_id = %lab_id, cidr = %cidr, "lab restored");
        Ok(())
    }

    /// Resolve a lab from the orchestrator and rebind its IPAM child.
    pub async fn get_lab(&self, lab_id: &str) -> Result<Lab> {
        let id = parse_lab_id(lab_id)?;

        let cidr: Ipv4Network = self
            .infrastructure
            .get_network_cidr(lab_id)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to get lab cidr", e))?
            .parse()
            .map_err(|_| Error::lab(
                lab_id,
                "lab network has an invalid cidr",
                Error::InvalidArgument("unparseable pool cidr".into()),
            ))?;

        let child = self
            .ipam
            .get_child_cidr(cidr)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to get lab cidr manager", e.into()))?;

        Ok(Lab { id, child })
    }

    /// Delete a lab and everything it owns. Missing sub-resources are
    /// tolerated, so the method is idempotent.
    pub async fn delete_lab(&self, lab_id: &str) -> Result<()> {
        let id = parse_lab_id(lab_id)?;

        // Prefer the catalog row for the CIDR; fall back to the pool
        // object when the row is already gone.
        let cidr = match catalog::get_laboratory(&self.pool, id)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to read catalog row", e.into()))?
        {
            Some(row) => Some(as_v4(lab_id, row.cidr)?),
            None => match self.infrastructure.get_network_cidr(lab_id).await {
                Ok(raw) => raw.parse().ok(),
                Err(_) => None,
            },
        };

        self.infrastructure
            .delete_namespace(lab_id)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to delete namespace", e))?;

        self.infrastructure
            .delete_network(lab_id)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to delete network", e))?;

        match cidr {
            Some(cidr) => self
                .ipam
                .release_child_cidr(cidr)
                .await
                .map_err(|e| Error::lab(lab_id, "failed to release child cidr", e.into()))?,
            None => warn!(lab_id, "lab has no discoverable cidr; skipping ipam release"),
        }

        catalog::delete_laboratory(&self.pool, id)
            .await
            .map_err(|e| Error::lab(lab_id, "failed to delete catalog row", e.into()))?;

        info!(lab_id, "lab deleted");
        Ok(())
    }

    /// Scale every deployment in the lab's namespace to one replica.
    pub async fn start_lab(&self, lab_id: &str) -> Result<()> {
        self.scale_lab(lab_id, 1).await
    }

    /// Scale every deployment in the lab's namespace to zero replicas.
    pub async fn stop_lab(&self, lab_id: &str) -> Result<()> {
        self.scale_lab(lab_id, 0).await
    }

    async fn scale_lab(&self, lab_id: &str, replicas: i32) -> Result<()> {
        parse_lab_id(lab_id)?;

        let deployments = self
            .infrastructure
            .get_deployments_by_selector(lab_id, &[labels::PLATFORM.to_string()])
            .await
            .map_err(|e| Error::lab(lab_id, "failed to list lab deployments", e))?;

        let scales = deployments.into_iter().map(|deployment| {
            let infrastructure = self.infrastructure.clone();
            let lab_id = lab_id.to_string();
            async move {
                infrastructure
                    .scale_deployment(&deployment.name, &lab_id, replicas)
                    .await
                    .map_err(|e| {
                        Error::lab(&lab_id, format!("failed to scale {}", deployment.name), e)
                    })
            }
        });

        let mut errs = MultiError::new();
        for result in futures::future::join_all(scales).await {
            errs.record(result);
        }
        errs.into_result()
    }

    /// Create the given challenges in the lab, then fold their records
    /// into the lab zone.
    pub async fn add_lab_challenges(
        &self,
        lab_id: &str,
        configs: Vec<ChallengeConfig>,
    ) -> Result<()> {
        let lab = self.get_lab(lab_id).await?;

        let mut errs = MultiError::new();
        let mut records = Vec::new();
        for config in configs {
            let (mut challenge_records, challenge_errs) =
                self.bundle.create_challenge(&lab, config).await;
            records.append(&mut challenge_records);
            if let Err(e) = challenge_errs.into_result() {
                errs.push(e);
            }
        }

        if let Err(e) = self.bundle.refresh_dns_records(lab_id, records, true).await {
            errs.push(e);
        }

        errs.into_result()
    }

    /// Delete the given challenges from the lab, then remove their
    /// records from the lab zone.
    pub async fn delete_lab_challenges(
        &self,
        lab_id: &str,
        challenge_ids: &[String],
    ) -> Result<()> {
        let lab = self.get_lab(lab_id).await?;

        let mut errs = MultiError::new();
        let mut records = Vec::new();
        for challenge_id in challenge_ids {
            let (mut challenge_records, challenge_errs) =
                self.bundle.delete_challenge(&lab, challenge_id).await;
            records.append(&mut challenge_records);
            if let Err(e) = challenge_errs.into_result() {
                errs.push(e);
            }
        }

        if let Err(e) = self.bundle.refresh_dns_records(lab_id, records, false).await {
            errs.push(e);
        }

        errs.into_result()
    }

    /// Every lab recorded in the catalog.
    pub async fn stored_labs(&self) -> Result<Vec<Laboratory>> {
        catalog::list_laboratories(&self.pool).await.map_err(Into::into)
    }

    /// Lab IDs of one group.
    pub async fn stored_lab_ids_by_group(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = catalog::list_laboratories_by_group(&self.pool, group_id).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Rebuild the lab's orchestrator objects when its namespace is gone
    /// (boot-time restore).
    pub async fn restore_lab_if_needed(&self, row: &Laboratory) -> Result<()> {
        let lab_id = row.id.to_string();

        if self
            .infrastructure
            .namespace_exists(&lab_id)
            .await
            .map_err(|e| Error::lab(&lab_id, "failed to check namespace", e))?
        {
            return Ok(());
        }

        self.create_specific_lab(row).await
    }

    /// Run the undo stack in reverse. Secondary failures are logged but
    /// never replace the primary failure.
    async fn unwind(&self, lab_id: &str, undo: Vec<UndoStep>) {
        for (step, action) in undo.into_iter().rev() {
            if let Err(e) = action.await {
                error!(lab_id, step, error = %e, "compensation step failed");
            }
        }
    }
}

fn parse_lab_id(lab_id: &str) -> Result<Uuid> {
    Uuid::parse_str(lab_id).map_err(|_| Error::InvalidArgument(format!("invalid lab id: {lab_id}")))
}

fn as_v4(lab_id: &str, net: IpNetwork) -> Result<Ipv4Network> {
    match net {
        IpNetwork::V4(v4) => Ok(v4),
        IpNetwork::V6(_) => Err(Error::lab(
            lab_id,
            "lab cidr is not ipv4",
            Error::InvalidArgument(net.to_string()),
        )),
    }
}
