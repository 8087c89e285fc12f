// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CNI IP-pool operations.
//!
//! Each lab owns one Calico IP pool scoped by a node selector that never
//! matches, so addresses are only handed out through the namespace
//! annotation pinning pods to the pool.

use kube::api::{DeleteParams, PostParams};
use kube::{Api, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Kubernetes, is_not_found, labels};
use crate::error::Result;

/// Calico IP pool spec (crd.projectcalico.org/v1).
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "crd.projectcalico.org",
    version = "v1",
    kind = "IPPool",
    plural = "ippools"
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// The pool's CIDR.
    pub cidr: String,
    /// Per-node block size.
    pub block_size: i32,
    /// IP-in-IP encapsulation mode.
    pub ipip_mode: String,
    /// Masquerade egress traffic.
    pub nat_outgoing: bool,
    /// Node selector; `!all()` keeps the pool out of automatic use.
    pub node_selector: String,
}

impl Kubernetes {
    /// Create the lab's IP pool; a no-op if it already exists.
    pub async fn apply_network(&self, name: &str, cidr: &str, block_size: u8) -> Result<()> {
        let api = Api::<IPPool>::all(self.client());

        match api.get(name).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let mut pool = IPPool::new(
            name,
            IPPoolSpec {
                cidr: cidr.to_string(),
                block_size: block_size as i32,
                ipip_mode: "Always".to_string(),
                nat_outgoing: true,
                node_selector: "!all()".to_string(),
            },
        );
        pool.metadata.labels = Some(
            [
                (labels::PLATFORM.to_string(), labels::LAB_NETWORK.to_string()),
                (labels::LAB_ID.to_string(), name.to_string()),
            ]
            .into(),
        );

        api.create(&PostParams::default(), &pool).await?;

        debug!(network = name, cidr, "created IP pool");
        Ok(())
    }

    /// Read the pool's CIDR.
    pub async fn get_network_cidr(&self, name: &str) -> Result<String> {
        let pool = Api::<IPPool>::all(self.client()).get(name).await?;
        Ok(pool.spec.cidr)
    }

    /// Delete the pool; a missing pool is tolerated.
    pub async fn delete_network(&self, name: &str) -> Result<()> {
        match Api::<IPPool>::all(self.client())
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(network = name, "deleted IP pool");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_pool_serializes_with_calico_field_names() {
        let pool = IPPool::new(
            "lab-1",
            IPPoolSpec {
                cidr: "128.0.0.0/26".to_string(),
                block_size: 26,
                ipip_mode: "Always".to_string(),
                nat_outgoing: true,
                node_selector: "!all()".to_string(),
            },
        );
        let value = serde_json::to_value(&pool).unwrap();
        assert_eq!(value["apiVersion"], "crd.projectcalico.org/v1");
        assert_eq!(value["kind"], "IPPool");
        assert_eq!(value["spec"]["blockSize"], 26);
        assert_eq!(value["spec"]["natOutgoing"], true);
        assert_eq!(value["spec"]["nodeSelector"], "!all()");
    }
}
