// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-lab network policy: default deny, allow intra-namespace traffic,
//! allow egress to the internet while excluding the labs CIDR so one lab
//! can never reach into another.

use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Api;
use kube::api::{DeleteParams, Patch};
use serde_json::json;
use tracing::debug;

use super::{Kubernetes, is_not_found};
use crate::error::Result;

const POLICY_NAME: &str = "default";

impl Kubernetes {
    /// Apply the lab's network policy.
    pub async fn apply_network_policy(&self, lab_id: &str) -> Result<()> {
        let manifest = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": {
                "name": POLICY_NAME,
                "namespace": lab_id,
            },
            "spec": {
                "podSelector": {},
                "policyTypes": ["Ingress", "Egress"],
                "ingress": [
                    {"from": [{"podSelector": {}}]},
                ],
                "egress": [
                    {"to": [{"podSelector": {}}]},
                    {"to": [{"ipBlock": {
                        "cidr": "0.0.0.0/0",
                        "except": [self.pods_cidr().to_string()],
                    }}]},
                ],
            },
        });
        let policy: NetworkPolicy = serde_json::from_value(manifest)?;

        Api::<NetworkPolicy>::namespaced(self.client(), lab_id)
            .patch(POLICY_NAME, &self.apply_params(), &Patch::Apply(&policy))
            .await?;

        debug!(namespace = lab_id, "applied network policy");
        Ok(())
    }

    /// Delete the lab's network policy; a missing policy is tolerated.
    pub async fn delete_network_policy(&self, lab_id: &str) -> Result<()> {
        match Api::<NetworkPolicy>::namespaced(self.client(), lab_id)
            .delete(POLICY_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
