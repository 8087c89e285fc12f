// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace operations. A lab's namespace is named after the lab ID and
//! pinned to the lab's IP pool through the CNI annotation.

use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::{DeleteParams, Patch};
use serde_json::json;
use tracing::debug;

use super::{Kubernetes, is_not_found, labels};
use crate::error::Result;

impl Kubernetes {
    /// Create or update a namespace, annotated to draw pod addresses
    /// from the given IP pool.
    pub async fn apply_namespace(&self, name: &str, ip_pool_name: Option<&str>) -> Result<()> {
        let mut manifest = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": {
                    labels::PLATFORM: labels::LAB,
                    labels::LAB_ID: name,
                },
            },
        });
        if let Some(pool) = ip_pool_name {
            manifest["metadata"]["annotations"] = json!({
                "cni.projectcalico.org/ipv4pools": format!("[\"{pool}\"]"),
            });
        }
        let namespace: Namespace = serde_json::from_value(manifest)?;

        Api::<Namespace>::all(self.client())
            .patch(name, &self.apply_params(), &Patch::Apply(&namespace))
            .await?;

        debug!(namespace = name, "applied namespace");
        Ok(())
    }

    /// True when the namespace exists; a 404 is not an error.
    pub async fn namespace_exists(&self, name: &str) -> Result<bool> {
        match Api::<Namespace>::all(self.client()).get(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a namespace; cascades pods, policies and config maps.
    /// A missing namespace is tolerated.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        match Api::<Namespace>::all(self.client())
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(namespace = name, "deleted namespace");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
