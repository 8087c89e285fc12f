// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Config-map operations. Labs use one config map per namespace to carry
//! the DNS server configuration and rendered zone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::{DeleteParams, Patch};
use serde_json::json;
use tracing::debug;

use super::{Kubernetes, is_not_found, labels};
use crate::error::{Error, Result};

impl Kubernetes {
    /// Create or update a config map in the lab's namespace.
    pub async fn apply_config_map(
        &self,
        name: &str,
        lab_id: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": lab_id,
                "labels": {
                    labels::PLATFORM: labels::LAB_DNS_CONFIG,
                    labels::LAB_ID: lab_id,
                },
            },
            "data": data,
        });
        let config_map: ConfigMap = serde_json::from_value(manifest)?;

        Api::<ConfigMap>::namespaced(self.client(), lab_id)
            .patch(name, &self.apply_params(), &Patch::Apply(&config_map))
            .await?;

        debug!(config_map = name, namespace = lab_id, "applied config map");
        Ok(())
    }

    /// Read a config map's data.
    pub async fn get_config_map_data(
        &self,
        name: &str,
        lab_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        let config_map = Api::<ConfigMap>::namespaced(self.client(), lab_id)
            .get(name)
            .await
            .map_err(Error::from)?;

        Ok(config_map.data.unwrap_or_default())
    }

    /// Delete a config map; a missing one is tolerated.
    pub async fn delete_config_map(&self, name: &str, lab_id: &str) -> Result<()> {
        match Api::<ConfigMap>::namespaced(self.client(), lab_id)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
