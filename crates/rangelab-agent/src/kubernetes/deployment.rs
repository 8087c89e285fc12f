// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment operations: server-side apply, selector listings with
//! replica counters, scaling and deletion.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::debug;

use super::{Kubernetes, POD_SELECTOR_LABEL, is_not_found, selector_label};
use crate::error::Result;
use crate::model::{DeploymentConfig, DeploymentState, Replicas};

impl Kubernetes {
    /// Create or update a deployment from the given config. Re-applying
    /// an unchanged config is a no-op under server-side apply.
    pub async fn apply_deployment(&self, config: DeploymentConfig) -> Result<()> {
        let manifest = render_deployment(&config)?;
        let deployment: Deployment = serde_json::from_value(manifest)?;

        Api::<Deployment>::namespaced(self.client(), &config.lab_id)
            .patch(&config.name, &self.apply_params(), &Patch::Apply(&deployment))
            .await?;

        debug!(deployment = %config.name, namespace = %config.lab_id, "applied deployment");
        Ok(())
    }

    /// List deployments matching the label selectors. An empty namespace
    /// selects every namespace.
    pub async fn get_deployments_by_selector(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<DeploymentState>> {
        let api: Api<Deployment> = if namespace.is_empty() {
            Api::all(self.client())
        } else {
            Api::namespaced(self.client(), namespace)
        };

        let params = ListParams::default().labels(&selectors.join(","));
        let list = api.list(&params).await?;

        Ok(list.items.into_iter().map(deployment_state).collect())
    }

    /// True when the deployment exists; a 404 is not an error.
    pub async fn deployment_exists(&self, name: &str, namespace: &str) -> Result<bool> {
        match Api::<Deployment>::namespaced(self.client(), namespace)
            .get(name)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Scale a deployment to the given replica count.
    pub async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        let patch = json!({"spec": {"replicas": replicas}});
        Api::<Deployment>::namespaced(self.client(), namespace)
            .patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        debug!(deployment = name, namespace, replicas, "scaled deployment");
        Ok(())
    }

    /// Scale to zero, then back to one.
    pub async fn reset_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        self.scale_deployment(name, namespace, 0).await?;
        self.scale_deployment(name, namespace, 1).await?;
        Ok(())
    }

    /// Delete a deployment; a missing deployment is tolerated.
    pub async fn delete_deployment(&self, name: &str, namespace: &str) -> Result<()> {
        match Api::<Deployment>::namespaced(self.client(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(deployment = name, namespace, "deleted deployment");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn render_deployment(config: &DeploymentConfig) -> Result<Value> {
    let pod_selector = selector_label(&[config.lab_id.as_str(), config.name.as_str()]);

    let mut template_labels: BTreeMap<String, String> = config.labels.clone();
    template_labels.insert(POD_SELECTOR_LABEL.to_string(), pod_selector.clone());

    let mut annotations = BTreeMap::new();
    if let Some(ip) = config.ip {
        annotations.insert(
            "cni.projectcalico.org/ipAddrs".to_string(),
            format!("[\"{ip}\"]"),
        );
        annotations.insert("ip".to_string(), ip.to_string());
    }

    let mut container = json!({
        "name": config.name,
        "image": config.image,
        "securityContext": {
            "privileged": config.privileged,
            "allowPrivilegeEscalation": config.privileged,
            "capabilities": {"add": config.cap_adds},
        },
    });

    if !config.envs.is_empty() {
        container["env"] = config
            .envs
            .iter()
            .map(|env| json!({"name": env.name, "value": env.value}))
            .collect();
    }
    if !config.args.is_empty() {
        container["args"] = json!(config.args);
    }
    if !config.resources.requests.is_zero() || !config.resources.limits.is_zero() {
        let mut resources = json!({});
        if !config.resources.requests.is_zero() {
            resources["requests"] = quantities(config.resources.requests);
        }
        if !config.resources.limits.is_zero() {
            resources["limits"] = quantities(config.resources.limits);
        }
        container["resources"] = resources;
    }
    if let Some(probe) = &config.readiness_probe {
        container["readinessProbe"] = json!({
            "periodSeconds": probe.period_seconds,
            "exec": {"command": probe.cmd},
        });
    }
    if !config.volumes.is_empty() {
        container["volumeMounts"] = config
            .volumes
            .iter()
            .flat_map(|volume| {
                volume.mounts.iter().map(|mount| {
                    let mut entry = json!({
                        "name": volume.name,
                        "mountPath": mount.mount_path,
                    });
                    if let Some(sub_path) = &mount.sub_path {
                        entry["subPath"] = json!(sub_path);
                    }
                    entry
                })
            })
            .collect();
    }

    let mut pod_spec = json!({"containers": [container]});
    if !config.volumes.is_empty() {
        pod_spec["volumes"] = config
            .volumes
            .iter()
            .map(|volume| {
                json!({
                    "name": volume.name,
                    "configMap": {"name": volume.config_map_name},
                })
            })
            .collect();
    }
    if let Some(dns_server) = config.dns_server {
        let mut nameservers = vec![dns_server.to_string()];
        if config.use_public_dns {
            nameservers.push("1.1.1.1".to_string());
        }
        pod_spec["dnsPolicy"] = json!("None");
        pod_spec["dnsConfig"] = json!({"nameservers": nameservers});
    }

    let replicas = if config.replica_count == 0 {
        1
    } else {
        config.replica_count
    };

    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": config.name,
            "namespace": config.lab_id,
            "labels": config.labels,
        },
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": {POD_SELECTOR_LABEL: pod_selector}},
            "template": {
                "metadata": {
                    "name": config.name,
                    "labels": template_labels,
                    "annotations": annotations,
                },
                "spec": pod_spec,
            },
        },
    }))
}

fn quantities(spec: crate::model::ResourceSpec) -> Value {
    json!({
        "cpu": format!("{}m", spec.cpu_millis),
        "memory": format!("{}", spec.memory_bytes),
    })
}

fn deployment_state(deployment: Deployment) -> DeploymentState {
    let name = deployment.metadata.name.unwrap_or_default();
    let labels = deployment.metadata.labels.unwrap_or_default();

    let ip = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get("ip"))
        .cloned()
        .unwrap_or_default();

    let (replicas, reason) = match deployment.status {
        Some(status) => {
            let reason = status
                .conditions
                .as_ref()
                .and_then(|conditions| {
                    conditions
                        .iter()
                        .find(|c| c.status == "False")
                        .map(|c| c.message.clone().unwrap_or_default())
                })
                .unwrap_or_default();
            (
                Replicas {
                    total: status.replicas.unwrap_or(0),
                    ready: status.ready_replicas.unwrap_or(0),
                    available: status.available_replicas.unwrap_or(0),
                    unavailable: status.unavailable_replicas.unwrap_or(0),
                },
                reason,
            )
        }
        None => (Replicas::default(), String::new()),
    };

    DeploymentState {
        name,
        ip,
        labels: labels.into_iter().collect(),
        replicas,
        reason,
    }
}
