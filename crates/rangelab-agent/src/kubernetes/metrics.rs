// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pod usage sampling through the metrics API
//! (`metrics.k8s.io/v1beta1`), accessed dynamically so no generated
//! client is needed.

use kube::Api;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, ListParams};

use super::{Kubernetes, parse_cpu_millis, parse_memory_bytes};
use crate::error::Result;
use crate::model::{PodMetrics, ResourceSpec};

impl Kubernetes {
    /// Sample per-pod usage for pods matching the label selectors.
    /// An empty namespace selects every namespace.
    pub async fn get_pods_metrics(
        &self,
        namespace: &str,
        selectors: &[String],
    ) -> Result<Vec<PodMetrics>> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");

        let api: Api<DynamicObject> = if namespace.is_empty() {
            Api::all_with(self.client(), &resource)
        } else {
            Api::namespaced_with(self.client(), namespace, &resource)
        };

        let params = ListParams::default().labels(&selectors.join(","));
        let list = api.list(&params).await?;

        Ok(list.items.into_iter().map(pod_metrics).collect())
    }
}

fn pod_metrics(item: DynamicObject) -> PodMetrics {
    let labels = item.metadata.labels.clone().unwrap_or_default();

    // Usage of the first container, matching the single-container pods the
    // agent deploys
    let usage = item
        .data
        .get("containers")
        .and_then(|containers| containers.as_array())
        .and_then(|containers| containers.first())
        .and_then(|container| container.get("usage"))
        .map(|usage| ResourceSpec {
            cpu_millis: usage
                .get("cpu")
                .and_then(|v| v.as_str())
                .map(parse_cpu_millis)
                .unwrap_or(0),
            memory_bytes: usage
                .get("memory")
                .and_then(|v| v.as_str())
                .map(parse_memory_bytes)
                .unwrap_or(0),
        })
        .unwrap_or_default();

    PodMetrics {
        labels: labels.into_iter().collect(),
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_parsed_from_the_first_container() {
        let item: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "PodMetrics",
            "metadata": {
                "name": "web-abc",
                "namespace": "lab-1",
                "labels": {"platform": "challenge", "instanceID": "i1"},
            },
            "timestamp": "2025-06-01T00:00:00Z",
            "window": "15s",
            "containers": [
                {"name": "web", "usage": {"cpu": "12m", "memory": "50Mi"}},
            ],
        }))
        .unwrap();

        let metrics = pod_metrics(item);
        assert_eq!(metrics.usage.cpu_millis, 12);
        assert_eq!(metrics.usage.memory_bytes, 50 * 1024 * 1024);
        assert_eq!(
            metrics.labels.get("instanceID").map(String::as_str),
            Some("i1")
        );
    }

    #[test]
    fn missing_containers_yield_zero_usage() {
        let item: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "PodMetrics",
            "metadata": {"name": "web-abc", "namespace": "lab-1"},
        }))
        .unwrap();

        let metrics = pod_metrics(item);
        assert_eq!(metrics.usage, ResourceSpec::default());
    }
}
