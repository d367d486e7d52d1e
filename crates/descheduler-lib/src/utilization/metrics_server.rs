use super::{ResourceUsage, UtilizationSource};
use crate::models::{parse_bytes, parse_cpu_millis};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::warn;

/// Node usage from the `metrics.k8s.io/v1beta1` NodeMetrics API
#[derive(Clone)]
pub struct MetricsServerSource {
    api: Api<DynamicObject>,
}

impl MetricsServerSource {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "nodes");
        Self {
            api: Api::all_with(client, &resource),
        }
    }
}

/// Extract `usage.cpu` and `usage.memory` from a NodeMetrics object
pub(crate) fn usage_from_node_metrics(data: &serde_json::Value) -> Option<ResourceUsage> {
    let usage = data.get("usage")?;
    let cpu = usage.get("cpu")?.as_str().and_then(parse_cpu_millis)?;
    let memory = usage.get("memory")?.as_str().and_then(parse_bytes)?;
    Some(ResourceUsage::new(cpu, memory, 0))
}

#[async_trait]
impl UtilizationSource for MetricsServerSource {
    fn name(&self) -> &str {
        "metrics-server"
    }

    async fn node_usage(&self, node: &str) -> Option<ResourceUsage> {
        match self.api.get(node).await {
            Ok(object) => {
                let usage = usage_from_node_metrics(&object.data);
                if usage.is_none() {
                    warn!(node = %node, "NodeMetrics object has no parsable usage");
                }
                usage
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to fetch node metrics");
                None
            }
        }
    }
}
