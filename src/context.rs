//! Render context: the immutable input to template rendering.
//!
//! Built fresh for each reconciliation from the HCO object and cluster
//! hardware facts. Hardware facts are aggregated from Nodes with pure
//! per-node predicates, OR-combined across nodes (one sufficient node
//! activates the fact).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::debug;

use crate::engine::applier::ResourceClient;
use crate::error::Error;

/// Resource names that do not indicate attached PCI hardware.
const STANDARD_RESOURCES: &[&str] = &["cpu", "memory", "pods", "ephemeral-storage"];

/// Hardware facts detected across the cluster's nodes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HardwareFacts {
    /// A node exposes a GPU device plugin resource.
    pub gpu_present: bool,
    /// A node exposes PCI passthrough devices.
    pub pci_devices_present: bool,
    /// A node reports NUMA-relevant topology.
    pub numa_nodes_present: bool,
    /// A node has the IOMMU enabled for VFIO.
    pub vfio_capable: bool,
    /// A node exposes USB host devices.
    pub usb_devices_present: bool,
}

impl HardwareFacts {
    /// Aggregate facts over all nodes.
    pub fn detect(nodes: &[Node]) -> Self {
        Self {
            gpu_present: nodes.iter().any(has_gpu),
            pci_devices_present: nodes.iter().any(has_pci_devices),
            numa_nodes_present: nodes.iter().any(has_numa_topology),
            vfio_capable: nodes.iter().any(has_vfio_capability),
            usb_devices_present: nodes.iter().any(has_usb_devices),
        }
    }

    /// Look up a fact by detector name as used in the asset catalog.
    pub fn detector(&self, name: &str) -> Option<bool> {
        match name {
            "gpu" => Some(self.gpu_present),
            "pci" => Some(self.pci_devices_present),
            "numa" => Some(self.numa_nodes_present),
            "vfio" => Some(self.vfio_capable),
            "usb" => Some(self.usb_devices_present),
            _ => None,
        }
    }
}

fn node_label(node: &Node, key: &str) -> Option<String> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .cloned()
}

fn node_label_is_true(node: &Node, key: &str) -> bool {
    node_label(node, key).as_deref() == Some("true")
}

fn capacity_names(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .map(|c| c.keys().cloned().collect())
        .unwrap_or_default()
}

/// Any node resource from a known GPU vendor.
pub fn has_gpu(node: &Node) -> bool {
    capacity_names(node).iter().any(|name| {
        name == "nvidia.com/gpu" || name == "amd.com/gpu" || name.starts_with("gpu.intel.com/")
    })
}

/// PCI present label, or any non-standard resource in capacity.
pub fn has_pci_devices(node: &Node) -> bool {
    if node_label_is_true(node, "feature.node.kubernetes.io/pci-present") {
        return true;
    }
    capacity_names(node).iter().any(|name| {
        !STANDARD_RESOURCES.contains(&name.as_str()) && !name.starts_with("hugepages-")
    })
}

/// CPU multithreading label, or a non-empty topology manager annotation.
pub fn has_numa_topology(node: &Node) -> bool {
    if node_label_is_true(node, "feature.node.kubernetes.io/cpu-hardware_multithreading") {
        return true;
    }
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get("kubevirt.io/topology-manager-policy"))
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// IOMMU enabled label.
pub fn has_vfio_capability(node: &Node) -> bool {
    node_label_is_true(node, "feature.node.kubernetes.io/iommu-enabled")
}

/// USB present label.
pub fn has_usb_devices(node: &Node) -> bool {
    node_label_is_true(node, "feature.node.kubernetes.io/usb-present")
}

/// Immutable snapshot handed to template rendering.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// The HCO object as fetched for this reconciliation.
    pub hco: DynamicObject,
    /// HCO annotations (for annotation-typed conditions).
    pub annotations: BTreeMap<String, String>,
    /// Feature gates extracted from `HCO.spec.featureGates[]`.
    pub feature_gates: BTreeSet<String>,
    /// Aggregated hardware facts.
    pub hardware: HardwareFacts,
    /// Namespace the HCO (and namespaced assets) live in.
    pub namespace: String,
}

impl RenderContext {
    /// Assemble a context from an HCO and pre-detected hardware facts.
    pub fn assemble(hco: DynamicObject, hardware: HardwareFacts, namespace: &str) -> Self {
        let annotations = hco.metadata.annotations.clone().unwrap_or_default();
        let feature_gates = extract_feature_gates(&hco);
        Self {
            hco,
            annotations,
            feature_gates,
            hardware,
            namespace: namespace.to_string(),
        }
    }

    /// True when the named feature gate is enabled on the HCO.
    pub fn feature_gate_enabled(&self, gate: &str) -> bool {
        self.feature_gates.contains(gate)
    }
}

/// Extract feature gate names from `spec.featureGates`, a string array.
pub fn extract_feature_gates(hco: &DynamicObject) -> BTreeSet<String> {
    hco.data
        .pointer("/spec/featureGates")
        .and_then(|v| v.as_array())
        .map(|gates| {
            gates
                .iter()
                .filter_map(|g| g.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Builds render contexts from live cluster state.
pub struct RenderContextBuilder {
    client: Arc<dyn ResourceClient>,
    namespace: String,
}

impl RenderContextBuilder {
    /// Create a builder reading nodes through the given client.
    pub fn new(client: Arc<dyn ResourceClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Build a fresh context: list nodes, aggregate hardware facts, snapshot
    /// the HCO.
    pub async fn build(&self, hco: &DynamicObject) -> Result<RenderContext, Error> {
        let nodes = self.client.list_nodes().await?;
        let hardware = HardwareFacts::detect(&nodes);
        debug!(
            nodes = nodes.len(),
            ?hardware,
            "aggregated hardware facts"
        );
        Ok(RenderContext::assemble(
            hco.clone(),
            hardware,
            &self.namespace,
        ))
    }
}
