//! Embedded asset access.
//!
//! Every asset the operator can apply ships inside the binary: the catalog
//! (`metadata.yaml`), the templates it references, and the tombstone
//! declarations. [`Loader`] is the read-only view over that embedded set.

pub mod catalog;
pub mod tombstone;

pub use catalog::{AssetCondition, AssetMetadata, Catalog, InstallMode};
pub use tombstone::{load_tombstones, Tombstone};

use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::Error;

/// Maximum size of a single embedded YAML document. Guards against
/// accidentally embedding a multi-megabyte manifest.
pub const MAX_YAML_SIZE: usize = 10 * 1024 * 1024;

/// Maximum nesting depth accepted when parsing YAML into an object tree.
pub const MAX_YAML_DEPTH: usize = 100;

/// Embedded file table. Paths are relative to the assets directory.
const EMBEDDED: &[(&str, &str)] = &[
    ("metadata.yaml", include_str!("../../assets/metadata.yaml")),
    (
        "hyperconverged.yaml.tpl",
        include_str!("../../assets/hyperconverged.yaml.tpl"),
    ),
    (
        "platform-facts.yaml.tpl",
        include_str!("../../assets/platform-facts.yaml.tpl"),
    ),
    (
        "cpu-manager-kubelet-config.yaml.tpl",
        include_str!("../../assets/cpu-manager-kubelet-config.yaml.tpl"),
    ),
    (
        "vfio-machine-config.yaml.tpl",
        include_str!("../../assets/vfio-machine-config.yaml.tpl"),
    ),
    (
        "gpu-passthrough-config.yaml.tpl",
        include_str!("../../assets/gpu-passthrough-config.yaml.tpl"),
    ),
    (
        "node-health-check.yaml.tpl",
        include_str!("../../assets/node-health-check.yaml.tpl"),
    ),
    (
        "tombstones/legacy-tuning-configmap.yaml",
        include_str!("../../assets/tombstones/legacy-tuning-configmap.yaml"),
    ),
    (
        "tombstones/legacy-node-labeller.yaml",
        include_str!("../../assets/tombstones/legacy-node-labeller.yaml"),
    ),
];

/// Read-only access to the embedded asset files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Loader;

impl Loader {
    /// Create a loader over the embedded file set.
    pub fn new() -> Self {
        Self
    }

    /// Load a single asset by path.
    pub fn read(&self, path: &str) -> Result<&'static str, Error> {
        EMBEDDED
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, content)| *content)
            .ok_or_else(|| Error::internal(format!("embedded asset {path} not found")))
    }

    /// List embedded paths under a directory prefix, in embedding order.
    pub fn list(&self, prefix: &str) -> Vec<&'static str> {
        EMBEDDED
            .iter()
            .map(|(p, _)| *p)
            .filter(|p| p.starts_with(prefix))
            .collect()
    }
}

/// Parse YAML into an object tree with size and depth guards.
pub fn parse_yaml_guarded(data: &str) -> Result<Value, Error> {
    if data.len() > MAX_YAML_SIZE {
        return Err(Error::internal(format!(
            "YAML content exceeds maximum size of {MAX_YAML_SIZE} bytes (got {})",
            data.len()
        )));
    }

    let value: Value = serde_yaml::from_str(data)
        .map_err(|e| Error::internal(format!("failed to parse YAML: {e}")))?;

    let depth = value_depth(&value);
    if depth > MAX_YAML_DEPTH {
        return Err(Error::internal(format!(
            "YAML structure exceeds maximum nesting depth of {MAX_YAML_DEPTH} (got {depth})"
        )));
    }

    Ok(value)
}

/// Parse multi-document YAML, skipping empty documents.
pub fn parse_multi_yaml(data: &str) -> Result<Vec<Value>, Error> {
    data.split("\n---")
        .map(str::trim)
        .filter(|doc| !doc.is_empty())
        .map(parse_yaml_guarded)
        .collect()
}

/// Parse a YAML document into a dynamic object, requiring apiVersion, kind,
/// and metadata.name.
pub fn parse_object(data: &str) -> Result<DynamicObject, Error> {
    let value = parse_yaml_guarded(data)?;
    for field in ["apiVersion", "kind"] {
        if value.get(field).and_then(Value::as_str).is_none() {
            return Err(Error::internal(format!("manifest missing {field}")));
        }
    }
    if value.pointer("/metadata/name").and_then(Value::as_str).is_none() {
        return Err(Error::internal("manifest missing metadata.name"));
    }
    Ok(serde_json::from_value(value)?)
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 1,
    }
}
