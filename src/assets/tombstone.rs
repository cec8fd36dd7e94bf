//! Tombstone declarations: previously-managed objects now marked for
//! deletion.
//!
//! Tombstones are plain Kubernetes object YAML embedded under
//! `tombstones/`. Each declaration must name its kind, apiVersion, and
//! metadata.name, and must itself carry the ownership label. The label is
//! the safety guard verified again on the live object before any delete
//! call. Validation failures here are a startup fatal.

use kube::api::DynamicObject;

use super::{parse_multi_yaml, Loader};
use crate::engine::resource::{self, ResourceKey};
use crate::error::Error;
use crate::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Directory prefix of embedded tombstone files.
pub const TOMBSTONES_DIR: &str = "tombstones/";

/// One validated tombstone declaration.
#[derive(Debug, Clone)]
pub struct Tombstone {
    /// Embedded file the declaration came from.
    pub path: String,
    /// Identity of the object to delete.
    pub key: ResourceKey,
}

/// Load and validate every embedded tombstone declaration.
pub fn load_tombstones(loader: &Loader) -> Result<Vec<Tombstone>, Error> {
    let mut tombstones = Vec::new();

    for path in loader.list(TOMBSTONES_DIR) {
        if !path.ends_with(".yaml") {
            continue;
        }
        let content = loader.read(path)?;
        for doc in parse_multi_yaml(content)? {
            let obj: DynamicObject = serde_json::from_value(doc.clone())
                .map_err(|e| Error::tombstone(format!("{path}: not a Kubernetes object: {e}")))?;
            validate(&obj, &doc, path)?;
            tombstones.push(Tombstone {
                path: path.to_string(),
                key: ResourceKey::from_object(&obj)
                    .map_err(|e| Error::tombstone(format!("{path}: {e}")))?,
            });
        }
    }

    Ok(tombstones)
}

fn validate(obj: &DynamicObject, doc: &serde_json::Value, path: &str) -> Result<(), Error> {
    if doc.get("kind").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        return Err(Error::tombstone(format!("{path}: missing required field kind")));
    }
    if doc
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .is_empty()
    {
        return Err(Error::tombstone(format!(
            "{path}: missing required field apiVersion"
        )));
    }
    if obj.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(Error::tombstone(format!(
            "{path}: missing required field metadata.name"
        )));
    }
    if !resource::is_managed(obj) {
        return Err(Error::tombstone(format!(
            "{path}: missing required label {MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"
        )));
    }
    Ok(())
}
