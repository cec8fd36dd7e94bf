//! Resource identity for managed objects.
//!
//! Every managed object is handled as an opaque structural tree
//! (`DynamicObject`) plus a `(group, version, kind, namespace, name)` header.
//! [`ResourceKey`] is that header, with the derived plural needed to build a
//! dynamic API client.

use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};

use crate::error::Error;

/// API groups served by the built-in apiserver rather than a CRD.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "rbac.authorization.k8s.io",
    "networking.k8s.io",
    "storage.k8s.io",
    "scheduling.k8s.io",
    "node.k8s.io",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "events.k8s.io",
    "discovery.k8s.io",
    "flowcontrol.apiserver.k8s.io",
];

/// Identity of a single managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// API group (empty for the core group)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind, e.g. `ConfigMap`
    pub kind: String,
    /// Plural resource name, e.g. `configmaps`
    pub plural: String,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Build a key from a dynamic object's type and object meta.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, Error> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::internal("object has no apiVersion/kind"))?;
        let (group, version) = parse_api_version(&types.api_version);
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal(format!("{} object has no name", types.kind)))?;

        Ok(Self {
            plural: pluralize(&types.kind),
            kind: types.kind.clone(),
            group,
            version,
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// Build a key from explicit parts.
    pub fn new(
        group: &str,
        version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: pluralize(kind),
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// The `ApiResource` used to build a dynamic API client for this key.
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }

    /// Throttle bucket key: group/kind/namespace/name. The version is
    /// deliberately absent so API upgrades do not reset buckets.
    pub fn throttle_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group,
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }

    /// `Kind/Name` pair used by root exclusion matching.
    pub fn exclusion_key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Name of the CRD backing this kind (`plural.group`), or `None` when
    /// the kind is served by the built-in apiserver.
    pub fn crd_name(&self) -> Option<String> {
        if BUILTIN_GROUPS.contains(&self.group.as_str()) {
            return None;
        }
        Some(format!("{}.{}", self.plural, self.group))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Parse apiVersion into (group, version).
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Simple pluralization for Kubernetes resource kinds.
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

/// Read an annotation off a dynamic object.
pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Read a label off a dynamic object.
pub fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// True when the object carries the ownership label with the expected value.
pub fn is_managed(obj: &DynamicObject) -> bool {
    label(obj, crate::MANAGED_BY_LABEL) == Some(crate::MANAGED_BY_VALUE)
}

/// Serialize a dynamic object to its full JSON representation.
pub fn to_value(obj: &DynamicObject) -> Result<serde_json::Value, Error> {
    Ok(serde_json::to_value(obj)?)
}

/// Deserialize a full JSON representation back into a dynamic object.
pub fn from_value(value: serde_json::Value) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(value)?)
}
