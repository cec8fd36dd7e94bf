//! In-memory cluster fake for pipeline tests.
//!
//! Implements [`ResourceClient`] over a map of objects. Server-side apply is
//! simulated with a recursive merge (desired wins per field) and a
//! generated managedFields entry so the applier's projection-based drift
//! detection behaves like a real apiserver.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use serde_json::{json, Value};

use crate::engine::applier::{ApplyParams, ResourceClient};
use crate::engine::resource::{self, ResourceKey};
use crate::error::Error;
use crate::OPERATOR_NAME;

/// A recorded apply call: object key and whether it was a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedApply {
    pub key: String,
    pub dry_run: bool,
}

/// In-memory stand-in for the API server.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<String, DynamicObject>>,
    established_crds: Mutex<HashSet<String>>,
    nodes: Mutex<Vec<Node>>,
    pub applies: Mutex<Vec<RecordedApply>>,
    pub deletes: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, obj: DynamicObject) {
        let key = ResourceKey::from_object(&obj).unwrap();
        self.objects.lock().unwrap().insert(key.to_string(), obj);
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(&key.to_string()).cloned()
    }

    pub fn establish_crd(&self, name: &str) {
        self.established_crds.lock().unwrap().insert(name.to_string());
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    /// Number of non-dry-run applies recorded.
    pub fn write_count(&self) -> usize {
        self.applies.lock().unwrap().iter().filter(|a| !a.dry_run).count()
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, Error> {
        Ok(self.object(key))
    }

    async fn apply(
        &self,
        key: &ResourceKey,
        desired: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject, Error> {
        self.applies.lock().unwrap().push(RecordedApply {
            key: key.to_string(),
            dry_run: params.dry_run,
        });

        let desired_value = resource::to_value(desired)?;
        let live = self.object(key);
        let mut merged_value = match &live {
            Some(live) => {
                let mut value = resource::to_value(live)?;
                deep_merge(&mut value, &desired_value);
                value
            }
            None => desired_value.clone(),
        };

        merged_value["metadata"]["managedFields"] = json!([{
            "manager": OPERATOR_NAME,
            "operation": "Apply",
            "apiVersion": desired.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
            "fieldsType": "FieldsV1",
            "fieldsV1": fieldset_for(&desired_value),
        }]);

        let merged = resource::from_value(merged_value)?;
        if !params.dry_run {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), merged.clone());
        }
        Ok(merged)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.objects.lock().unwrap().remove(&key.to_string());
        Ok(())
    }

    async fn patch_annotations(
        &self,
        key: &ResourceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&key.to_string())
            .ok_or_else(|| Error::internal(format!("{key} not found")))?;
        obj.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error> {
        if !self.established_crds.lock().unwrap().contains(name) {
            return Ok(None);
        }
        let crd: CustomResourceDefinition = serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": name},
            "spec": {
                "group": name.split_once('.').map(|(_, g)| g).unwrap_or(""),
                "names": {"kind": "", "plural": ""},
                "scope": "Namespaced",
                "versions": []
            },
            "status": {
                "conditions": [{"type": "Established", "status": "True", "reason": "", "message": ""}],
                "acceptedNames": {"kind": "", "plural": ""},
                "storedVersions": []
            }
        }))?;
        Ok(Some(crd))
    }
}

/// Event sink that records every published reason for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.reasons().iter().any(|r| r == reason)
    }
}

#[async_trait]
impl crate::events::EventSink for RecordingSink {
    async fn publish(
        &self,
        _resource_ref: &k8s_openapi::api::core::v1::ObjectReference,
        _type_: kube::runtime::events::EventType,
        reason: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push((reason.to_string(), note));
    }
}

/// Recursive merge with `src` winning; maps merge per key, everything else
/// replaces.
fn deep_merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dest_map.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dest_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dest, src) => *dest = src.clone(),
    }
}

/// Generate the FieldsV1 trie covering every field of the applied value.
fn fieldset_for(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| *k != "managedFields")
                .map(|(k, v)| (format!("f:{k}"), fieldset_for(v)))
                .collect(),
        ),
        _ => json!({}),
    }
}
