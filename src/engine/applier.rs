//! Server-side apply of a single managed object.
//!
//! The applier is the only component that writes managed objects to the API
//! server. It stamps the ownership label, decides whether a pre-existing
//! unlabeled object may be adopted, detects drift via a dry-run apply, and
//! performs the real apply under the operator's field manager.
//!
//! All API access goes through the [`ResourceClient`] trait so the pipeline
//! can be tested without a cluster. The production implementation issues
//! direct API calls; these bypass the label-filtered watch cache, which is
//! required to see (and adopt) objects that do not carry the label yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::resource::{self, ResourceKey};
use crate::error::Error;
use crate::{HCO_KIND, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OPERATOR_NAME};

/// Kinds that may be adopted when found without the ownership label.
/// Other actors (OLM, users) legitimately pre-create these.
const ADOPTABLE_KINDS: &[&str] = &[HCO_KIND, "CustomResourceDefinition"];

/// Parameters for a server-side apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyParams {
    /// Submit with DryRunAll; the server validates and returns the merged
    /// object without persisting it.
    pub dry_run: bool,
    /// Force conflicts to resolve in our favor.
    pub force: bool,
}

/// Result of applying one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The object did not exist and was created.
    Created,
    /// The live object already matched the desired state on owned fields.
    Unchanged,
    /// The live object had drifted on owned fields and was corrected.
    DriftCorrected,
    /// A pre-existing unlabeled object of an adoptable kind was stamped.
    Adopted,
}

/// Low-level access to arbitrary cluster resources.
///
/// Production uses [`KubeResourceClient`]; tests use a mock or an in-memory
/// fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch a live object, tolerating NotFound.
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, Error>;

    /// Server-side apply under the operator's field manager. Returns the
    /// server's view of the object (the merged result for dry runs).
    async fn apply(
        &self,
        key: &ResourceKey,
        desired: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject, Error>;

    /// Delete an object, tolerating NotFound.
    async fn delete(&self, key: &ResourceKey) -> Result<(), Error>;

    /// Merge-patch annotations onto a live object.
    async fn patch_annotations(
        &self,
        key: &ResourceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// List cluster nodes (for hardware fact aggregation).
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Fetch a CustomResourceDefinition by name, tolerating NotFound.
    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error>;
}

/// Production [`ResourceClient`] over a `kube::Client`.
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Wrap a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, key: &ResourceKey) -> Api<DynamicObject> {
        let ar = key.api_resource();
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicObject>, Error> {
        match self.api_for(key).get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(
        &self,
        key: &ResourceKey,
        desired: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject, Error> {
        let mut pp = PatchParams::apply(OPERATOR_NAME);
        if params.force {
            pp = pp.force();
        }
        pp.dry_run = params.dry_run;

        let value = resource::to_value(desired)?;
        let applied = self
            .api_for(key)
            .patch(&key.name, &pp, &Patch::Apply(&value))
            .await?;
        Ok(applied)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        match self
            .api_for(key)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_annotations(
        &self,
        key: &ResourceKey,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        self.api_for(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, Error> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(crd) => Ok(Some(crd)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Applies one object: ownership stamp, adoption decision, drift detection,
/// server-side apply.
pub struct Applier {
    client: Arc<dyn ResourceClient>,
}

impl Applier {
    /// Create an applier over the given resource client.
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client }
    }

    /// Apply the effective desired state of one object.
    ///
    /// Returns the server-returned object and what happened. Errors with
    /// [`Error::AdoptionRefused`] when the live object lacks the ownership
    /// label and its kind is not adoptable; such objects are never written.
    pub async fn apply(
        &self,
        key: &ResourceKey,
        mut desired: DynamicObject,
        force: bool,
    ) -> Result<(DynamicObject, ApplyResult), Error> {
        desired
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let real = ApplyParams {
            dry_run: false,
            force,
        };

        let live = match self.client.get(key).await? {
            None => {
                let applied = self.client.apply(key, &desired, real).await?;
                info!(object = %key, "created managed object");
                return Ok((applied, ApplyResult::Created));
            }
            Some(live) => live,
        };

        if !resource::is_managed(&live) {
            if !ADOPTABLE_KINDS.contains(&key.kind.as_str()) {
                return Err(Error::adoption_refused(format!(
                    "{} exists without label {}={} and kind {} is not adoptable",
                    key, MANAGED_BY_LABEL, MANAGED_BY_VALUE, key.kind
                )));
            }
            let applied = self.client.apply(key, &desired, real).await?;
            info!(object = %key, "adopted pre-existing object");
            return Ok((applied, ApplyResult::Adopted));
        }

        if self.matches_live(key, &desired, &live, force).await? {
            debug!(object = %key, "object unchanged");
            return Ok((live, ApplyResult::Unchanged));
        }

        let applied = self.client.apply(key, &desired, real).await?;
        info!(object = %key, "corrected drifted object");
        Ok((applied, ApplyResult::DriftCorrected))
    }

    /// Drift check: dry-run the apply and compare the merged result against
    /// the live object, restricted to the fields our manager owns. Servers
    /// without dry-run support fall back to a structural subset comparison.
    async fn matches_live(
        &self,
        key: &ResourceKey,
        desired: &DynamicObject,
        live: &DynamicObject,
        force: bool,
    ) -> Result<bool, Error> {
        let dry = ApplyParams {
            dry_run: true,
            force,
        };
        match self.client.apply(key, desired, dry).await {
            Ok(merged) => {
                let live_value = resource::to_value(live)?;
                let merged_value = resource::to_value(&merged)?;
                match managed_fieldset(&merged, OPERATOR_NAME) {
                    Some(fields) => {
                        Ok(project(&merged_value, fields) == project(&live_value, fields))
                    }
                    None => Ok(is_subset(&resource::to_value(desired)?, &live_value)),
                }
            }
            Err(e) => {
                debug!(object = %key, error = %e, "dry-run rejected, using structural comparison");
                Ok(is_subset(&resource::to_value(desired)?, &resource::to_value(live)?))
            }
        }
    }
}

/// Extract the FieldsV1 trie our manager owns on an object.
fn managed_fieldset<'a>(obj: &'a DynamicObject, manager: &str) -> Option<&'a Value> {
    obj.metadata
        .managed_fields
        .as_ref()?
        .iter()
        .find(|entry| entry.manager.as_deref() == Some(manager))
        .and_then(|entry| entry.fields_v1.as_ref())
        .map(|fields| &fields.0)
}

/// Project a value through a FieldsV1 trie, keeping only owned parts.
///
/// Trie keys: `f:<name>` selects an object field, `k:{...}` selects a list
/// element by its merge keys, `v:<json>` selects a list element by value,
/// and `.` marks ownership of the enclosing node itself. An empty subtree
/// means the whole subtree at that position is owned.
fn project(value: &Value, fields: &Value) -> Value {
    let Some(map) = fields.as_object() else {
        return value.clone();
    };
    if map.is_empty() {
        return value.clone();
    }

    match value {
        Value::Object(obj) => {
            let mut out = serde_json::Map::new();
            for (fkey, sub) in map {
                if let Some(name) = fkey.strip_prefix("f:") {
                    if let Some(child) = obj.get(name) {
                        out.insert(name.to_string(), project(child, sub));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                for (fkey, sub) in map {
                    if list_entry_matches(item, fkey) {
                        out.push(project(item, sub));
                        break;
                    }
                }
            }
            Value::Array(out)
        }
        other => other.clone(),
    }
}

/// True when a `k:`/`v:` trie key selects the given list element.
fn list_entry_matches(item: &Value, fkey: &str) -> bool {
    if let Some(spec) = fkey.strip_prefix("k:") {
        let Ok(keys) = serde_json::from_str::<Value>(spec) else {
            return false;
        };
        let Some(keys) = keys.as_object() else {
            return false;
        };
        keys.iter().all(|(k, v)| item.get(k) == Some(v))
    } else if let Some(spec) = fkey.strip_prefix("v:") {
        serde_json::from_str::<Value>(spec)
            .map(|v| item == &v)
            .unwrap_or(false)
    } else {
        false
    }
}

/// Structural subset check: every field present in `desired` exists with an
/// equal value in `live`. Arrays compare atomically. Used only when the
/// server cannot answer a dry-run apply.
fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| {
            // Server-populated metadata never appears in desired state,
            // but guard against echoes of it anyway.
            if k == "managedFields" || k == "resourceVersion" || k == "uid" {
                return true;
            }
            l.get(k).map(|lv| is_subset(dv, lv)).unwrap_or(false)
        }),
        (d, l) => d == l,
    }
}
