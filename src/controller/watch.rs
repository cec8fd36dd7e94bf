//! Watch wiring for the controller runtime.
//!
//! At startup we build one primary watch on the HCO, one on CRDs (for soft
//! dependency discovery), and one label-filtered watch per catalog kind
//! whose CRD is currently established. Every watch maps its events to the
//! single HCO key. The watch set is fixed for the process lifetime; growth
//! is handled by a controlled restart, not hot reconfiguration.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, info};

use crate::assets::{Catalog, Loader};
use crate::engine::crd_presence::CrdPresence;
use crate::engine::resource::{parse_api_version, pluralize, ResourceKey};
use crate::error::Error;
use crate::{
    HCO_GROUP, HCO_KIND, HCO_NAME, HCO_PLURAL, HCO_VERSION, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

use super::{error_policy, reconcile, Context};

/// A kind the catalog can produce, derived from its templates at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKind {
    /// Kubernetes kind.
    pub kind: String,
    /// Full apiVersion string.
    pub api_version: String,
    /// Backing CRD name, `None` for built-in kinds.
    pub crd_name: Option<String>,
}

impl CatalogKind {
    /// ApiResource for building a dynamic watch on this kind.
    pub fn api_resource(&self) -> ApiResource {
        let (group, version) = parse_api_version(&self.api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &pluralize(&self.kind))
    }
}

/// Derive the distinct GVKs the catalog can produce by peeking at the
/// identity lines of each template. Template expressions never appear in
/// apiVersion or kind, so a line scan is sufficient.
pub fn catalog_kinds(catalog: &Catalog, loader: &Loader) -> Result<Vec<CatalogKind>, Error> {
    let mut kinds: Vec<CatalogKind> = Vec::new();

    for asset in catalog.assets() {
        let template = loader.read(&asset.path)?;
        let Some((api_version, kind)) = peek_gvk(template) else {
            return Err(Error::catalog(format!(
                "asset {} template declares no apiVersion/kind",
                asset.name
            )));
        };

        if kinds.iter().any(|k| k.kind == kind && k.api_version == api_version) {
            continue;
        }

        let (group, version) = parse_api_version(&api_version);
        let key = ResourceKey::new(&group, &version, &kind, None, "probe");
        kinds.push(CatalogKind {
            crd_name: key.crd_name(),
            kind,
            api_version,
        });
    }

    Ok(kinds)
}

/// Extract the top-level `apiVersion:` and `kind:` values from template
/// text without rendering it.
pub fn peek_gvk(template: &str) -> Option<(String, String)> {
    let mut api_version = None;
    let mut kind = None;

    for line in template.lines() {
        if let Some(rest) = line.strip_prefix("apiVersion:") {
            api_version.get_or_insert_with(|| rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("kind:") {
            kind.get_or_insert_with(|| rest.trim().to_string());
        }
        if api_version.is_some() && kind.is_some() {
            break;
        }
    }

    Some((api_version?, kind?))
}

/// Split the catalog kinds into those watchable now (built-in kinds, plus
/// custom kinds whose CRD is established) and return the watched-kind name
/// set recorded in the reconciler context.
pub async fn partition_watchable(
    kinds: &[CatalogKind],
    crds: &CrdPresence,
) -> Result<(Vec<CatalogKind>, HashSet<String>), Error> {
    let mut watchable = Vec::new();
    let mut names = HashSet::new();

    for kind in kinds {
        let established = match &kind.crd_name {
            None => true,
            Some(crd_name) => crds.is_established(crd_name).await?,
        };
        if established {
            names.insert(kind.kind.clone());
            watchable.push(kind.clone());
        } else {
            info!(kind = %kind.kind, crd = ?kind.crd_name, "CRD not established; kind not watched");
        }
    }

    Ok((watchable, names))
}

/// ApiResource of the HCO.
pub fn hco_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(HCO_GROUP, HCO_VERSION, HCO_KIND);
    ApiResource::from_gvk_with_plural(&gvk, HCO_PLURAL)
}

/// Build and run the controller until shutdown.
///
/// `shutdown` resolves to trigger a graceful stop; it is fed both by the
/// signal handler and by the reconciler's CRD-discovery restart path.
pub async fn run(
    client: Client,
    ctx: Arc<Context>,
    watch_kinds: Vec<CatalogKind>,
    shutdown: impl std::future::Future<Output = ()> + Send + Sync + 'static,
) -> Result<(), Error> {
    let hco_ar = hco_api_resource();
    let namespace = ctx.namespace.clone();

    let hco_api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &namespace, &hco_ar);

    // The HCO watch is unfiltered so unlabeled (not yet adopted) instances
    // are visible. CRDs belong to other operators and are never labeled.
    let mut controller = Controller::new_with(hco_api, watcher::Config::default(), hco_ar.clone())
        .graceful_shutdown_on(shutdown);

    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd_mapper = hco_enqueuer(&hco_ar, &namespace);
    controller = controller.watches_with(
        crd_api,
        (),
        watcher::Config::default(),
        move |_crd: CustomResourceDefinition| Some(crd_mapper()),
    );

    let managed_selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    for kind in watch_kinds {
        if kind.kind == HCO_KIND {
            continue; // already the primary watch
        }
        let ar = kind.api_resource();
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let wc = watcher::Config::default().labels(&managed_selector);
        let mapper = hco_enqueuer(&hco_ar, &namespace);
        info!(kind = %kind.kind, "watching managed kind");
        controller = controller.watches_with(api, ar, wc, move |_obj: DynamicObject| {
            Some(mapper())
        });
    }

    info!("starting controller");
    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(object = %obj.name, ?action, "reconciliation completed"),
                Err(e) => debug!(error = %e, "reconciliation error surfaced to runtime"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}

/// A closure producing the single HCO queue key.
fn hco_enqueuer(
    hco_ar: &ApiResource,
    namespace: &str,
) -> impl Fn() -> ObjectRef<DynamicObject> + Clone {
    let ar = hco_ar.clone();
    let ns = namespace.to_string();
    move || ObjectRef::new_with(HCO_NAME, ar.clone()).within(&ns)
}
