//! The HCO-centric reconciler.
//!
//! Every watch event enqueues the single HCO key; one reconciliation loads
//! the HCO, renders the full asset catalog in order, applies each asset
//! through the patcher pipeline, and finishes with tombstone cleanup. The
//! HCO asset itself sits at order 0, so it is applied first and then
//! re-fetched as the render context for everything after it.

pub mod watch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

use crate::assets::{load_tombstones, Catalog, Loader, Tombstone};
use crate::context::RenderContextBuilder;
use crate::engine::applier::ResourceClient;
use crate::engine::crd_presence::CrdPresence;
use crate::engine::exclusion::{ExclusionSet, DISABLED_RESOURCES_ANNOTATION};
use crate::engine::resource::ResourceKey;
use crate::engine::throttle::Throttle;
use crate::engine::{PatchOutcome, Patcher};
use crate::engine::tombstone::TombstoneReconciler;
use crate::error::Error;
use crate::events::{self, reasons, EventSink};
use crate::overrides;
use crate::render::Renderer;
use crate::{
    HCO_GROUP, HCO_KIND, HCO_NAME, HCO_VERSION, PERIODIC_RESYNC,
};

use watch::CatalogKind;

/// Callback that triggers a clean process shutdown. Invoked when a managed
/// CRD appears after startup, since the running watch set cannot grow.
pub type ShutdownHandle = Arc<dyn Fn() + Send + Sync>;

/// Shared context for the reconciler.
///
/// Holds everything reconciliation needs; constructed once at startup and
/// shared across reconcile calls.
pub struct Context {
    /// Uncached access to cluster resources.
    pub resources: Arc<dyn ResourceClient>,
    /// Event sink, HCO-centric.
    pub events: Arc<dyn EventSink>,
    /// The validated asset catalog, in apply order.
    pub catalog: Catalog,
    /// The seven-step pipeline runner.
    pub patcher: Patcher,
    /// Embedded tombstone declarations, validated at startup.
    pub tombstones: Vec<Tombstone>,
    /// Deletes tombstoned objects after the asset sequence.
    pub tombstone_reconciler: TombstoneReconciler,
    /// Builds the per-reconciliation render context.
    pub render_contexts: RenderContextBuilder,
    /// CRD presence oracle shared with the patcher.
    pub crds: Arc<CrdPresence>,
    /// Namespace the HCO lives in.
    pub namespace: String,
    /// GVKs the catalog can produce, derived at startup.
    pub catalog_kinds: Vec<CatalogKind>,
    /// Kinds that have live watches in this process.
    pub watched_kinds: HashSet<String>,
    /// Clean shutdown trigger for watch-set growth.
    pub shutdown: ShutdownHandle,
}

impl Context {
    /// Assemble a context from its injectable seams. Loads and validates
    /// the embedded catalog and tombstones (startup fatal on violation).
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        events: Arc<dyn EventSink>,
        namespace: &str,
        watched_kinds: HashSet<String>,
        shutdown: ShutdownHandle,
    ) -> Result<Self, Error> {
        let loader = Loader::new();
        let catalog = Catalog::load(&loader)?;
        let tombstones = load_tombstones(&loader)?;
        let catalog_kinds = watch::catalog_kinds(&catalog, &loader)?;

        let crds = Arc::new(CrdPresence::new(resources.clone()));
        let patcher = Patcher::new(
            resources.clone(),
            Arc::new(Renderer::new(loader)),
            Arc::new(Throttle::default()),
            crds.clone(),
            events.clone(),
        );
        let tombstone_reconciler = TombstoneReconciler::new(resources.clone(), events.clone());
        let render_contexts = RenderContextBuilder::new(resources.clone(), namespace);

        Ok(Self {
            resources,
            events,
            catalog,
            patcher,
            tombstones,
            tombstone_reconciler,
            render_contexts,
            crds,
            namespace: namespace.to_string(),
            catalog_kinds,
            watched_kinds,
            shutdown,
        })
    }

    fn hco_key(&self) -> ResourceKey {
        ResourceKey::new(
            HCO_GROUP,
            HCO_VERSION,
            HCO_KIND,
            Some(&self.namespace),
            HCO_NAME,
        )
    }

    /// Find a catalog kind whose CRD became established after startup.
    /// The running controller cannot add watches, so discovery of one
    /// triggers a controlled restart.
    async fn newly_established_kind(&self) -> Result<Option<CatalogKind>, Error> {
        for kind in &self.catalog_kinds {
            if self.watched_kinds.contains(&kind.kind) {
                continue;
            }
            let Some(crd_name) = &kind.crd_name else {
                continue;
            };
            if self.crds.is_established(crd_name).await? {
                return Ok(Some(kind.clone()));
            }
        }
        Ok(None)
    }
}

/// Reconcile the HyperConverged resource.
#[instrument(skip(hco, ctx), fields(hco = %hco.metadata.name.as_deref().unwrap_or(HCO_NAME)))]
pub async fn reconcile(hco: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, Error> {
    // Always work from a fresh read; the queued object may be stale.
    let Some(hco) = ctx.resources.get(&ctx.hco_key()).await? else {
        debug!("HyperConverged absent; nothing to do");
        return Ok(Action::await_change());
    };

    if !overrides::is_autopilot_enabled(&hco) {
        info!(
            annotation = overrides::ENABLED_ANNOTATION,
            "autopilot is not opted in on the HyperConverged; skipping"
        );
        return Ok(Action::requeue(PERIODIC_RESYNC));
    }

    let hco_ref = events::object_ref(&hco);

    // A newly-established managed CRD means the watch set must grow, which
    // requires a restart. Exit cleanly and let the orchestrator bring us
    // back with the full set.
    if let Some(kind) = ctx.newly_established_kind().await? {
        warn!(kind = %kind.kind, "managed CRD became established; restarting to watch it");
        ctx.events
            .publish(
                &hco_ref,
                EventType::Normal,
                reasons::CRD_DISCOVERED,
                Some(format!(
                    "CRD for {} is now established; restarting to extend the watch set",
                    kind.kind
                )),
            )
            .await;
        (ctx.shutdown)();
        return Ok(Action::await_change());
    }

    let mut render_ctx = ctx.render_contexts.build(&hco).await?;
    let mut exclusions = exclusions_of(&render_ctx.annotations);

    let mut failures = 0usize;
    let mut min_retry: Option<Duration> = None;

    for asset in ctx.catalog.assets() {
        match ctx
            .patcher
            .reconcile_asset(asset, &render_ctx, &exclusions, &hco_ref)
            .await
        {
            Ok(PatchOutcome::Throttled { retry_after }) => {
                min_retry = Some(min_retry.map_or(retry_after, |d| d.min(retry_after)));
            }
            Ok(outcome) => {
                debug!(asset = %asset.name, ?outcome, "asset reconciled");
            }
            Err(e) => {
                error!(asset = %asset.name, error = %e, "asset reconciliation failed");
                failures += 1;
            }
        }

        // Order 0 is the HCO itself: re-fetch it so every later asset
        // renders against post-apply state.
        if asset.reconcile_order == 0 {
            if let Some(fresh) = ctx.resources.get(&ctx.hco_key()).await? {
                render_ctx = ctx.render_contexts.build(&fresh).await?;
                exclusions = exclusions_of(&render_ctx.annotations);
            }
        }
    }

    if let Err(e) = ctx
        .tombstone_reconciler
        .reconcile(&ctx.tombstones, &hco_ref)
        .await
    {
        error!(error = %e, "tombstone cleanup failed");
        failures += 1;
    }

    if failures > 0 {
        return Err(Error::ReconcileFailed { failures });
    }

    ctx.events
        .publish(
            &hco_ref,
            EventType::Normal,
            reasons::RECONCILE_SUCCEEDED,
            Some(format!("Reconciled {} assets", ctx.catalog.len())),
        )
        .await;

    let requeue = min_retry.unwrap_or(PERIODIC_RESYNC).min(PERIODIC_RESYNC);
    Ok(Action::requeue(requeue))
}

/// Error policy: log and requeue with backoff handled by the runtime.
pub fn error_policy(_hco: Arc<DynamicObject>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, "reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

fn exclusions_of(annotations: &std::collections::BTreeMap<String, String>) -> ExclusionSet {
    annotations
        .get(DISABLED_RESOURCES_ANNOTATION)
        .map(|v| ExclusionSet::parse(v))
        .unwrap_or_default()
}
