//! The Patched Baseline pipeline.
//!
//! For each asset, in order:
//!
//! 1. Render the opinionated state from the template.
//! 2. Fetch the live object; honor unmanaged mode, the reconcile-paused
//!    marker, and root exclusion.
//! 3. Decode override annotations from the live object.
//! 4. Apply the user patch to the opinionated state in memory.
//! 5. Mask ignored fields by copying their live values into the desired
//!    state.
//! 6. Gate on the per-object throttle.
//! 7. Apply the effective desired state with forced ownership.
//!
//! Invalid user intent skips the object and surfaces as an event; it never
//! fails the surrounding reconciliation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::assets::AssetMetadata;
use crate::context::RenderContext;
use crate::engine::applier::{Applier, ApplyResult, ResourceClient};
use crate::engine::crd_presence::CrdPresence;
use crate::engine::exclusion::ExclusionSet;
use crate::engine::resource::{self, ResourceKey};
use crate::engine::throttle::{Throttle, ThrottleDecision};
use crate::error::Error;
use crate::events::{reasons, EventSink};
use crate::overrides::{self, RECONCILE_PAUSED_ANNOTATION};
use crate::render::Renderer;

/// What happened to one asset in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The effective desired state reached the applier.
    Applied(ApplyResult),
    /// Conditions unmet or the template rendered empty.
    SkippedConditions,
    /// The HCO's disabled-resources annotation excludes this object.
    SkippedExcluded,
    /// The live object opted out via mode=unmanaged.
    SkippedUnmanaged,
    /// The live object carries the reconcile-paused marker.
    SkippedPaused,
    /// Override annotations were invalid; the object was left alone.
    SkippedInvalidOverride,
    /// The target kind's CRD is not established.
    SkippedMissingCrd,
    /// The apply was denied by the throttle.
    Throttled {
        /// Time until the throttle window rolls.
        retry_after: Duration,
    },
}

/// Runs the pipeline for individual assets.
pub struct Patcher {
    client: Arc<dyn ResourceClient>,
    applier: Applier,
    renderer: Arc<Renderer>,
    throttle: Arc<Throttle>,
    crds: Arc<CrdPresence>,
    events: Arc<dyn EventSink>,
}

impl Patcher {
    /// Wire up a patcher from its collaborators.
    pub fn new(
        client: Arc<dyn ResourceClient>,
        renderer: Arc<Renderer>,
        throttle: Arc<Throttle>,
        crds: Arc<CrdPresence>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            applier: Applier::new(client.clone()),
            client,
            renderer,
            throttle,
            crds,
            events,
        }
    }

    /// Reconcile a single asset against the cluster.
    ///
    /// Returns `Err` only for failures worth a requeue (render errors, apply
    /// errors, adoption refusals). User-intent problems and gating skips
    /// come back as non-error outcomes so the rest of the sequence proceeds.
    pub async fn reconcile_asset(
        &self,
        asset: &AssetMetadata,
        ctx: &RenderContext,
        exclusions: &ExclusionSet,
        hco_ref: &ObjectReference,
    ) -> Result<PatchOutcome, Error> {
        let rendered = match self.renderer.render_asset(asset, ctx) {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                debug!(asset = %asset.name, "asset self-excluded");
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::ASSET_SKIPPED,
                    format!("Asset {} excluded itself", asset.name),
                )
                .await;
                return Ok(PatchOutcome::SkippedConditions);
            }
            Err(e) => {
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::RENDER_FAILED,
                    format!("Asset {} failed to render: {e}", asset.name),
                )
                .await;
                return Err(e);
            }
        };

        let key = ResourceKey::from_object(&rendered)?;

        if exclusions.contains(&key.kind, &key.name) {
            info!(asset = %asset.name, object = %key, "object disabled by root exclusion");
            self.emit(
                hco_ref,
                EventType::Normal,
                reasons::ASSET_SKIPPED,
                format!("{key} disabled via disabled-resources"),
            )
            .await;
            return Ok(PatchOutcome::SkippedExcluded);
        }

        if let Some(crd_name) = key.crd_name() {
            if !self.crds.is_established(&crd_name).await? {
                info!(asset = %asset.name, crd = %crd_name, "target CRD not established");
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::CRD_MISSING,
                    format!("Skipping {key}: CRD {crd_name} is not established"),
                )
                .await;
                return Ok(PatchOutcome::SkippedMissingCrd);
            }
        }

        let live = self.client.get(&key).await?;

        if let Some(live) = &live {
            if overrides::is_unmanaged(live) {
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::UNMANAGED_MODE,
                    format!("{key} is unmanaged; leaving it alone"),
                )
                .await;
                return Ok(PatchOutcome::SkippedUnmanaged);
            }
            if overrides::is_paused(live) {
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::ASSET_SKIPPED,
                    format!(
                        "{key} reconciliation is paused; remove the {RECONCILE_PAUSED_ANNOTATION} annotation to resume"
                    ),
                )
                .await;
                return Ok(PatchOutcome::SkippedPaused);
            }
        }

        let user = match live.as_ref().map(overrides::decode).transpose() {
            Ok(user) => user.unwrap_or_default(),
            Err(e) => {
                warn!(object = %key, error = %e, "invalid override annotations");
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::INVALID_PATCH,
                    format!("{key}: {e}"),
                )
                .await;
                return Ok(PatchOutcome::SkippedInvalidOverride);
            }
        };

        let mut desired_value = resource::to_value(&rendered)?;

        if let Some(patch) = &user.patch {
            if let Err(e) = json_patch::patch(&mut desired_value, patch) {
                warn!(object = %key, error = %e, "user patch failed to apply");
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::INVALID_PATCH,
                    format!("{key}: patch failed to apply: {e}"),
                )
                .await;
                return Ok(PatchOutcome::SkippedInvalidOverride);
            }
            self.emit(
                hco_ref,
                EventType::Normal,
                reasons::PATCH_APPLIED,
                format!("User patch applied to {key}"),
            )
            .await;
        }

        if let Some(live) = &live {
            let live_value = resource::to_value(live)?;
            for ptr in &user.ignore_fields {
                // Absent in live means there is nothing to yield.
                if let Ok(value) = ptr.resolve(&live_value) {
                    let value = value.clone();
                    ptr.assign(&mut desired_value, value).map_err(|e| {
                        Error::invalid_override(format!("cannot assign ignored field {ptr}: {e}"))
                    })?;
                }
            }
        }

        let desired = resource::from_value(desired_value)?;

        match self.throttle.check(&key.throttle_key()) {
            ThrottleDecision::Allowed => {}
            ThrottleDecision::Denied {
                retry_after,
                edit_war,
            } => {
                warn!(object = %key, ?retry_after, edit_war, "apply throttled");
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::THROTTLED,
                    format!("{key} throttled; retry in {}s", retry_after.as_secs()),
                )
                .await;
                if edit_war {
                    self.pause_object(&key, &live).await;
                }
                return Ok(PatchOutcome::Throttled { retry_after });
            }
        }

        match self.applier.apply(&key, desired, true).await {
            Ok((_, result)) => {
                self.emit_apply_result(hco_ref, &key, result).await;
                Ok(PatchOutcome::Applied(result))
            }
            Err(e) => {
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::APPLY_FAILED,
                    format!("{key}: {e}"),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Stamp the edit-war pause marker on the live object. A human removes
    /// it once the competing writer is dealt with.
    async fn pause_object(&self, key: &ResourceKey, live: &Option<DynamicObject>) {
        if live.is_none() {
            return;
        }
        let annotations = BTreeMap::from([(
            RECONCILE_PAUSED_ANNOTATION.to_string(),
            "true".to_string(),
        )]);
        match self.client.patch_annotations(key, &annotations).await {
            Ok(()) => {
                warn!(object = %key, "edit war detected; paused reconciliation of this object")
            }
            Err(e) => warn!(object = %key, error = %e, "failed to stamp reconcile-paused"),
        }
    }

    async fn emit_apply_result(
        &self,
        hco_ref: &ObjectReference,
        key: &ResourceKey,
        result: ApplyResult,
    ) {
        match result {
            ApplyResult::Created => {
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::ASSET_APPLIED,
                    format!("Created {key}"),
                )
                .await;
            }
            ApplyResult::Adopted => {
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::ASSET_APPLIED,
                    format!("Adopted pre-existing {key}"),
                )
                .await;
            }
            ApplyResult::DriftCorrected => {
                self.emit(
                    hco_ref,
                    EventType::Warning,
                    reasons::DRIFT_DETECTED,
                    format!("{key} drifted from the desired state"),
                )
                .await;
                self.emit(
                    hco_ref,
                    EventType::Normal,
                    reasons::DRIFT_CORRECTED,
                    format!("Corrected drift on {key}"),
                )
                .await;
            }
            ApplyResult::Unchanged => {}
        }
    }

    async fn emit(
        &self,
        hco_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.events.publish(hco_ref, type_, reason, Some(note)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{Catalog, Loader};
    use crate::context::HardwareFacts;
    use crate::engine::fake::{FakeCluster, RecordingSink};
    use crate::overrides::{IGNORE_FIELDS_ANNOTATION, MODE_ANNOTATION, PATCH_ANNOTATION};
    use crate::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, THROTTLE_WINDOW};
    use serde_json::json;

    struct Harness {
        cluster: Arc<FakeCluster>,
        sink: Arc<RecordingSink>,
        patcher: Patcher,
        catalog: Catalog,
    }

    fn harness(throttle: Throttle) -> Harness {
        let cluster = Arc::new(FakeCluster::new());
        let sink = Arc::new(RecordingSink::new());
        let patcher = Patcher::new(
            cluster.clone(),
            Arc::new(Renderer::new(Loader::new())),
            Arc::new(throttle),
            Arc::new(CrdPresence::new(cluster.clone())),
            sink.clone(),
        );
        Harness {
            cluster,
            sink,
            patcher,
            catalog: Catalog::load(&Loader::new()).unwrap(),
        }
    }

    fn ctx(hardware: HardwareFacts) -> RenderContext {
        let hco: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "hco.kubevirt.io/v1beta1",
            "kind": "HyperConverged",
            "metadata": {
                "name": "kubevirt-hyperconverged",
                "namespace": "openshift-cnv",
                "annotations": {"autopilot.kubevirt.io/enabled": "true"},
            },
        }))
        .unwrap();
        RenderContext::assemble(hco, hardware, "openshift-cnv")
    }

    fn facts_key() -> ResourceKey {
        ResourceKey::new(
            "",
            "v1",
            "ConfigMap",
            Some("openshift-cnv"),
            "virt-autopilot-platform-facts",
        )
    }

    fn annotate_live(cluster: &FakeCluster, key: &ResourceKey, annotations: serde_json::Value) {
        let mut obj = cluster.object(key).unwrap();
        let map = obj.metadata.annotations.get_or_insert_with(Default::default);
        for (k, v) in annotations.as_object().unwrap() {
            map.insert(k.clone(), v.as_str().unwrap().to_string());
        }
        cluster.insert(obj);
    }

    async fn reconcile_facts(h: &Harness, ctx: &RenderContext) -> Result<PatchOutcome, Error> {
        let asset = h.catalog.get("platform-facts").unwrap();
        h.patcher
            .reconcile_asset(asset, ctx, &ExclusionSet::default(), &ObjectReference::default())
            .await
    }

    #[tokio::test]
    async fn baseline_apply_creates_labeled_object() {
        let h = harness(Throttle::default());
        let outcome = reconcile_facts(&h, &ctx(HardwareFacts::default())).await.unwrap();

        assert_eq!(outcome, PatchOutcome::Applied(ApplyResult::Created));
        assert!(h.sink.has_reason(reasons::ASSET_APPLIED));

        let live = h.cluster.object(&facts_key()).unwrap();
        assert_eq!(
            live.metadata.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );
    }

    #[tokio::test]
    async fn second_reconcile_without_change_is_unchanged() {
        let h = harness(Throttle::default());
        let render_ctx = ctx(HardwareFacts::default());

        reconcile_facts(&h, &render_ctx).await.unwrap();
        let second = reconcile_facts(&h, &render_ctx).await.unwrap();

        assert_eq!(second, PatchOutcome::Applied(ApplyResult::Unchanged));
        assert_eq!(h.cluster.write_count(), 1, "second pass must not write");
        assert!(!h.sink.has_reason(reasons::DRIFT_CORRECTED));
    }

    #[tokio::test]
    async fn user_patch_is_honored() {
        let h = harness(Throttle::default());
        let render_ctx = ctx(HardwareFacts::default());
        reconcile_facts(&h, &render_ctx).await.unwrap();

        annotate_live(
            &h.cluster,
            &facts_key(),
            json!({PATCH_ANNOTATION: r#"[{"op":"replace","path":"/data/gpuPresent","value":"always"}]"#}),
        );

        let outcome = reconcile_facts(&h, &render_ctx).await.unwrap();
        assert!(matches!(outcome, PatchOutcome::Applied(_)));
        assert!(h.sink.has_reason(reasons::PATCH_APPLIED));

        let live = h.cluster.object(&facts_key()).unwrap();
        assert_eq!(live.data["data"]["gpuPresent"], "always");
    }

    #[tokio::test]
    async fn ignored_fields_yield_to_other_owners() {
        let h = harness(Throttle::default());
        let render_ctx = ctx(HardwareFacts::default());
        reconcile_facts(&h, &render_ctx).await.unwrap();

        // A human hand-edits the field and tells us to leave it alone.
        let mut live = h.cluster.object(&facts_key()).unwrap();
        live.data["data"]["gpuPresent"] = json!("hand-edited");
        h.cluster.insert(live);
        annotate_live(
            &h.cluster,
            &facts_key(),
            json!({IGNORE_FIELDS_ANNOTATION: "/data/gpuPresent"}),
        );

        let outcome = reconcile_facts(&h, &render_ctx).await.unwrap();
        assert_eq!(outcome, PatchOutcome::Applied(ApplyResult::Unchanged));
        assert!(!h.sink.has_reason(reasons::DRIFT_CORRECTED));

        let live = h.cluster.object(&facts_key()).unwrap();
        assert_eq!(live.data["data"]["gpuPresent"], "hand-edited");
    }

    #[tokio::test]
    async fn unmanaged_mode_is_a_full_opt_out() {
        let h = harness(Throttle::default());
        let render_ctx = ctx(HardwareFacts::default());
        reconcile_facts(&h, &render_ctx).await.unwrap();
        let writes_before = h.cluster.write_count();

        annotate_live(
            &h.cluster,
            &facts_key(),
            json!({MODE_ANNOTATION: "unmanaged"}),
        );

        let outcome = reconcile_facts(&h, &render_ctx).await.unwrap();
        assert_eq!(outcome, PatchOutcome::SkippedUnmanaged);
        assert!(h.sink.has_reason(reasons::UNMANAGED_MODE));
        assert_eq!(h.cluster.write_count(), writes_before, "no writes while unmanaged");
    }

    #[tokio::test]
    async fn throttle_caps_applies_within_one_window() {
        let h = harness(Throttle::new(5, THROTTLE_WINDOW));
        let render_ctx = ctx(HardwareFacts::default());

        // Another writer keeps flipping the field back between our applies.
        for i in 0..5 {
            let outcome = reconcile_facts(&h, &render_ctx).await.unwrap();
            assert!(matches!(outcome, PatchOutcome::Applied(_)), "apply {i}");

            let mut live = h.cluster.object(&facts_key()).unwrap();
            live.data["data"]["gpuPresent"] = json!(format!("rogue-{i}"));
            h.cluster.insert(live);
        }
        assert_eq!(h.cluster.write_count(), 5);

        match reconcile_facts(&h, &render_ctx).await.unwrap() {
            PatchOutcome::Throttled { retry_after } => {
                assert!(retry_after <= THROTTLE_WINDOW);
            }
            other => panic!("expected throttling, got {other:?}"),
        }
        assert!(h.sink.has_reason(reasons::THROTTLED));
        assert_eq!(h.cluster.write_count(), 5, "denied attempt must not write");
    }

    #[tokio::test]
    async fn edit_war_pauses_the_object() {
        let h = harness(Throttle::new(1, THROTTLE_WINDOW));
        let render_ctx = ctx(HardwareFacts::default());

        reconcile_facts(&h, &render_ctx).await.unwrap();

        // Burn through denials until the edit-war threshold trips.
        let mut last = None;
        for _ in 0..crate::EDIT_WAR_THRESHOLD {
            last = Some(reconcile_facts(&h, &render_ctx).await.unwrap());
        }
        assert!(matches!(last, Some(PatchOutcome::Throttled { .. })));

        let live = h.cluster.object(&facts_key()).unwrap();
        assert_eq!(
            live.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(RECONCILE_PAUSED_ANNOTATION))
                .map(String::as_str),
            Some("true")
        );

        // While paused, the engine skips the object entirely.
        let outcome = reconcile_facts(&h, &render_ctx).await.unwrap();
        assert_eq!(outcome, PatchOutcome::SkippedPaused);
    }

    #[tokio::test]
    async fn sensitive_kind_rejects_user_patch() {
        let h = harness(Throttle::default());
        h.cluster
            .establish_crd("kubeletconfigs.machineconfiguration.openshift.io");

        let render_ctx = ctx(HardwareFacts {
            numa_nodes_present: true,
            ..Default::default()
        });
        let asset = h.catalog.get("cpu-manager-kubelet-config").unwrap();

        // Pre-existing managed object carrying a patch annotation.
        h.cluster.insert(
            serde_json::from_value(json!({
                "apiVersion": "machineconfiguration.openshift.io/v1",
                "kind": "KubeletConfig",
                "metadata": {
                    "name": "virt-autopilot-cpu-manager",
                    "labels": {MANAGED_BY_LABEL: MANAGED_BY_VALUE},
                    "annotations": {PATCH_ANNOTATION: r#"[{"op":"remove","path":"/spec"}]"#},
                },
            }))
            .unwrap(),
        );

        let outcome = h
            .patcher
            .reconcile_asset(asset, &render_ctx, &ExclusionSet::default(), &ObjectReference::default())
            .await
            .unwrap();

        assert_eq!(outcome, PatchOutcome::SkippedInvalidOverride);
        assert!(h.sink.has_reason(reasons::INVALID_PATCH));
        assert_eq!(h.cluster.write_count(), 0, "no writes on rejected patch");
    }

    #[tokio::test]
    async fn missing_crd_skips_asset() {
        let h = harness(Throttle::default());
        let render_ctx = ctx(HardwareFacts {
            numa_nodes_present: true,
            ..Default::default()
        });
        let asset = h.catalog.get("cpu-manager-kubelet-config").unwrap();

        let outcome = h
            .patcher
            .reconcile_asset(asset, &render_ctx, &ExclusionSet::default(), &ObjectReference::default())
            .await
            .unwrap();

        assert_eq!(outcome, PatchOutcome::SkippedMissingCrd);
        assert!(h.sink.has_reason(reasons::CRD_MISSING));
        assert!(h.cluster.applies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn root_exclusion_prevents_apply() {
        let h = harness(Throttle::default());
        let exclusions = ExclusionSet::parse("ConfigMap/virt-autopilot-platform-facts");
        let asset = h.catalog.get("platform-facts").unwrap();

        let outcome = h
            .patcher
            .reconcile_asset(
                asset,
                &ctx(HardwareFacts::default()),
                &exclusions,
                &ObjectReference::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, PatchOutcome::SkippedExcluded);
        assert!(h.sink.has_reason(reasons::ASSET_SKIPPED));
        assert!(h.cluster.applies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmet_conditions_skip_quietly() {
        let h = harness(Throttle::default());
        let asset = h.catalog.get("node-health-check").unwrap();

        let outcome = h
            .patcher
            .reconcile_asset(
                asset,
                &ctx(HardwareFacts::default()),
                &ExclusionSet::default(),
                &ObjectReference::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, PatchOutcome::SkippedConditions);
    }
}
