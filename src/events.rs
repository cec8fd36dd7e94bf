//! Kubernetes Event recording for the autopilot reconciler.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the engine can emit standard Kubernetes Events visible via
//! `kubectl describe hyperconverged`.
//!
//! Events are **parent-centric**: every event references the HCO, not the
//! managed leaf object, so a single `kubectl describe` shows the whole
//! reconciliation story. Events are fire-and-forget: failures are logged as
//! warnings and never propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish a Kubernetes Event referencing the given object.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a new sink reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation. All calls are silently discarded.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Build an ObjectReference for a dynamic object (normally the HCO).
pub fn object_ref(obj: &kube::api::DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: obj.types.as_ref().map(|t| t.api_version.clone()),
        kind: obj.types.as_ref().map(|t| t.kind.clone()),
        name: obj.metadata.name.clone(),
        namespace: obj.metadata.namespace.clone(),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// An asset was rendered and applied
    pub const ASSET_APPLIED: &str = "AssetApplied";
    /// An asset was skipped (self-excluded, root-excluded, or paused)
    pub const ASSET_SKIPPED: &str = "AssetSkipped";
    /// Server-side apply of an asset failed
    pub const APPLY_FAILED: &str = "ApplyFailed";
    /// A live object diverged from the effective desired state
    pub const DRIFT_DETECTED: &str = "DriftDetected";
    /// A drifted object was corrected
    pub const DRIFT_CORRECTED: &str = "DriftCorrected";
    /// A user patch annotation was honored
    pub const PATCH_APPLIED: &str = "PatchApplied";
    /// A user patch annotation was rejected
    pub const INVALID_PATCH: &str = "InvalidPatch";
    /// An apply was denied by the per-object throttle
    pub const THROTTLED: &str = "Throttled";
    /// An asset's target CRD is not established
    pub const CRD_MISSING: &str = "CRDMissing";
    /// A previously-missing managed CRD became established
    pub const CRD_DISCOVERED: &str = "CRDDiscovered";
    /// A live object opted out via mode=unmanaged
    pub const UNMANAGED_MODE: &str = "UnmanagedMode";
    /// Template rendering of an asset failed
    pub const RENDER_FAILED: &str = "RenderFailed";
    /// A full reconciliation pass completed without failures
    pub const RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";
    /// A tombstoned resource was deleted
    pub const TOMBSTONE_DELETED: &str = "TombstoneDeleted";
    /// A tombstoned resource was skipped (label mismatch)
    pub const TOMBSTONE_SKIPPED: &str = "TombstoneSkipped";
    /// Deleting a tombstoned resource failed
    pub const TOMBSTONE_FAILED: &str = "TombstoneFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}
