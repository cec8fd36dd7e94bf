//! Label-guarded deletion of retired objects.
//!
//! After the asset sequence, each embedded tombstone declaration is checked
//! against the cluster. An absent object is an idempotent success. A present
//! object is deleted only when its ownership label still matches; anything
//! else is skipped and surfaced as an event. Individual failures never abort
//! the batch.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::assets::Tombstone;
use crate::engine::applier::ResourceClient;
use crate::engine::resource;
use crate::error::Error;
use crate::events::{reasons, EventSink};

/// Result of processing one tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneStatus {
    /// The object was already gone; deletion is idempotent.
    AlreadyAbsent,
    /// The object existed and was deleted now.
    Deleted,
    /// The object exists but is not ours; left alone.
    Skipped,
}

/// Deletes tombstoned resources, best-effort across the batch.
pub struct TombstoneReconciler {
    client: Arc<dyn ResourceClient>,
    events: Arc<dyn EventSink>,
}

impl TombstoneReconciler {
    /// Create a reconciler over the given client and event sink.
    pub fn new(client: Arc<dyn ResourceClient>, events: Arc<dyn EventSink>) -> Self {
        Self { client, events }
    }

    /// Process all tombstones. Returns the number of live objects deleted;
    /// errors on individual tombstones are aggregated into a single error
    /// after the whole batch ran.
    pub async fn reconcile(
        &self,
        tombstones: &[Tombstone],
        hco_ref: &ObjectReference,
    ) -> Result<usize, Error> {
        if tombstones.is_empty() {
            debug!("no tombstones to process");
            return Ok(0);
        }

        let mut deleted = 0usize;
        let mut failures = 0usize;

        for tombstone in tombstones {
            match self.reconcile_one(tombstone, hco_ref).await {
                Ok(TombstoneStatus::Deleted) => deleted += 1,
                Ok(TombstoneStatus::AlreadyAbsent | TombstoneStatus::Skipped) => {}
                Err(e) => {
                    warn!(
                        object = %tombstone.key,
                        path = %tombstone.path,
                        error = %e,
                        "tombstone processing failed"
                    );
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(Error::internal(format!(
                "tombstone processing completed with {failures} error(s)"
            )));
        }

        info!(deleted, total = tombstones.len(), "tombstone processing completed");
        Ok(deleted)
    }

    async fn reconcile_one(
        &self,
        tombstone: &Tombstone,
        hco_ref: &ObjectReference,
    ) -> Result<TombstoneStatus, Error> {
        let key = &tombstone.key;

        let live = match self.client.get(key).await {
            Ok(live) => live,
            Err(e) => {
                self.events
                    .publish(
                        hco_ref,
                        EventType::Warning,
                        reasons::TOMBSTONE_FAILED,
                        Some(format!("{key}: failed to fetch: {e}")),
                    )
                    .await;
                return Err(e);
            }
        };

        let Some(live) = live else {
            debug!(object = %key, "tombstoned object already absent");
            return Ok(TombstoneStatus::AlreadyAbsent);
        };

        if !resource::is_managed(&live) {
            info!(object = %key, "skipping tombstone deletion, ownership label mismatch");
            self.events
                .publish(
                    hco_ref,
                    EventType::Warning,
                    reasons::TOMBSTONE_SKIPPED,
                    Some(format!("{key} exists but is not managed by us; not deleting")),
                )
                .await;
            return Ok(TombstoneStatus::Skipped);
        }

        match self.client.delete(key).await {
            Ok(()) => {
                info!(object = %key, path = %tombstone.path, "deleted tombstoned object");
                self.events
                    .publish(
                        hco_ref,
                        EventType::Normal,
                        reasons::TOMBSTONE_DELETED,
                        Some(format!("Deleted retired object {key}")),
                    )
                    .await;
                Ok(TombstoneStatus::Deleted)
            }
            Err(e) => {
                self.events
                    .publish(
                        hco_ref,
                        EventType::Warning,
                        reasons::TOMBSTONE_FAILED,
                        Some(format!("{key}: failed to delete: {e}")),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
