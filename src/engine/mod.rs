//! The Patched Baseline apply engine.
//!
//! Everything that touches managed objects lives here: the resource identity
//! helpers, the per-object throttle, root exclusion, the CRD presence oracle,
//! the server-side applier, the seven-step patcher pipeline, and the
//! tombstone reconciler.

pub mod applier;
pub mod crd_presence;
pub mod exclusion;
pub mod patcher;
pub mod resource;
pub mod throttle;
pub mod tombstone;

#[cfg(test)]
pub(crate) mod fake;

pub use applier::{Applier, ApplyParams, ApplyResult, KubeResourceClient, ResourceClient};
pub use patcher::{PatchOutcome, Patcher};
pub use resource::ResourceKey;
pub use throttle::{Throttle, ThrottleDecision};
