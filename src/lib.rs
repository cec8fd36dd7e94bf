//! virt-autopilot - automated platform configuration for virtualization workloads
//!
//! virt-autopilot drives a cluster toward an opinionated baseline for KubeVirt
//! workloads. The HyperConverged custom resource (HCO) is both a managed object
//! and the sole source of user intent: from its contents and annotations, plus
//! detected cluster hardware facts, an embedded asset catalog is rendered into
//! concrete Kubernetes objects and reconciled via Server-Side Apply.
//!
//! # Modules
//!
//! - [`assets`] - Embedded asset loader, catalog, and tombstone declarations
//! - [`overrides`] - User-intent annotations (patch, ignore-fields, mode)
//! - [`engine`] - Apply pipeline: applier, patcher, throttle, tombstones
//! - [`context`] - Render context and hardware fact aggregation
//! - [`render`] - Template rendering and render output formatting
//! - [`controller`] - HCO-centric reconciler and watch wiring
//! - [`events`] - Kubernetes Event emission
//! - [`error`] - Error types for the operator

#![cfg_attr(not(test), deny(missing_docs))]

use std::time::Duration;

pub mod assets;
pub mod context;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod overrides;
pub mod render;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator identifier: SSA field manager, event reporter, and label value.
pub const OPERATOR_NAME: &str = "virt-autopilot";

/// Ownership label stamped on every applied object.
pub const MANAGED_BY_LABEL: &str = "autopilot.kubevirt.io/managed-by";

/// Expected value of the ownership label.
pub const MANAGED_BY_VALUE: &str = OPERATOR_NAME;

/// API group of the HyperConverged resource.
pub const HCO_GROUP: &str = "hco.kubevirt.io";

/// API version of the HyperConverged resource.
pub const HCO_VERSION: &str = "v1beta1";

/// Kind of the HyperConverged resource.
pub const HCO_KIND: &str = "HyperConverged";

/// Plural resource name of the HyperConverged resource.
pub const HCO_PLURAL: &str = "hyperconvergeds";

/// CRD name the operator requires at startup.
pub const HCO_CRD_NAME: &str = "hyperconvergeds.hco.kubevirt.io";

/// Conventional singleton name of the HCO.
pub const HCO_NAME: &str = "kubevirt-hyperconverged";

/// Default namespace where the HCO lives.
pub const DEFAULT_NAMESPACE: &str = "openshift-cnv";

/// Periodic resync interval when nothing requested an earlier requeue.
pub const PERIODIC_RESYNC: Duration = Duration::from_secs(300);

/// Apply attempts permitted per object per throttle window.
pub const THROTTLE_CAPACITY: u32 = 5;

/// Throttle window length.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Denials within one window before an edit war is declared.
pub const EDIT_WAR_THRESHOLD: u32 = 3;

/// How long a positive CRD presence answer is cached.
pub const CRD_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default timeout for startup CRD validation.
pub const CRD_VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);
