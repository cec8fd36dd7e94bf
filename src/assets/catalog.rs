//! The asset catalog: what the operator can apply, and when.
//!
//! Loaded once at startup from the embedded `metadata.yaml` and validated;
//! the catalog is immutable afterwards.

use serde::Deserialize;

use super::Loader;
use crate::context::RenderContext;
use crate::error::Error;

/// Whether an asset is always installed or gated behind conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMode {
    /// Installed on every reconciliation (subject only to self-exclusion).
    Always,
    /// Installed only when all conditions are satisfied.
    OptIn,
}

/// A single gating condition on an asset. All conditions on an asset are
/// AND-combined; an empty list is always satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", deny_unknown_fields)]
pub enum AssetCondition {
    /// Satisfied when the HCO annotation `key` equals `value`, or is merely
    /// present when `value` is empty.
    Annotation {
        /// Annotation key on the HCO.
        key: String,
        /// Expected value; empty means presence suffices.
        #[serde(default)]
        value: String,
    },
    /// Satisfied when the named feature gate is enabled on the HCO.
    FeatureGate {
        /// Feature gate name.
        value: String,
    },
    /// Satisfied when the named hardware fact was detected.
    HardwareDetection {
        /// Detector name: gpu, pci, numa, vfio, or usb.
        detector: String,
    },
}

impl AssetCondition {
    /// Evaluate this condition against a render context.
    pub fn is_satisfied(&self, ctx: &RenderContext) -> bool {
        match self {
            Self::Annotation { key, value } => match ctx.annotations.get(key) {
                Some(_) if value.is_empty() => true,
                Some(actual) => actual == value,
                None => false,
            },
            Self::FeatureGate { value } => ctx.feature_gate_enabled(value),
            Self::HardwareDetection { detector } => {
                ctx.hardware.detector(detector).unwrap_or(false)
            }
        }
    }
}

/// Catalog entry for one asset.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetMetadata {
    /// Unique asset name.
    pub name: String,
    /// Path of the template within the embedded asset set.
    pub path: String,
    /// Component the asset belongs to (grouping for humans and tooling).
    pub component: String,
    /// Rollout phase number.
    pub phase: i32,
    /// Whether the asset is always installed or opt-in.
    pub install: InstallMode,
    /// Position in the apply sequence. Order 0 is reserved for the HCO
    /// itself, which doubles as the render context source.
    pub reconcile_order: i32,
    /// Gating conditions, AND-combined.
    #[serde(default)]
    pub conditions: Vec<AssetCondition>,
}

impl AssetMetadata {
    /// True when every condition is satisfied (an empty list always is).
    pub fn conditions_met(&self, ctx: &RenderContext) -> bool {
        self.conditions.iter().all(|c| c.is_satisfied(ctx))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    assets: Vec<AssetMetadata>,
}

/// The validated, immutable asset catalog.
#[derive(Debug)]
pub struct Catalog {
    assets: Vec<AssetMetadata>,
}

impl Catalog {
    /// Load and validate the catalog from the embedded `metadata.yaml`.
    pub fn load(loader: &Loader) -> Result<Self, Error> {
        let raw = loader.read("metadata.yaml")?;
        let file: CatalogFile = serde_yaml::from_str(raw)
            .map_err(|e| Error::catalog(format!("invalid metadata.yaml: {e}")))?;
        Self::validate(file.assets, loader)
    }

    fn validate(mut assets: Vec<AssetMetadata>, loader: &Loader) -> Result<Self, Error> {
        let mut seen = std::collections::HashSet::new();
        for asset in &assets {
            if !seen.insert(asset.name.clone()) {
                return Err(Error::catalog(format!("duplicate asset name {}", asset.name)));
            }
            if asset.install == InstallMode::OptIn && asset.conditions.is_empty() {
                return Err(Error::catalog(format!(
                    "asset {} is opt-in but has no conditions and would be unreachable",
                    asset.name
                )));
            }
            loader.read(&asset.path).map_err(|_| {
                Error::catalog(format!(
                    "asset {} references missing template {}",
                    asset.name, asset.path
                ))
            })?;
            for condition in &asset.conditions {
                if let AssetCondition::HardwareDetection { detector } = condition {
                    if !matches!(detector.as_str(), "gpu" | "pci" | "numa" | "vfio" | "usb") {
                        return Err(Error::catalog(format!(
                            "asset {} uses unknown hardware detector {detector:?}",
                            asset.name
                        )));
                    }
                }
            }
        }

        // Apply sequence: increasing reconcile_order, name breaks ties.
        assets.sort_by(|a, b| {
            a.reconcile_order
                .cmp(&b.reconcile_order)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(Self { assets })
    }

    /// Assets in apply order.
    pub fn assets(&self) -> &[AssetMetadata] {
        &self.assets
    }

    /// Look up an asset by name.
    pub fn get(&self, name: &str) -> Option<&AssetMetadata> {
        self.assets.iter().find(|a| a.name == name)
    }

    /// Number of cataloged assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// True when the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
