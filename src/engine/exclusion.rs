//! Root exclusion: the cluster-level "never apply this Kind/Name" directive.
//!
//! Parsed from the `disabled-resources` annotation on the HCO. Matching is
//! exact and case-sensitive.

use std::collections::HashSet;

/// Annotation key for root exclusion, set on the HCO only.
pub const DISABLED_RESOURCES_ANNOTATION: &str = "autopilot.kubevirt.io/disabled-resources";

/// Set of `Kind/Name` pairs that must never be applied.
#[derive(Debug, Default, Clone)]
pub struct ExclusionSet {
    entries: HashSet<String>,
}

impl ExclusionSet {
    /// Parse the comma-separated `Kind/Name, Kind/Name, ...` annotation value.
    /// Empty segments are ignored.
    pub fn parse(annotation: &str) -> Self {
        let entries = annotation
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { entries }
    }

    /// True when `Kind/Name` is excluded.
    pub fn contains(&self, kind: &str, name: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.entries.contains(&format!("{}/{}", kind, name))
    }

    /// Number of exclusion entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no resources are excluded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
