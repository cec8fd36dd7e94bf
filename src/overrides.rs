//! User-intent override annotations.
//!
//! All user intent reaches the engine through annotations on the *live*
//! object (plus two cluster-level annotations on the HCO). This module
//! decodes and validates them:
//!
//! - `patch`: an RFC 6902 JSON Patch applied in memory to the opinionated
//!   state. Rejected outright on sensitive kinds to prevent privilege
//!   escalation.
//! - `ignore-fields`: comma-separated RFC 6901 pointers the engine yields to
//!   other owners.
//! - `mode=unmanaged`: full opt-out.
//!
//! Invalid annotations never fail the reconciliation; the caller surfaces
//! them as an event and skips the object.

use json_patch::Patch;
use jsonptr::PointerBuf;
use kube::api::DynamicObject;

use crate::engine::resource::annotation;
use crate::error::Error;

/// Annotation carrying an RFC 6902 JSON Patch (textual array).
pub const PATCH_ANNOTATION: &str = "autopilot.kubevirt.io/patch";

/// Annotation listing RFC 6901 pointers the engine relinquishes.
pub const IGNORE_FIELDS_ANNOTATION: &str = "autopilot.kubevirt.io/ignore-fields";

/// Annotation selecting the management mode.
pub const MODE_ANNOTATION: &str = "autopilot.kubevirt.io/mode";

/// The only recognized non-empty mode value.
pub const MODE_UNMANAGED: &str = "unmanaged";

/// Opt-in annotation on the HCO. The engine is inactive unless this is set
/// to "true". This default will be inverted once the project matures.
pub const ENABLED_ANNOTATION: &str = "autopilot.kubevirt.io/enabled";

/// Set on an object when an edit war is detected; the engine skips the
/// object while present. Removal is a human action.
pub const RECONCILE_PAUSED_ANNOTATION: &str = "autopilot.kubevirt.io/reconcile-paused";

/// Kinds where JSON patches are blocked. These resources carry elevated
/// privileges or control cluster security, so a patch on them is a
/// privilege-escalation vector. ignore-fields and unmanaged stay allowed.
const SENSITIVE_KINDS: &[&str] = &[
    "MachineConfig",
    "KubeletConfig",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "ServiceAccount",
    "PodSecurityPolicy",
    "SecurityContextConstraints",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// Decoded user intent from a live object's annotations.
#[derive(Debug, Default)]
pub struct Overrides {
    /// Parsed JSON patch, if the annotation is present.
    pub patch: Option<Patch>,
    /// Parsed ignore-fields pointers.
    pub ignore_fields: Vec<PointerBuf>,
    /// True when `mode=unmanaged`.
    pub unmanaged: bool,
}

/// True when a kind rejects the patch annotation.
pub fn is_sensitive_kind(kind: &str) -> bool {
    SENSITIVE_KINDS.contains(&kind)
}

/// Decode and validate all override annotations on a live object.
pub fn decode(live: &DynamicObject) -> Result<Overrides, Error> {
    let kind = live
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();

    let mut overrides = Overrides::default();

    if let Some(mode) = annotation(live, MODE_ANNOTATION) {
        if !mode.is_empty() && mode != MODE_UNMANAGED {
            return Err(Error::invalid_override(format!(
                "invalid mode annotation {mode:?} (must be {MODE_UNMANAGED:?} or empty)"
            )));
        }
        overrides.unmanaged = mode == MODE_UNMANAGED;
    }

    if let Some(patch_str) = annotation(live, PATCH_ANNOTATION) {
        if is_sensitive_kind(kind) {
            return Err(Error::invalid_override(format!(
                "JSON patches are not allowed on sensitive resource kind {kind}"
            )));
        }
        let patch: Patch = serde_json::from_str(patch_str)
            .map_err(|e| Error::invalid_override(format!("invalid patch annotation: {e}")))?;
        overrides.patch = Some(patch);
    }

    if let Some(pointers) = annotation(live, IGNORE_FIELDS_ANNOTATION) {
        for raw in pointers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let ptr = PointerBuf::parse(raw).map_err(|e| {
                Error::invalid_override(format!("invalid ignore-fields pointer {raw:?}: {e}"))
            })?;
            overrides.ignore_fields.push(ptr);
        }
    }

    Ok(overrides)
}

/// True when a live object opted out via `mode=unmanaged`.
pub fn is_unmanaged(obj: &DynamicObject) -> bool {
    annotation(obj, MODE_ANNOTATION) == Some(MODE_UNMANAGED)
}

/// True when an object carries the reconcile-paused marker.
pub fn is_paused(obj: &DynamicObject) -> bool {
    annotation(obj, RECONCILE_PAUSED_ANNOTATION) == Some("true")
}

/// True when the HCO opts the engine in.
pub fn is_autopilot_enabled(hco: &DynamicObject) -> bool {
    annotation(hco, ENABLED_ANNOTATION) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_with_annotations(kind: &str, annotations: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {
                "name": "x",
                "namespace": "default",
                "annotations": annotations,
            },
        }))
        .unwrap()
    }

    #[test]
    fn decodes_empty_annotations() {
        let obj = object_with_annotations("ConfigMap", json!({}));
        let overrides = decode(&obj).unwrap();
        assert!(overrides.patch.is_none());
        assert!(overrides.ignore_fields.is_empty());
        assert!(!overrides.unmanaged);
    }

    #[test]
    fn decodes_valid_patch() {
        let obj = object_with_annotations(
            "ConfigMap",
            json!({PATCH_ANNOTATION: r#"[{"op":"replace","path":"/data/a","value":"2"}]"#}),
        );
        let overrides = decode(&obj).unwrap();
        assert_eq!(overrides.patch.unwrap().0.len(), 1);
    }

    #[test]
    fn rejects_malformed_patch() {
        let obj = object_with_annotations(
            "ConfigMap",
            json!({PATCH_ANNOTATION: r#"{"op":"replace"}"#}),
        );
        let err = decode(&obj).unwrap_err();
        assert!(matches!(err, Error::InvalidOverride(_)));
    }

    #[test]
    fn rejects_patch_on_sensitive_kinds() {
        for kind in ["MachineConfig", "ClusterRoleBinding", "ServiceAccount"] {
            let obj = object_with_annotations(
                kind,
                json!({PATCH_ANNOTATION: r#"[{"op":"remove","path":"/rules"}]"#}),
            );
            let err = decode(&obj).unwrap_err();
            assert!(
                err.to_string().contains("sensitive"),
                "{kind} should reject patches"
            );
        }
    }

    #[test]
    fn sensitive_kinds_still_allow_ignore_fields_and_unmanaged() {
        let obj = object_with_annotations(
            "KubeletConfig",
            json!({
                IGNORE_FIELDS_ANNOTATION: "/spec/kubeletConfig/reservedSystemCPUs",
                MODE_ANNOTATION: "unmanaged",
            }),
        );
        let overrides = decode(&obj).unwrap();
        assert_eq!(overrides.ignore_fields.len(), 1);
        assert!(overrides.unmanaged);
    }

    #[test]
    fn decodes_ignore_fields_list() {
        let obj = object_with_annotations(
            "ConfigMap",
            json!({IGNORE_FIELDS_ANNOTATION: "/data/a, /data/b"}),
        );
        let overrides = decode(&obj).unwrap();
        assert_eq!(overrides.ignore_fields.len(), 2);
        assert_eq!(overrides.ignore_fields[0].as_str(), "/data/a");
        assert_eq!(overrides.ignore_fields[1].as_str(), "/data/b");
    }

    #[test]
    fn rejects_malformed_pointer() {
        let obj = object_with_annotations(
            "ConfigMap",
            json!({IGNORE_FIELDS_ANNOTATION: "data/a"}),
        );
        let err = decode(&obj).unwrap_err();
        assert!(matches!(err, Error::InvalidOverride(_)));
    }

    #[test]
    fn rejects_unknown_mode() {
        let obj = object_with_annotations("ConfigMap", json!({MODE_ANNOTATION: "automatic"}));
        let err = decode(&obj).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn unmanaged_and_paused_helpers() {
        let unmanaged = object_with_annotations("ConfigMap", json!({MODE_ANNOTATION: "unmanaged"}));
        assert!(is_unmanaged(&unmanaged));

        let paused =
            object_with_annotations("ConfigMap", json!({RECONCILE_PAUSED_ANNOTATION: "true"}));
        assert!(is_paused(&paused));
        assert!(!is_paused(&unmanaged));
    }

    #[test]
    fn autopilot_opt_in_requires_literal_true() {
        let on = object_with_annotations("HyperConverged", json!({ENABLED_ANNOTATION: "true"}));
        assert!(is_autopilot_enabled(&on));

        let off = object_with_annotations("HyperConverged", json!({ENABLED_ANNOTATION: "yes"}));
        assert!(!is_autopilot_enabled(&off));

        let absent = object_with_annotations("HyperConverged", json!({}));
        assert!(!is_autopilot_enabled(&absent));
    }
}
