//! Render result formatting shared by the `render` subcommand.

use std::io::Write;

use kube::api::DynamicObject;
use serde::Serialize;

use crate::assets::Catalog;
use crate::context::RenderContext;
use crate::engine::exclusion::ExclusionSet;
use crate::error::Error;

use super::Renderer;

/// Why an asset did or did not produce an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderStatus {
    /// Rendered and would be applied.
    Included,
    /// Conditions unmet or template produced no output.
    Excluded,
    /// Removed by the HCO's disabled-resources annotation.
    Filtered,
    /// Template rendering failed.
    Error,
}

impl RenderStatus {
    /// Stable uppercase status string used in text output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Included => "INCLUDED",
            Self::Excluded => "EXCLUDED",
            Self::Filtered => "FILTERED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rendering result for a single asset.
#[derive(Debug, Serialize)]
pub struct RenderOutput {
    /// Asset name from the catalog.
    pub asset: String,
    /// Template path within the embedded asset set.
    pub path: String,
    /// Component grouping.
    pub component: String,
    /// What happened.
    pub status: RenderStatus,
    /// Human-readable explanation for non-included statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The rendered object, for included assets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<DynamicObject>,
}

/// Render every cataloged asset and classify the result. Non-included
/// entries are reported only when `show_excluded` is set, except errors,
/// which are always reported.
pub fn build_outputs(
    catalog: &Catalog,
    renderer: &Renderer,
    ctx: &RenderContext,
    exclusions: &ExclusionSet,
    show_excluded: bool,
) -> Vec<RenderOutput> {
    let mut outputs = Vec::with_capacity(catalog.len());

    for asset in catalog.assets() {
        let mut output = RenderOutput {
            asset: asset.name.clone(),
            path: asset.path.clone(),
            component: asset.component.clone(),
            status: RenderStatus::Included,
            reason: None,
            object: None,
        };

        match renderer.render_asset(asset, ctx) {
            Err(e) => {
                output.status = RenderStatus::Error;
                output.reason = Some(e.to_string());
                outputs.push(output);
            }
            Ok(None) => {
                output.status = RenderStatus::Excluded;
                output.reason = Some("conditions not met or template rendered empty".to_string());
                if show_excluded {
                    outputs.push(output);
                }
            }
            Ok(Some(obj)) => {
                let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
                let name = obj.metadata.name.clone().unwrap_or_default();
                if exclusions.contains(&kind, &name) {
                    output.status = RenderStatus::Filtered;
                    output.reason =
                        Some("root exclusion (disabled-resources annotation)".to_string());
                    if show_excluded {
                        outputs.push(output);
                    }
                } else {
                    output.object = Some(obj);
                    outputs.push(output);
                }
            }
        }
    }

    outputs
}

/// Write outputs as multi-document YAML with comment headers. The result is
/// directly usable with `kubectl apply`.
pub fn write_yaml(w: &mut impl Write, outputs: &[RenderOutput]) -> Result<(), Error> {
    for output in outputs {
        writeln!(w, "# Asset: {}", output.asset).map_err(io_err)?;
        writeln!(w, "# Path: {}", output.path).map_err(io_err)?;
        writeln!(w, "# Component: {}", output.component).map_err(io_err)?;
        writeln!(w, "# Status: {}", output.status).map_err(io_err)?;
        if let Some(reason) = &output.reason {
            writeln!(w, "# Reason: {reason}").map_err(io_err)?;
        }
        if let Some(obj) = &output.object {
            let doc = serde_yaml::to_string(obj)
                .map_err(|e| Error::internal(format!("failed to marshal {}: {e}", output.asset)))?;
            w.write_all(doc.as_bytes()).map_err(io_err)?;
        }
        writeln!(w, "---").map_err(io_err)?;
    }
    Ok(())
}

/// Write outputs as a JSON array.
pub fn write_json(w: &mut impl Write, outputs: &[RenderOutput]) -> Result<(), Error> {
    let data = serde_json::to_string_pretty(outputs)?;
    writeln!(w, "{data}").map_err(io_err)
}

/// Write a one-line-per-asset status summary.
pub fn write_status(w: &mut impl Write, outputs: &[RenderOutput]) -> Result<(), Error> {
    for output in outputs {
        let target = output
            .object
            .as_ref()
            .map(|obj| {
                format!(
                    "{}/{}",
                    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?"),
                    obj.metadata.name.as_deref().unwrap_or("?")
                )
            })
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            w,
            "{:<32} {:<10} {:<40} {}",
            output.asset,
            output.status.as_str(),
            target,
            output.reason.as_deref().unwrap_or("")
        )
        .map_err(io_err)?;
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> Error {
    Error::internal(format!("failed to write output: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Loader;
    use crate::context::HardwareFacts;
    use serde_json::json;

    fn ctx(annotations: serde_json::Value) -> RenderContext {
        let hco: kube::api::DynamicObject = serde_json::from_value(json!({
            "apiVersion": "hco.kubevirt.io/v1beta1",
            "kind": "HyperConverged",
            "metadata": {
                "name": "kubevirt-hyperconverged",
                "namespace": "openshift-cnv",
                "annotations": annotations,
            },
        }))
        .unwrap();
        RenderContext::assemble(hco, HardwareFacts::default(), "openshift-cnv")
    }

    #[test]
    fn included_and_excluded_outputs() {
        let catalog = Catalog::load(&Loader::new()).unwrap();
        let renderer = Renderer::new(Loader::new());

        let visible = build_outputs(&catalog, &renderer, &ctx(json!({})), &ExclusionSet::default(), false);
        // Only the unconditional assets render with bare hardware facts.
        assert!(visible.iter().all(|o| o.status == RenderStatus::Included));
        assert!(visible.iter().any(|o| o.asset == "hyperconverged"));
        assert!(visible.iter().any(|o| o.asset == "platform-facts"));

        let all = build_outputs(&catalog, &renderer, &ctx(json!({})), &ExclusionSet::default(), true);
        assert_eq!(all.len(), catalog.len());
        assert!(all.iter().any(|o| o.status == RenderStatus::Excluded));
    }

    #[test]
    fn root_exclusion_filters_rendered_assets() {
        let catalog = Catalog::load(&Loader::new()).unwrap();
        let renderer = Renderer::new(Loader::new());
        let exclusions = ExclusionSet::parse("ConfigMap/virt-autopilot-platform-facts");

        let visible = build_outputs(&catalog, &renderer, &ctx(json!({})), &exclusions, false);
        assert!(!visible.iter().any(|o| o.asset == "platform-facts"));

        let all = build_outputs(&catalog, &renderer, &ctx(json!({})), &exclusions, true);
        let facts = all.iter().find(|o| o.asset == "platform-facts").unwrap();
        assert_eq!(facts.status, RenderStatus::Filtered);
    }

    #[test]
    fn yaml_output_is_kubectl_applyable() {
        let catalog = Catalog::load(&Loader::new()).unwrap();
        let renderer = Renderer::new(Loader::new());
        let outputs = build_outputs(&catalog, &renderer, &ctx(json!({})), &ExclusionSet::default(), false);

        let mut buf = Vec::new();
        write_yaml(&mut buf, &outputs).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("# Asset: platform-facts"));
        assert!(text.contains("kind: ConfigMap"));
        assert!(text.contains("---"));
    }

    #[test]
    fn json_output_is_an_array() {
        let catalog = Catalog::load(&Loader::new()).unwrap();
        let renderer = Renderer::new(Loader::new());
        let outputs = build_outputs(&catalog, &renderer, &ctx(json!({})), &ExclusionSet::default(), false);

        let mut buf = Vec::new();
        write_json(&mut buf, &outputs).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[0]["status"], "INCLUDED");
    }
}
