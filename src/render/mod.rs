//! Asset template rendering.
//!
//! Templates use `${...}` variable syntax and `{%...%}` blocks with strict
//! undefined-variable handling. Rendering is a pure function of
//! (asset, render context): no cluster access happens here. An asset whose
//! conditions are unmet, or whose template renders to nothing, yields `None`
//! (self-exclusion).

pub mod command;
pub mod output;

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::json;

use crate::assets::{self, AssetMetadata, Loader};
use crate::context::RenderContext;
use crate::error::Error;
use kube::api::DynamicObject;

/// Renders catalog assets against a render context.
pub struct Renderer {
    env: Environment<'static>,
    loader: Loader,
}

impl Renderer {
    /// Create a renderer over the embedded asset set.
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded template syntax configuration fails to build,
    /// which would indicate a minijinja API incompatibility.
    pub fn new(loader: Loader) -> Self {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .expect("template syntax configuration is hardcoded and valid");

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        Self { env, loader }
    }

    /// Render one asset. `None` means the asset excluded itself: its
    /// conditions are unmet or its template produced no output.
    pub fn render_asset(
        &self,
        asset: &AssetMetadata,
        ctx: &RenderContext,
    ) -> Result<Option<DynamicObject>, Error> {
        if !asset.conditions_met(ctx) {
            return Ok(None);
        }

        let template = self.loader.read(&asset.path)?;
        let rendered = self
            .env
            .render_str(template, template_values(ctx))
            .map_err(|e| Error::render(format!("asset {}: {e}", asset.name)))?;

        if rendered.trim().is_empty() {
            return Ok(None);
        }

        let obj = assets::parse_object(&rendered)
            .map_err(|e| Error::render(format!("asset {}: {e}", asset.name)))?;
        Ok(Some(obj))
    }
}

/// The value namespace visible to templates.
fn template_values(ctx: &RenderContext) -> serde_json::Value {
    json!({
        "hco": serde_json::to_value(&ctx.hco).unwrap_or_default(),
        "annotations": ctx.annotations,
        "feature_gates": ctx.feature_gates,
        "hardware": ctx.hardware,
        "namespace": ctx.namespace,
    })
}
