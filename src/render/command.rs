//! The `render` subcommand: print the manifests the controller would apply.
//!
//! Works from a live cluster HCO by default, or fully offline from an HCO
//! YAML file with `--file` (hardware facts then default to absent, since no
//! nodes can be listed).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::assets::{self, Catalog, Loader};
use crate::context::{HardwareFacts, RenderContext, RenderContextBuilder};
use crate::engine::applier::{KubeResourceClient, ResourceClient};
use crate::engine::exclusion::{ExclusionSet, DISABLED_RESOURCES_ANNOTATION};
use crate::engine::resource::ResourceKey;
use crate::error::Error;
use crate::{HCO_GROUP, HCO_KIND, HCO_NAME, HCO_VERSION};

use super::output::{build_outputs, write_json, write_status, write_yaml};
use super::Renderer;

/// Output format for rendered manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Multi-document YAML, usable with kubectl apply.
    Yaml,
    /// JSON array of per-asset results.
    Json,
    /// One-line-per-asset status table.
    Status,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// Arguments for the render subcommand.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Render from an HCO YAML file instead of the live cluster.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Namespace where the HyperConverged CR is located.
    #[arg(long, default_value = crate::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,

    /// Also report excluded and filtered assets.
    #[arg(long)]
    pub show_excluded: bool,
}

/// Run the render subcommand.
pub async fn run(args: RenderArgs) -> Result<(), Error> {
    let loader = Loader::new();
    let catalog = Catalog::load(&loader)?;
    let renderer = Renderer::new(loader);

    let ctx = build_context(&args).await?;
    let exclusions = ctx
        .annotations
        .get(DISABLED_RESOURCES_ANNOTATION)
        .map(|v| ExclusionSet::parse(v))
        .unwrap_or_default();

    let outputs = build_outputs(&catalog, &renderer, &ctx, &exclusions, args.show_excluded);

    let mut stdout = std::io::stdout().lock();
    match args.output {
        OutputFormat::Yaml => write_yaml(&mut stdout, &outputs),
        OutputFormat::Json => write_json(&mut stdout, &outputs),
        OutputFormat::Status => write_status(&mut stdout, &outputs),
    }
}

async fn build_context(args: &RenderArgs) -> Result<RenderContext, Error> {
    match &args.file {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::internal(format!("failed to read {}: {e}", path.display()))
            })?;
            let hco = assets::parse_object(&content)?;
            // Offline: no node access, so hardware-gated assets stay excluded.
            Ok(RenderContext::assemble(
                hco,
                HardwareFacts::default(),
                &args.namespace,
            ))
        }
        None => {
            let client = kube::Client::try_default()
                .await
                .map_err(|e| Error::internal(format!("failed to create client: {e}")))?;
            let resources: Arc<dyn ResourceClient> = Arc::new(KubeResourceClient::new(client));

            let hco_key = ResourceKey::new(
                HCO_GROUP,
                HCO_VERSION,
                HCO_KIND,
                Some(&args.namespace),
                HCO_NAME,
            );
            let hco = resources.get(&hco_key).await?.ok_or_else(|| {
                Error::internal(format!(
                    "HyperConverged {} not found in namespace {}",
                    HCO_NAME, args.namespace
                ))
            })?;

            RenderContextBuilder::new(resources, &args.namespace)
                .build(&hco)
                .await
        }
    }
}
