//! `llama-legacy-serve` entry point.
//!
//! Settings come from defaults, an optional `--config` file and `LLS_*`
//! environment variables; `--port`, `--model` and `--bin-dir` override them.

mod cli;

use anyhow::{Context, bail, ensure};
use clap::Parser;
use cli::{Cli, Commands};
use lls_gateway::{
    model::{ActiveModel, ModelSelection},
    server::GatewayServer,
    settings::ServeSettings,
    state::AppState,
};
use lls_local_llm::{
    CapabilityRegistry, DispatchConfig, estimate_layers, list_compatible_binaries, preferred_tags,
    select_binary,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "lls_gateway=debug,lls_local_llm=debug,tower_http=debug"
    } else {
        "lls_gateway=info,lls_local_llm=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn assemble_registry(dispatch: &DispatchConfig) -> anyhow::Result<CapabilityRegistry> {
    // Hardware detection shells out synchronously.
    let dispatch = dispatch.clone();
    let registry = tokio::task::spawn_blocking(move || CapabilityRegistry::assemble(&dispatch))
        .await
        .context("capability detection panicked")??;
    Ok(registry)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = ServeSettings::load(cli.config.as_deref())?
        .with_port(cli.port)
        .with_model(cli.model.clone())
        .with_bin_dir(cli.bin_dir.clone());
    init_tracing(cli.verbose, cli.log_json || settings.log_json);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let registry = assemble_registry(&settings.dispatch).await?;
            let active_model = match &settings.model {
                Some(path) => {
                    let selection = ModelSelection::from_file(path)
                        .with_context(|| format!("cannot open model {}", path.display()))?;
                    ActiveModel::new(Some(selection))
                }
                None => {
                    tracing::warn!("no model selected; chat requests will fail until one is set");
                    ActiveModel::default()
                }
            };

            match select_binary(&registry, settings.dispatch.selection_policy) {
                Ok(binary) => info!(binary = %binary.path.display(), "backend binary selected"),
                Err(e) => tracing::warn!(error = %e, "no backend binary usable yet"),
            }

            let state = AppState::new(registry, active_model, settings.dispatch.clone());
            GatewayServer::new(settings.bind_addr(), state).start().await?;
        }

        Commands::Binaries => {
            let registry = assemble_registry(&settings.dispatch).await?;
            let compatible = list_compatible_binaries(&registry);
            let listing: Vec<_> = registry
                .binaries
                .iter()
                .map(|b| {
                    json!({
                        "path": b.path,
                        "tags": b.tags,
                        "compatible": compatible.contains(&b),
                    })
                })
                .collect();
            print_json(&listing)?;
        }

        Commands::Select => {
            let registry = assemble_registry(&settings.dispatch).await?;
            let policy = settings.dispatch.selection_policy;
            let tried = preferred_tags(&registry, policy);
            match select_binary(&registry, policy) {
                Ok(binary) => print_json(&json!({
                    "policy": policy,
                    "tried": tried,
                    "selected": binary,
                }))?,
                Err(e) => bail!(e),
            }
        }

        Commands::Offload {
            vram_bytes,
            model_size_bytes,
            layers,
            percent,
        } => {
            ensure!(
                (0.0..=100.0).contains(&percent),
                "--percent must be between 0 and 100"
            );
            let layer_count = estimate_layers(vram_bytes, model_size_bytes, layers, percent);
            print_json(&json!({
                "layer_count": layer_count,
                "total_layers": layers,
            }))?;
        }

        Commands::Config => print_json(&settings)?,
    }

    Ok(())
}
