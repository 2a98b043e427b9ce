// Reflow CLI
//
// Decision: Use clap derive for ergonomic argument parsing.
// Decision: `exec` prints the full execution context as JSON so the output
//           can be piped; engine errors exit non-zero.
// Decision: The context store comes from REFLOW_DATABASE_URL when the
//           database is reachable, with an in-memory fallback for local use.

mod demos;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reflow_core::{ReflowConfig, RunOptions, WorkflowRuntime};
use reflow_storage::PostgresContextStore;

#[derive(Parser)]
#[command(name = "reflow")]
#[command(about = "Reflow - durable workflows with deterministic replay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow from a catalog
    Exec {
        /// Catalog to load workflows from (built-in: "demos")
        catalog: String,

        /// Workflow name within the catalog
        workflow: String,

        /// Workflow input as JSON (bare words are taken as strings)
        #[arg(long, short)]
        input: Option<String>,

        /// Resume or rerun an existing execution
        #[arg(long, short)]
        execution_id: Option<String>,

        /// Re-drive a finished execution against its own event log
        #[arg(long)]
        force_replay: bool,
    },

    /// Start the HTTP server on the configured host/port
    Start {
        /// Catalog to serve (built-in: "demos")
        catalog: String,
    },
}

fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn build_runtime(catalog_name: &str, config: ReflowConfig) -> anyhow::Result<WorkflowRuntime> {
    let catalog = match demos::resolve(catalog_name) {
        Ok(catalog) => catalog,
        Err(e) if config.catalog.auto_register => {
            tracing::warn!(catalog = catalog_name, error = %e, "auto-registering built-in workflows");
            demos::catalog()
        }
        Err(e) => return Err(e.into()),
    };

    let mut builder = WorkflowRuntime::builder()
        .config(config.clone())
        .catalog(catalog);

    match PostgresContextStore::connect(&config.database_url).await {
        Ok(store) => {
            store
                .run_migrations()
                .await
                .context("failed to apply database migrations")?;
            tracing::info!(database_url = %config.database_url, "using postgres context store");
            builder = builder.store(Arc::new(store));
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "database unreachable; falling back to in-memory store (executions will not survive this process)"
            );
        }
    }

    Ok(builder.build())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ReflowConfig::load();

    match cli.command {
        Commands::Exec {
            catalog,
            workflow,
            input,
            execution_id,
            force_replay,
        } => {
            let runtime = build_runtime(&catalog, config).await?;

            let mut options = RunOptions::new();
            if let Some(raw) = input.as_deref() {
                options = options.with_input(parse_input(raw));
            }
            if let Some(id) = execution_id {
                options = options.with_execution_id(id);
            }
            if force_replay {
                options = options.force_replay();
            }

            let ctx = runtime.run(&workflow, options).await?;
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }

        Commands::Start { catalog } => {
            let runtime = build_runtime(&catalog, config).await?;
            reflow_api::serve(Arc::new(runtime)).await?;
        }
    }

    Ok(())
}
