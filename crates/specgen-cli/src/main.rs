use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use specgen_core::catalog::TemplateCatalog;
use specgen_core::spec;
use specgen_pipeline::config::GenerationConfig;
use specgen_pipeline::metrics::{GenerationMetrics, LoggingMetricsBackend};
use specgen_pipeline::orchestrator::Orchestrator;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "specgen", about = "Generate Playwright tests from YAML screen specs")]
struct Cli {
    /// Config file (defaults to the user config dir, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the test file for one spec and print the result as JSON
    Generate {
        /// Spec file (YAML)
        spec: PathBuf,

        /// Directory to write the test file into
        #[arg(long)]
        out: PathBuf,

        /// Who requested the run, recorded in the result
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Show which cases would use a template and which would go to the LLM
    Plan {
        /// Spec file (YAML)
        spec: PathBuf,
    },
    /// List the built-in templates
    Templates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON result
    let filter = EnvFilter::try_from_env("SPECGEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = GenerationConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Command::Generate { spec, out, actor } => {
            tracing::info!(
                provider = ?config.llm.provider,
                model = %config.llm.model,
                threshold = config.selection.threshold,
                "Starting specgen"
            );
            let llm = config.build_llm_client();
            let backend = Arc::new(LoggingMetricsBackend);
            let metrics = Arc::new(GenerationMetrics::with_backend(backend));
            let orchestrator =
                Orchestrator::new(TemplateCatalog::builtin(), llm, config).with_metrics(metrics);

            let result = orchestrator.generate(&spec, &out, &actor).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Plan { spec } => {
            let orchestrator =
                Orchestrator::new(TemplateCatalog::builtin(), config.build_llm_client(), config);
            let doc = read_spec(&spec)?;
            orchestrator.check_hints(&doc)?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.plan(&doc))?);
        }
        Command::Templates => {
            let catalog = TemplateCatalog::builtin();
            let templates: Vec<_> = catalog.iter().collect();
            println!("{}", serde_json::to_string_pretty(&templates)?);
        }
    }

    Ok(())
}

fn read_spec(path: &Path) -> Result<spec::TestSpecDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec {}", path.display()))?;
    Ok(spec::parse_str(&raw)?)
}
