use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use neuroflow_core::config::AppConfig;
use neuroflow_core::traits::Sink;
use neuroflow_engine::{ExecutionReport, Executor, ExecutorConfig, FsSink, MemorySink, NodeStatus};
use neuroflow_firstlevel::{create_first_level, load_study_events, FirstLevelUnits};

#[derive(Parser)]
#[command(name = "neuroflow", version, about = "Graph-based fMRI first-level workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "neuroflow.toml", env = "NEUROFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, expand and execute the workflow
    Run {
        /// Publish outputs here instead of `engine.out_dir`
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Write the execution report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the expanded graph in execution order
    Plan,
    /// Build and expand the workflow without running it
    Validate,
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config);

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate => {
            config.validate()?;
            let expanded = build(&config)?.expand()?;
            expanded.topological_order()?;
            println!(
                "ok: {} subjects, {} contrasts, {} nodes after expansion",
                config.study.subjects.len(),
                config.study.contrasts.len(),
                expanded.len()
            );
        }
        Commands::Plan => {
            config.validate()?;
            let expanded = build(&config)?.expand()?;
            for (position, id) in expanded.topological_order()?.iter().enumerate() {
                let kind = expanded
                    .node(id)
                    .map(|n| n.kind.label().to_string())
                    .unwrap_or_default();
                println!("{:>4}  {:<48} {}", position + 1, id, kind);
            }
        }
        Commands::Run { out_dir, report } => {
            config.validate()?;
            let expanded = build(&config)?.expand()?;

            let out_dir = out_dir.or_else(|| config.engine.out_dir.clone());
            let sink: Arc<dyn Sink> = match &out_dir {
                Some(dir) => Arc::new(FsSink::new(dir)),
                None => Arc::new(MemorySink::new()),
            };
            let executor = Executor::new(ExecutorConfig::from(&config.engine), sink);

            let result = match executor.run(&expanded).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, kind = ?e.kind(), "Workflow run aborted");
                    return Err(e.into());
                }
            };
            print_summary(&result);
            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)
                    .with_context(|| format!("writing report to {}", path.display()))?;
                info!(path = %path.display(), "Wrote execution report");
            }
            if !result.succeeded {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("neuroflow={},warn", config.log.level))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build(config: &AppConfig) -> anyhow::Result<neuroflow_engine::Workflow> {
    let events = load_study_events(config)?;
    let workflow = create_first_level(config, Arc::new(events), &FirstLevelUnits::placeholders())?;
    Ok(workflow)
}

fn print_summary(report: &ExecutionReport) {
    println!(
        "Run {} of '{}': {} succeeded, {} failed, {} starved in {}ms",
        report.run_id,
        report.workflow,
        report.count(NodeStatus::Succeeded),
        report.count(NodeStatus::Failed),
        report.count(NodeStatus::Starved),
        report.elapsed_ms()
    );
    for failed in report.failed() {
        println!(
            "  failed: {} {}",
            failed.node_id,
            failed.error.as_deref().unwrap_or_default()
        );
    }
    for publication in &report.publications {
        println!("  {}/{}", publication.container, publication.path);
    }
}
