use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlflow_core::definition::load_graph;
use sqlflow_core::{Executor, ParamValue, ParameterSet, Run, RunContext, RunStatus, WorkflowGraph};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "sqlflow")]
#[command(about = "Dependency-graph executor for parameterized SQL workflows", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sqlflow.toml", env = "SQLFLOW_CONFIG", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow definition and print its execution waves
    Validate {
        /// Workflow definition (TOML)
        definition: PathBuf,
    },

    /// Execute a workflow against the configured connections
    Run {
        /// Workflow definition (TOML)
        definition: PathBuf,

        /// Runtime parameter, `key=value`; may be repeated
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,

        /// Identifier the caller uses for this run
        #[arg(long)]
        external_run_id: Option<String>,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse `key=value`; integers and floats keep their numeric type.
fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }

    let value = if let Ok(i) = value.parse::<i64>() {
        ParamValue::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ParamValue::Float(f)
    } else {
        ParamValue::Text(value.to_string())
    };
    Ok((key.to_string(), value))
}

fn read_graph(path: &Path) -> Result<WorkflowGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow definition {}", path.display()))?;
    let graph = load_graph(&content)
        .with_context(|| format!("Invalid workflow definition {}", path.display()))?;
    Ok(graph)
}

fn validate(path: &Path) -> Result<()> {
    let graph = read_graph(path)?;
    let waves = graph.topological_order()?;

    println!("workflow {} ({} tasks, {} groups)", graph.id(), graph.len(), graph.groups().len());
    for (i, wave) in waves.iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|t| t.as_str()).collect();
        println!("  wave {}: {}", i, ids.join(", "));
    }
    Ok(())
}

fn print_summary(run: &Run) {
    println!("run {} of {}: {:?}", run.id, run.workflow_id, run.status);
    for node in &run.nodes {
        match &node.error {
            Some(error) => {
                println!("  {:<24} {} ({})", node.id.as_str(), node.state, error.message)
            }
            None => println!("  {:<24} {}", node.id.as_str(), node.state),
        }
    }
    if let Some(completed_at) = run.completed_at {
        let elapsed = completed_at - run.started_at;
        println!("finished in {} ms", elapsed.num_milliseconds());
    }
}

async fn run(config: CliConfig, path: &Path, ctx: RunContext, json: bool) -> Result<()> {
    let graph = read_graph(path)?;
    let executor = Executor::new(Arc::new(config.provider()?), config.executor.clone());

    let report = executor.run(&graph, ctx).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if report.status != RunStatus::Succeeded {
        bail!("workflow {} did not succeed", report.workflow_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlflow_cli=info,sqlflow_core=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Validate { definition } => validate(&definition),
        Command::Run {
            definition,
            params,
            external_run_id,
            json,
        } => {
            let config = CliConfig::load(&args.config)?;
            tracing::info!(
                "Running {} with {} connection(s)",
                definition.display(),
                config.connections.len()
            );

            let parameters: ParameterSet = params.into_iter().collect();
            let mut ctx = RunContext::new().with_parameters(parameters);
            if let Some(id) = external_run_id {
                ctx = ctx.with_external_run_id(id);
            }
            run(config, &definition, ctx, json).await
        }
    }
}
