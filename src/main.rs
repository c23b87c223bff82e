use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mender_core::config::AppConfig;
use mender_core::event::EventBus;
use mender_graph::{
    ConcatCombiner, EchoExecutor, FlowDefinition, FlowGraph, FlowRunner, GraphController,
    RunnerHandle,
};

#[derive(Parser)]
#[command(name = "mender", version, about = "Visual flow runner for test failure triage")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "mender.toml", env = "MENDER_CONFIG")]
    config: PathBuf,

    /// Flow definition (JSON). Default: the built-in triage flow
    #[arg(short, long)]
    flow: Option<PathBuf>,

    /// Delay each task by this many milliseconds
    #[arg(long, default_value = "0")]
    task_delay_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the terminal UI (default)
    Tui,
    /// Submit one prompt, wait for the run to settle, print the snapshot
    Run {
        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
        /// The prompt to submit (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Validate a flow definition and print its execution order
    Validate,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;
    let tui_mode = matches!(cli.command, None | Some(Commands::Tui));

    // The TUI owns the terminal, so its logs go to a file
    let _log_guard = init_tracing(&config, tui_mode)?;

    let flow_path = cli
        .flow
        .clone()
        .or_else(|| config.tui.flow.as_ref().map(PathBuf::from));
    let definition = load_flow(flow_path.as_deref())?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Validate) => {
            let graph = FlowGraph::build(definition)?;
            println!("{} ({})", graph.name, graph.id);
            println!(
                "{} nodes, {} edges",
                graph.nodes().len(),
                graph.edges().len()
            );
            for (step, id) in graph.execution_order().iter().enumerate() {
                let kind = graph.node(id).map(|n| n.kind_name()).unwrap_or("?");
                println!("  {:>2}. {} [{}]", step + 1, id, kind);
            }
        }
        Some(Commands::Run {
            timeout_secs,
            prompt,
        }) => {
            let text = if prompt.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                prompt.join(" ")
            };
            let (runner, _bus) = spawn_runner(&config, definition, cli.task_delay_ms)?;
            let snapshot = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                runner.run_to_completion(text),
            )
            .await
            .with_context(|| format!("run did not settle within {}s", timeout_secs))??;
            runner.shutdown().await?;

            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if snapshot.run.as_ref().and_then(|r| r.outcome) == Some(false) {
                std::process::exit(1);
            }
        }
        None | Some(Commands::Tui) => {
            let (runner, bus) = spawn_runner(&config, definition, cli.task_delay_ms)?;
            info!(flow = %runner.snapshot().flow_id, "Starting TUI");
            mender_tui::run_tui(&config, runner, bus).await?;
        }
    }

    Ok(())
}

fn init_tracing(
    config: &AppConfig,
    to_file: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));

    if to_file {
        let dir = config.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, "mender.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
        Ok(None)
    }
}

fn load_flow(path: Option<&Path>) -> anyhow::Result<FlowDefinition> {
    match path {
        None => Ok(FlowDefinition::triage()),
        Some(p) if p == Path::new("triage") => Ok(FlowDefinition::triage()),
        Some(p) => {
            if !p.exists() {
                warn!(path = %p.display(), "Flow file not found");
            }
            FlowDefinition::load(p).with_context(|| format!("loading flow {}", p.display()))
        }
    }
}

fn spawn_runner(
    config: &AppConfig,
    definition: FlowDefinition,
    task_delay_ms: u64,
) -> anyhow::Result<(RunnerHandle, Arc<EventBus>)> {
    let graph = FlowGraph::build(definition)?;
    let bus = Arc::new(EventBus::new(config.graph.event_capacity));
    let controller = GraphController::new(graph, config.graph.clone(), bus.clone());
    let runner = FlowRunner::new(
        controller,
        Arc::new(EchoExecutor::with_delay(Duration::from_millis(task_delay_ms))),
        Arc::new(ConcatCombiner),
    )
    .with_tick(Duration::from_millis(config.tui.tick_ms));
    let (handle, _join) = runner.spawn();
    Ok((handle, bus))
}
