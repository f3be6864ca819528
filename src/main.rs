use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_agent::{AgentLoop, AgentRequest};
use strand_core::config::{AppConfig, ModelConfig};
use strand_core::traits::{NoopRecorder, RunRecorder};
use strand_tools::ToolRegistry;
use strand_workflow::{
    agent_frames, ConversationTurn, JsonlRecorder, NodeServices, RunMode, RunReport, SseEncoder,
    WorkflowGraph, WorkflowRunner, DONE_SENTINEL,
};

#[derive(Parser)]
#[command(name = "strand", version, about = "Run LLM workflow graphs and tool-using agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml", env = "STRAND_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow graph in batch mode
    Run {
        /// Graph payload (JSON)
        graph: PathBuf,
        /// Run input as key=value; JSON values are parsed, anything else is a string
        #[arg(short, long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, Value)>,
    },
    /// Run one conversational turn of a chatflow graph
    Chat {
        graph: PathBuf,
        #[arg(short, long)]
        query: String,
        /// Conversation to continue (a new one is started if omitted)
        #[arg(long)]
        conversation: Option<String>,
        #[arg(short, long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, Value)>,
    },
    /// Run the agent loop on a single prompt
    Agent {
        /// The prompt (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
        /// System prompt, overriding `[agent] system_prompt`
        #[arg(long)]
        system: Option<String>,
        /// Comma-separated tool names to expose
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
        #[arg(long)]
        max_iterations: Option<usize>,
    },
    /// Load and check a graph without running it
    Validate {
        graph: PathBuf,
        #[arg(long, value_enum, default_value = "batch")]
        mode: ModeArg,
    },
    /// List builtin tools
    Tools,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Batch,
    Conversational,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Batch => RunMode::Batch,
            ModeArg::Conversational => RunMode::Conversational,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries only the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tools => {
            let registry = ToolRegistry::with_builtins();
            for name in registry.list() {
                if let Some(tool) = registry.get(name) {
                    println!("{:<24} {}", name, tool.description());
                }
            }
        }
        Commands::Validate { graph, mode } => {
            let graph = load_graph(&graph)?;
            graph.check_mode(mode.into())?;
            graph.check_tools(&ToolRegistry::with_builtins())?;
            println!(
                "ok: {} nodes, {} edges, start node '{}'",
                graph.len(),
                graph.edges().len(),
                graph.start_node().id
            );
        }
        Commands::Run { graph, inputs } => {
            let config = load_config(&cli.config)?;
            let runner = build_runner(&config, &graph)?;
            let inputs: Map<String, Value> = inputs.into_iter().collect();
            let report = stream_run(|sink| async move { runner.run_batch(inputs, &sink).await }).await?;
            report.into_result()?;
        }
        Commands::Chat {
            graph,
            query,
            conversation,
            inputs,
        } => {
            let config = load_config(&cli.config)?;
            let runner = build_runner(&config, &graph)?;
            let conversation_id = conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            info!(conversation_id = %conversation_id, "Chat turn");
            let mut turn = ConversationTurn::new(query, conversation_id);
            turn.inputs = inputs.into_iter().collect();
            let report = stream_run(|sink| async move { runner.run_conversation(turn, &sink).await }).await?;
            report.into_result()?;
        }
        Commands::Agent {
            prompt,
            system,
            tools,
            max_iterations,
        } => {
            let config = load_config(&cli.config)?;
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
            if text.trim().is_empty() {
                anyhow::bail!("empty prompt");
            }
            run_agent(&config, text, system, tools, max_iterations).await?;
        }
    }

    Ok(())
}

/// Load the config file, or build a minimal one from the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    warn!(path = %path.display(), "No config file found, using environment");

    let mut model = ModelConfig::new(std::env::var("STRAND_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()));
    model.api_key = std::env::var("OPENAI_API_KEY").ok();
    model.base_url = std::env::var("OPENAI_BASE_URL").ok();
    Ok(AppConfig {
        model,
        agent: Default::default(),
        engine: Default::default(),
        mcp: None,
        log: None,
    })
}

fn load_graph(path: &Path) -> anyhow::Result<WorkflowGraph> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read graph {}: {}", path.display(), e))?;
    Ok(WorkflowGraph::from_json(&json)?)
}

fn build_runner(config: &AppConfig, graph_path: &Path) -> anyhow::Result<WorkflowRunner> {
    let graph = Arc::new(load_graph(graph_path)?);
    let services = NodeServices::new(strand_llm::create_client(&config.model), config.model.clone())
        .with_tools(ToolRegistry::with_builtins())
        .with_mcp_servers(config.mcp.clone().unwrap_or_default().servers)
        .with_engine(&config.engine);

    let recorder: Arc<dyn RunRecorder> = match &config.log {
        Some(log) if log.enabled => Arc::new(JsonlRecorder::new(log.dir())),
        _ => Arc::new(NoopRecorder),
    };

    Ok(WorkflowRunner::new(graph, Arc::new(services))
        .with_engine(config.engine.clone())
        .with_recorder(recorder)
        .with_cancel(cancel_on_ctrl_c()))
}

/// Drive a run while a writer task frames its events onto stdout.
async fn stream_run<F, Fut>(run: F) -> anyhow::Result<RunReport>
where
    F: FnOnce(strand_workflow::EventSink) -> Fut,
    Fut: std::future::Future<Output = RunReport>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(rx));
    let report = run(tx).await;
    writer.await??;
    Ok(report)
}

async fn write_events<T: Serialize>(mut rx: mpsc::UnboundedReceiver<T>) -> anyhow::Result<()> {
    let mut out = FramedWrite::new(tokio::io::stdout(), SseEncoder);
    while let Some(event) = rx.recv().await {
        out.send(event).await?;
    }
    let stdout = out.get_mut();
    stdout.write_all(DONE_SENTINEL.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn run_agent(
    config: &AppConfig,
    prompt: String,
    system: Option<String>,
    tools: Vec<String>,
    max_iterations: Option<usize>,
) -> anyhow::Result<()> {
    let mcp_servers = config.mcp.clone().unwrap_or_default().servers;
    let mut request = AgentRequest::new(config.model.clone(), prompt);
    request.system_prompt = system.or_else(|| config.agent.system_prompt.clone());
    request.enabled_tools = if tools.is_empty() {
        config.agent.enabled_tools.clone()
    } else {
        tools
    };
    request.mcp_servers = mcp_servers.keys().cloned().collect();
    request.max_iterations = max_iterations.unwrap_or(config.agent.max_iterations);

    let agent = AgentLoop::new(strand_llm::create_client(&config.model), ToolRegistry::with_builtins())
        .with_mcp_servers(mcp_servers)
        .with_cancel(cancel_on_ctrl_c());

    let mut frames = Box::pin(agent_frames(Arc::new(agent).stream(request)));
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = frames.next().await {
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            token.cancel();
        }
    });
    cancel
}

/// Parse `key=value`; the value is taken as JSON when it parses, else as text.
fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
