//! agx - plan and run multi-step tasks, or execute code in the sandbox
//!
//! ## Commands
//!
//! - `plan`: Build an execution plan for a task and print it
//! - `run`: Plan a task and walk it against the built-in tool catalog
//! - `exec`: Run a Python fragment in an isolated sandbox session
//! - `tools`: List the built-in tools and their parameters

mod tools;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agx_core::metrics::METRICS;
use agx_core::obs::PlanSpan;
use agx_core::{
    AgxConfig, Params, PlanGap, PlanWalker, SandboxSession, TaskPlanner, RUN_CODE_TOOL,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "agx")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-ordered task execution with an isolated code sandbox", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML config file with [sandbox] and [walk] sections
    #[arg(long, global = true, env = "AGX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a plan for a task and print its summary
    Plan {
        /// Natural-language task description
        task: String,

        /// Context entries as key=value (value parsed as JSON when possible)
        #[arg(long = "ctx", value_parser = parse_context_entry)]
        context: Vec<(String, Value)>,

        /// Available tools, comma separated (default: built-in catalog)
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },

    /// Plan a task and walk it with the built-in tools
    Run {
        /// Natural-language task description
        task: String,

        /// Context entries as key=value (value parsed as JSON when possible)
        #[arg(long = "ctx", value_parser = parse_context_entry)]
        context: Vec<(String, Value)>,

        /// Directory the file and shell tools operate in
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Disable recovery steps after a failure
        #[arg(long)]
        no_replan: bool,
    },

    /// Execute Python code in a sandbox session
    Exec {
        /// Script file, or `-` for stdin
        #[arg(default_value = "-")]
        file: String,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Memory limit in MiB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Output cap per stream in bytes
        #[arg(long)]
        max_output: Option<usize>,
    },

    /// List built-in tools
    Tools,
}

fn parse_context_entry(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    agx_core::telemetry::init_tracing(cli.json, level);

    let config = match &cli.config {
        Some(path) => AgxConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AgxConfig::default(),
    };

    match cli.command {
        Commands::Plan {
            task,
            context,
            tools,
        } => cmd_plan(&task, context.into_iter().collect(), tools),
        Commands::Run {
            task,
            context,
            root,
            no_replan,
        } => cmd_run(config, &task, context.into_iter().collect(), &root, no_replan).await,
        Commands::Exec {
            file,
            timeout,
            memory_mb,
            max_output,
        } => cmd_exec(config, &file, timeout, memory_mb, max_output).await,
        Commands::Tools => cmd_tools(),
    }
}

/// Tool names `run` can dispatch: the catalog plus the sandboxed code runner.
fn builtin_tool_names(root: &Path) -> Result<Vec<String>> {
    let mut names = tools::registry(root)?.names();
    names.push(RUN_CODE_TOOL.to_string());
    names.sort();
    Ok(names)
}

/// Build and print a plan without executing it
fn cmd_plan(task: &str, context: Params, tools: Vec<String>) -> Result<()> {
    let tools = if tools.is_empty() {
        builtin_tool_names(Path::new("."))?
    } else {
        tools
    };

    let plan = TaskPlanner::new()
        .plan(task, &context, &tools)
        .context("Failed to build plan")?;
    let _span = PlanSpan::enter(&plan.id().to_string());

    let summary = plan.summary();
    info!(steps = plan.len(), "plan ready");
    println!("Plan:   {}", plan.id());
    println!("Digest: {}", summary.digest());
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for gap in plan.gaps() {
        println!("{}", describe_gap(gap));
    }

    Ok(())
}

fn describe_gap(gap: &PlanGap) -> String {
    format!(
        "Gap: {} template needs '{}' ({} step(s) omitted: {})",
        gap.intent,
        gap.missing_tool,
        gap.omitted.len(),
        gap.omitted.join("; ")
    )
}

/// Plan a task and walk it until it settles or Ctrl-C
async fn cmd_run(
    mut config: AgxConfig,
    task: &str,
    context: Params,
    root: &Path,
    no_replan: bool,
) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Root directory {} is not accessible", root.display()))?;
    if no_replan {
        config.walk.replan = false;
    }

    let registry = Arc::new(tools::registry(&root)?);
    let plan = TaskPlanner::new()
        .plan(task, &context, &builtin_tool_names(&root)?)
        .context("Failed to build plan")?;
    println!("Plan {} with {} step(s)", plan.id(), plan.len());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling walk");
            on_interrupt.cancel();
        }
    });

    let walker = PlanWalker::new(registry, config.sandbox, config.walk);
    let (plan, report) = walker
        .run(plan, cancel)
        .await
        .context("Plan walk failed")?;

    for step in plan.steps() {
        let detail = step
            .error()
            .map(str::to_string)
            .or_else(|| step.result().map(Value::to_string))
            .unwrap_or_default();
        println!(
            "{:<8} {:<10} {:<11} {}",
            step.id().as_str(),
            step.tool(),
            step.status().as_str(),
            truncate(&detail, 100)
        );
    }
    for replan in &report.replans {
        println!(
            "Replanned {} -> {} ({})",
            replan.failed, replan.recovery, replan.reason
        );
    }
    println!("{}", serde_json::to_string_pretty(&json!({
        "outcome": report.outcome,
        "durationMs": report.duration_ms,
    }))?);

    METRICS.flush();

    if !report.outcome.is_completed() {
        bail!("Task did not complete");
    }
    Ok(())
}

/// Run a script in a fresh sandbox session
async fn cmd_exec(
    config: AgxConfig,
    file: &str,
    timeout: Option<f64>,
    memory_mb: Option<u64>,
    max_output: Option<usize>,
) -> Result<()> {
    let mut sandbox = config.sandbox;
    if let Some(secs) = timeout {
        sandbox = sandbox.with_timeout_secs(secs);
    }
    if let Some(mb) = memory_mb {
        sandbox = sandbox.with_memory_limit_bytes(mb * 1024 * 1024);
    }
    if let Some(bytes) = max_output {
        sandbox = sandbox.with_max_output_bytes(bytes);
    }

    let mut session = SandboxSession::open(sandbox).context("Invalid sandbox configuration")?;
    let result = if file == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        session.execute(&code).await
    } else {
        session.execute_file(Path::new(file)).await
    }
    .context("Sandbox execution failed")?;
    session.close().context("Failed to remove sandbox directory")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    METRICS.flush();

    if !result.success {
        bail!("Execution failed: {}", result.termination_reason);
    }
    Ok(())
}

/// List the built-in tools
fn cmd_tools() -> Result<()> {
    let registry = tools::registry(Path::new("."))?;
    for name in registry.names() {
        let Some(tool) = registry.get(&name) else {
            continue;
        };
        println!("{name}");
        for (param, spec) in tool.parameter_schema().iter() {
            println!(
                "    {:<14} {:<8} {}{}",
                param,
                format!("{:?}", spec.param_type).to_lowercase(),
                if spec.required { "(required) " } else { "" },
                spec.description
            );
        }
    }
    println!("{RUN_CODE_TOOL}");
    println!("    {:<14} {:<8} (required) Python source run in the sandbox", "code", "string");
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}
