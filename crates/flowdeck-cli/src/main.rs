mod config;

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowdeck_client::gateway::{CommandGateway, SubmitRequest};
use flowdeck_client::history::{rerun_request, HistoryClient};
use flowdeck_client::session::SessionSupervisor;
use flowdeck_client::stream::{ws_endpoint, StreamClient, StreamConfig};
use flowdeck_core::session::{ActionLogEntry, AgentSignal, IterationProgress, TaskStatus};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::config::{config_path, ConsoleConfig};

#[derive(Parser)]
#[command(name = "flowdeck")]
#[command(about = "Operator console for the browser automation agent", long_about = None)]
struct Cli {
    /// Backend base URL, e.g. http://127.0.0.1:8000
    #[arg(long, global = true)]
    server: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the live session: connectivity, task status, action log
    Watch,
    /// Submit a task and stream its progress until it finishes
    Run {
        instruction: String,
        /// Page to open before the agent starts
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// Text file whose content is appended to the instruction
        #[arg(long)]
        attach: Option<PathBuf>,
    },
    /// Ask the backend to stop the active run (advisory)
    Cancel,
    /// Start the agent's browser process
    Start {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        headless: bool,
    },
    /// Stop the agent's browser process
    Stop,
    /// One-shot backend status
    Status,
    /// Browse and manage past runs
    Flows {
        #[command(subcommand)]
        action: FlowCommands,
    },
    /// Token spend summary
    Costs {
        /// all, today, week or month
        #[arg(long, default_value = "all")]
        range: String,
    },
    /// Credential-profile browser session
    Profile {
        #[command(subcommand)]
        action: ProfileCommands,
    },
    /// Local preferences
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum FlowCommands {
    List {
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Substring match on the instruction
        #[arg(long)]
        filter: Option<String>,
        /// completed or failed
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        id: String,
    },
    Edit {
        id: String,
        instruction: String,
    },
    Rm {
        id: String,
        #[arg(long)]
        yes: bool,
    },
    Clear {
        #[arg(long)]
        yes: bool,
    },
    Rerun {
        id: String,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    Start {
        #[arg(long)]
        url: Option<String>,
    },
    Stop,
    Status,
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Show,
    SetServer { url: String },
    SetProvider { provider: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ConsoleConfig::load_from(&config_path())?;
    let env_server = std::env::var("FLOWDECK_SERVER").ok();
    let server = parse_server(&config.resolve_server(cli.server.as_deref(), env_server.as_deref()))?;
    let gateway = CommandGateway::new(server.clone());
    let history = HistoryClient::new(server.clone());

    match cli.command {
        Commands::Watch => watch_session(server).await?,
        Commands::Run {
            instruction,
            url,
            provider,
            attach,
        } => {
            let mut request = SubmitRequest::new(instruction);
            if let Some(url) = url {
                request = request.with_initial_url(url);
            }
            if let Some(provider) = config.resolve_provider(provider.as_deref()) {
                request = request.with_provider(provider);
            }
            if let Some(path) = attach {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                request = request.with_attachment(&name, &content);
            }
            run_task(server, request).await?;
        }
        Commands::Cancel => {
            let reply = gateway.cancel().await?;
            println!("cancel requested: {}", reply.status);
            if let Some(message) = reply.message {
                println!("  {message}");
            }
            println!("note: the run ends only when a complete/error event arrives");
        }
        Commands::Start { provider, headless } => {
            let provider = config.resolve_provider(provider.as_deref());
            let reply = gateway.start(provider.as_deref(), headless).await?;
            println!("agent: {}", reply.status);
        }
        Commands::Stop => {
            let reply = gateway.stop().await?;
            println!("agent: {}", reply.status);
        }
        Commands::Status => {
            let status = gateway.status().await?;
            println!("browser running : {}", status.browser_running);
            println!("task running    : {}", status.task_running);
            println!("watch clients   : {}", status.connected_clients);
            if let Some(task) = status.current_task {
                println!("current task    : {task}");
            }
        }
        Commands::Flows { action } => flows_command(history, server, action).await?,
        Commands::Costs { range } => {
            let summary = gateway.costs(&range).await?;
            println!(
                "{} workflows, {} tokens, ${:.4} total (${:.4}/workflow)",
                summary.total_workflows,
                summary.total_tokens,
                summary.total_cost,
                summary.avg_cost_per_workflow
            );
            let mut providers: Vec<_> = summary.by_provider.iter().collect();
            providers.sort_by(|a, b| a.0.cmp(b.0));
            for (provider, cost) in providers {
                println!(
                    "- {provider}: {} workflows, {} in / {} out tokens, ${:.4}",
                    cost.workflows, cost.input_tokens, cost.output_tokens, cost.cost
                );
            }
        }
        Commands::Profile { action } => match action {
            ProfileCommands::Start { url } => {
                let reply = gateway.profile_start(url.as_deref()).await?;
                println!("profile browser: {}", reply.status);
                if let Some(message) = reply.message {
                    println!("  {message}");
                }
            }
            ProfileCommands::Stop => {
                let reply = gateway.profile_stop().await?;
                println!("profile browser: {}", reply.status);
            }
            ProfileCommands::Status => {
                let status = gateway.profile_status().await?;
                println!("running : {}", status.profile_browser_running);
                println!("saved   : {}", status.profile_exists);
                if let Some(dir) = status.profile_dir {
                    println!("dir     : {dir} ({:.1} MB)", status.profile_size_mb);
                }
            }
            ProfileCommands::Clear { yes } => {
                if !yes && !confirm("Delete all saved credentials and browser data?")? {
                    println!("aborted");
                    return Ok(());
                }
                let reply = gateway.profile_clear().await?;
                println!("profile: {}", reply.status);
            }
        },
        Commands::Config { action } => {
            let path = config_path();
            let mut config = config;
            match action {
                ConfigCommands::Show => {
                    println!("config file: {}", path.display());
                    println!("server           = {:?}", config.server);
                    println!("default_provider = {:?}", config.default_provider);
                }
                ConfigCommands::SetServer { url } => {
                    parse_server(&url)?;
                    config.server = Some(url);
                    config.save_to(&path)?;
                    println!("saved {}", path.display());
                }
                ConfigCommands::SetProvider { provider } => {
                    config.default_provider = Some(provider);
                    config.save_to(&path)?;
                    println!("saved {}", path.display());
                }
            }
        }
    }

    Ok(())
}

async fn flows_command(
    history: HistoryClient,
    server: Url,
    action: FlowCommands,
) -> Result<()> {
    match action {
        FlowCommands::List {
            limit,
            offset,
            filter,
            status,
        } => {
            let page = history
                .list(limit, offset, filter.as_deref(), status.as_deref())
                .await?;
            println!(
                "{} flows total, showing {} at offset {}",
                page.total,
                page.flows.len(),
                page.offset
            );
            for flow in &page.flows {
                println!(
                    "- [{}] {:9} {:3} actions  {}",
                    flow.id, flow.status, flow.action_count, flow.instruction
                );
            }
        }
        FlowCommands::Show { id } => {
            let detail = history.get(&id).await?;
            println!("id          : {}", detail.id);
            println!("instruction : {}", detail.instruction);
            println!("status      : {}", detail.status);
            if let Some(url) = &detail.initial_url {
                println!("initial url : {url}");
            }
            if let Some(provider) = &detail.provider {
                println!("provider    : {provider}");
            }
            println!("actions     : {}", detail.actions.len());
            if let (Some(tokens), Some(cost)) = (detail.total_tokens, detail.total_cost) {
                println!("spend       : {tokens} tokens, ${cost:.4}");
            }
            if let Some(result) = &detail.result {
                println!("result      : {result}");
            }
            if let Some(error) = &detail.error {
                println!("error       : {error}");
            }
        }
        FlowCommands::Edit { id, instruction } => {
            let updated = history.edit(&id, &instruction).await?;
            println!("updated [{}]: {}", updated.id, updated.instruction);
        }
        FlowCommands::Rm { id, yes } => {
            if !yes && !confirm(&format!("Delete flow {id}? This cannot be undone."))? {
                println!("aborted");
                return Ok(());
            }
            history.delete(&id).await?;
            println!("deleted {id}");
        }
        FlowCommands::Clear { yes } => {
            if !yes && !confirm("Delete the entire flow history? This cannot be undone.")? {
                println!("aborted");
                return Ok(());
            }
            history.clear_all().await?;
            println!("history cleared");
        }
        FlowCommands::Rerun { id } => {
            let detail = history.get(&id).await?;
            println!("re-running [{}]: {}", detail.id, detail.instruction);
            run_task(server, rerun_request(&detail)).await?;
        }
    }
    Ok(())
}

/// Live dashboard loop. Prints connectivity, task status and new action-log
/// entries as they fold in; ctrl-c exits.
async fn watch_session(server: Url) -> Result<()> {
    let endpoint = ws_endpoint(&server)?;
    let (mut stream, events) = StreamClient::new(StreamConfig::new(endpoint));
    let mut conn = stream.connection_state();
    stream.open();
    let supervisor = SessionSupervisor::new(CommandGateway::new(server), events);
    let mut signals = supervisor.signals();
    let mut printer = Printer::default();

    println!("watching session (ctrl-c to quit)");
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = conn.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("· connection: {}", conn.borrow().as_str());
            }
            signal = signals.recv() => {
                if let Ok(signal) = signal {
                    println!("· agent: {}", signal_line(&signal));
                }
            }
            _ = ticker.tick() => {
                printer.render(&supervisor).await;
            }
        }
    }
    stream.close().await;
    Ok(())
}

/// Submits one task while mirroring its live progress, then reports the
/// backend's final outcome.
async fn run_task(server: Url, request: SubmitRequest) -> Result<()> {
    let endpoint = ws_endpoint(&server)?;
    let (mut stream, events) = StreamClient::new(StreamConfig::new(endpoint));
    stream.open();
    let supervisor = SessionSupervisor::new(CommandGateway::new(server), events);
    let mut printer = Printer::default();

    let submit = supervisor.submit(request);
    tokio::pin!(submit);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let outcome = loop {
        tokio::select! {
            outcome = &mut submit => break outcome,
            _ = ticker.tick() => {
                printer.render(&supervisor).await;
            }
        }
    };
    printer.render(&supervisor).await;
    stream.close().await;

    match outcome {
        Ok(outcome) if outcome.success => {
            println!("done [{}]: {}", outcome.flow_id, outcome.result);
            Ok(())
        }
        Ok(outcome) => {
            println!(
                "failed [{}]: {}",
                outcome.flow_id,
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Incremental renderer over session snapshots. Tracks what was already
/// printed so a begin-session reset starts the log over cleanly.
#[derive(Default)]
struct Printer {
    printed: usize,
    last_status: Option<TaskStatus>,
    last_iteration: Option<IterationProgress>,
}

impl Printer {
    async fn render(&mut self, supervisor: &SessionSupervisor) {
        let snapshot = supervisor.snapshot().await;
        if self.last_status != Some(snapshot.task_status) {
            println!("· task: {}", snapshot.task_status);
            self.last_status = Some(snapshot.task_status);
            if let Some(error) = &snapshot.last_error {
                println!("· error: {error}");
            }
        }
        if snapshot.iteration != self.last_iteration {
            if let Some(iteration) = snapshot.iteration {
                println!("· iteration {}/{}", iteration.current, iteration.max);
            }
            self.last_iteration = snapshot.iteration;
        }
        if self.printed > snapshot.action_log.len() {
            self.printed = 0;
        }
        for entry in snapshot.action_log.iter().skip(self.printed) {
            println!("{}", entry_line(entry));
        }
        self.printed = snapshot.action_log.len();
    }
}

fn entry_line(entry: &ActionLogEntry) -> String {
    let mut line = format!("  [{}] {}", entry.kind, entry.message);
    if let Some(tool) = &entry.tool_name {
        line.push_str(&format!(" tool={tool}"));
    }
    if let Some(url) = &entry.url {
        line.push_str(&format!(" url={url}"));
    }
    if let Some(success) = entry.success {
        line.push_str(if success { " ok" } else { " FAILED" });
    }
    line
}

fn signal_line(signal: &AgentSignal) -> String {
    match signal {
        AgentSignal::BrowserStarted { provider } => match provider {
            Some(provider) => format!("browser started (provider {provider})"),
            None => "browser started".to_string(),
        },
        AgentSignal::BrowserStopped => "browser stopped".to_string(),
        AgentSignal::ProfileBrowserStarted { url } => match url {
            Some(url) => format!("profile browser started at {url}"),
            None => "profile browser started".to_string(),
        },
        AgentSignal::ProfileBrowserStopped => "profile browser stopped".to_string(),
        AgentSignal::ProfileCleared => "profile data cleared".to_string(),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Normalizes the base URL so endpoint joins append instead of replacing
/// the last path segment.
fn parse_server(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid server URL: {raw}"))?;
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowdeck_core::session::ActionKind;

    #[test]
    fn server_url_gets_a_trailing_slash() {
        assert_eq!(
            parse_server("http://127.0.0.1:8000").unwrap().as_str(),
            "http://127.0.0.1:8000/"
        );
        assert_eq!(
            parse_server("http://host:8000/agent").unwrap().as_str(),
            "http://host:8000/agent/"
        );
        assert!(parse_server("not a url").is_err());
    }

    #[test]
    fn entry_line_includes_tool_and_outcome() {
        let entry = ActionLogEntry {
            kind: ActionKind::ToolResult,
            tool_name: Some("navigate".to_string()),
            arguments: None,
            message: "navigate succeeded".to_string(),
            success: Some(true),
            url: Some("https://a.test".to_string()),
            iteration: 2,
            received_at: Utc::now(),
        };
        let line = entry_line(&entry);
        assert!(line.contains("tool-result"));
        assert!(line.contains("tool=navigate"));
        assert!(line.contains("url=https://a.test"));
        assert!(line.ends_with(" ok"));
    }
}
