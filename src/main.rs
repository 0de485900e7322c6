use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use mcop::config::{generate_id, AppConfig};
use mcop::logging::{init_tracing, LogTarget};
use mcop::mcp_client::discovery::{discover_local, merge_discovered, COMMON_PORTS, DISCOVERY_TIMEOUT};
use mcop::mcp_client::{
    check_configured, probe_url, ConnectionRegistry, McpMethod, ServerDescriptor, ServerHealth,
    ServerSnapshot, DEFAULT_CALL_TIMEOUT, DEFAULT_HTTP_TIMEOUT,
};

/// Monitor and manage MCP servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to $MCOP_CONFIG or the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured servers
    List,
    /// Add a server to the config
    Add {
        name: String,
        /// stdio://<command>, http://… or https://…
        url: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Declared tool name (repeatable)
        #[arg(short, long = "tool")]
        tools: Vec<String>,
    },
    /// Remove a server from the config
    Remove { id: String },
    /// Start a server and show its info and tools
    Info { id: String },
    /// Start a server, send one request and print the result
    Call {
        id: String,
        method: String,
        /// Request params as JSON
        #[arg(short, long)]
        params: Option<String>,
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
    /// Show the status of every configured server
    Status {
        /// Start every server before reporting
        #[arg(long)]
        start: bool,
    },
    /// Check whether an HTTP endpoint is alive
    Probe { url: String },
    /// Check configured HTTP servers and look for more on common localhost ports
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let target = if args.verbose {
        LogTarget::Stderr
    } else {
        LogTarget::File(mcop::data_dir())
    };
    init_tracing(target);

    let config_path = AppConfig::resolve_path(args.config.as_deref());
    let result = run(args.command, &config_path).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "command failed");
    }
    result
}

async fn run(command: Command, config_path: &std::path::Path) -> Result<()> {
    let mut config = AppConfig::load(config_path)?;

    match command {
        Command::List => {
            if config.servers.is_empty() {
                println!("No servers configured ({}).", config_path.display());
            }
            for (i, server) in config.servers.iter().enumerate() {
                println!("{}. {} ({}) - {}", i + 1, server.name, server.id, server.url);
            }
        }

        Command::Add {
            name,
            url,
            description,
            tools,
        } => {
            let id = generate_id(&name);
            if config.get_server(&id).is_some() {
                bail!("a server with id '{id}' already exists");
            }
            let mut server = ServerDescriptor::new(&id, &name, &url);
            server.description = description;
            server.tools = tools;
            server.validate()?;

            config.add_server(server);
            config.save(config_path)?;
            println!("Added server '{name}' with id '{id}'.");
        }

        Command::Remove { id } => {
            if !config.remove_server(&id) {
                bail!("no server with id '{id}'");
            }
            config.save(config_path)?;
            println!("Removed server '{id}'.");
        }

        Command::Info { id } => {
            let registry = registry_for(&config);
            registry.start(&id).await?;

            let outcome = async {
                let info = registry
                    .call(&id, McpMethod::GetServerInfo.as_str(), None, DEFAULT_CALL_TIMEOUT)
                    .await?;
                let tools = registry.refresh_tools(&id, DEFAULT_CALL_TIMEOUT).await?;
                anyhow::Ok((info, tools))
            }
            .await;
            registry.stop(&id).await?;

            let (info, tools) = outcome?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            println!("Tools:");
            for tool in tools {
                println!("  - {tool}");
            }
        }

        Command::Call {
            id,
            method,
            params,
            timeout_ms,
        } => {
            let params = params
                .map(|raw| serde_json::from_str(&raw).context("--params is not valid JSON"))
                .transpose()?;

            let registry = registry_for(&config);
            registry.start(&id).await?;
            let result = registry
                .call(&id, &method, params, Duration::from_millis(timeout_ms))
                .await;
            registry.stop(&id).await?;

            println!("{}", serde_json::to_string_pretty(&result?)?);
        }

        Command::Status { start } => {
            let registry = registry_for(&config);
            if start {
                let ids = registry.ids();
                let attempts = ids.iter().map(|id| registry.start(id));
                for (id, result) in ids.iter().zip(futures::future::join_all(attempts).await) {
                    if let Err(e) = result {
                        eprintln!("{id}: {e}");
                    }
                }
            }
            print_status_table(&registry.snapshot());
            registry.disconnect_all().await;
        }

        Command::Probe { url } => {
            let elapsed = probe_url(&url, DEFAULT_HTTP_TIMEOUT).await?;
            println!("{url} is up ({} ms)", elapsed.as_millis());
        }

        Command::Discover => {
            let (health, found) = tokio::join!(
                check_configured(&config.servers, DISCOVERY_TIMEOUT),
                discover_local(&COMMON_PORTS, DISCOVERY_TIMEOUT)
            );
            if !health.is_empty() {
                print_health(&health);
                println!();
            }

            println!("Found {} server(s) on localhost.", found.len());
            let merged = merge_discovered(&config.servers, found);
            for (i, server) in merged.iter().enumerate() {
                println!("{}. {} ({}) - {}", i + 1, server.name, server.id, server.url);
            }
        }
    }

    Ok(())
}

/// Build a registry from the config. Bad entries are reported and skipped so
/// the remaining servers stay usable.
fn registry_for(config: &AppConfig) -> ConnectionRegistry {
    let (registry, rejected) =
        ConnectionRegistry::from_descriptors(config.servers.clone(), DEFAULT_HTTP_TIMEOUT);
    for e in rejected {
        eprintln!("skipping server: {e}");
    }
    registry
}

fn print_status_table(snapshot: &[ServerSnapshot]) {
    println!(
        "{:<24} {:<11} {:>5} {:<20} {:<20} ERROR",
        "SERVER", "STATUS", "CONN", "STARTED", "LAST RESPONSE"
    );
    for server in snapshot {
        let started = server
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        let responded = server
            .last_response_time
            .map(|t| format!("{} ms", t.as_millis()))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<11} {:>5} {:<20} {:<20} {}",
            server.id,
            server.status.as_str(),
            server.active_connections,
            started,
            responded,
            server.last_error.as_deref().unwrap_or("")
        );
    }
}

fn print_health(health: &[ServerHealth]) {
    println!("Configured HTTP servers:");
    for server in health {
        if server.alive {
            let elapsed = server
                .response_time
                .map(|t| format!("{} ms", t.as_millis()))
                .unwrap_or_else(|| "-".into());
            println!("  {} ({}) - up, {elapsed}", server.name, server.id);
            if !server.tools.is_empty() {
                println!("    tools: {}", server.tools.join(", "));
            }
        } else {
            println!(
                "  {} ({}) - down: {}",
                server.name,
                server.id,
                server.error.as_deref().unwrap_or("no answer")
            );
        }
    }
}
