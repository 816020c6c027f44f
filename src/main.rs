//! toolgate - inspect and exercise configured tool servers
//!
//! Usage:
//!   toolgate servers
//!   toolgate tools <server>
//!   toolgate agent <agent-id>
//!   toolgate call <server> <tool> [json-arguments]
//!   toolgate health

use anyhow::{bail, Context, Result};
use std::env;
use std::sync::Arc;
use tracing::info;

use toolgate::config::HubConfig;
use toolgate::hub::ToolHub;
use toolgate::mcp::{RmcpConnector, ServerId, ServerStatus};
use toolgate::paths;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toolgate=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }
    if matches!(args[1].as_str(), "help" | "--help" | "-h") {
        print_usage();
        return Ok(());
    }

    let config_path = paths::config_path();
    let config = HubConfig::load(&config_path).context("failed to load config")?;
    let hub = ToolHub::from_config(&config, Arc::new(RmcpConnector::new()))?;
    info!(path = %config_path.display(), "config loaded");

    match args[1].as_str() {
        "servers" => cmd_servers(&hub).await?,
        "tools" => cmd_tools(&hub, &args[2..]).await?,
        "agent" => cmd_agent(&hub, &args[2..]).await?,
        "call" => cmd_call(&hub, &args[2..]).await?,
        "health" => cmd_health(&hub).await?,
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!(
        r#"toolgate - Inspect and exercise MCP tool servers

Usage:
  toolgate servers                           Connect all servers and show status
  toolgate tools <server>                    List a server's tools
  toolgate agent <agent-id>                  Show an agent's bounded tool set
  toolgate call <server> <tool> [json]       Call a tool (arguments default to {{}})
  toolgate health                            Health-check connected servers

Environment:
  TOOLGATE_CONFIG    Override config path
  RUST_LOG           Log filter (default toolgate=info)

Config: {config}
"#,
        config = paths::config_path().display(),
    );
}

async fn cmd_servers(hub: &ToolHub) -> Result<()> {
    hub.connect_all().await;

    let servers = hub.servers();
    if servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!("{:<20} {:<12} {:>6}  {}", "SERVER", "STATUS", "TOOLS", "TARGET");
    for server in servers {
        println!(
            "{:<20} {:<12} {:>6}  {}",
            server.server_id,
            server.status.as_str(),
            server.tool_count,
            server.target
        );
        if let Some(error) = server.last_error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_tools(hub: &ToolHub, args: &[String]) -> Result<()> {
    let Some(server) = args.first() else {
        bail!("Usage: toolgate tools <server>");
    };

    let tools = hub.list_tools(&ServerId::from(server.as_str())).await?;
    if tools.is_empty() {
        println!("{} exposes no tools.", server);
        return Ok(());
    }
    for tool in tools {
        if tool.description.is_empty() {
            println!("  {}", tool.name);
        } else {
            println!("  {:<28} {}", tool.name, tool.description);
        }
    }
    Ok(())
}

async fn cmd_agent(hub: &ToolHub, args: &[String]) -> Result<()> {
    let Some(agent_id) = args.first() else {
        bail!("Usage: toolgate agent <agent-id>");
    };

    let set = hub.tool_set_for_agent(agent_id).await?;
    let report = &set.report;

    println!(
        "{}: {} of {} tools (limit {})",
        agent_id,
        set.len(),
        report.available,
        report.capacity_limit
    );
    for tool in &set.tools {
        println!("  {}", tool.qualified_name());
    }
    if !set.trimmed().is_empty() {
        println!("Trimmed:");
        for name in set.trimmed() {
            println!("  {}", name);
        }
    }
    for server in &report.unavailable {
        println!("Unavailable: {}", server.error);
    }
    for error in &report.policy_errors {
        println!("Policy error: {}", error);
    }
    if let Some(reason) = report.empty {
        println!("No tools: {}", reason);
    }
    Ok(())
}

async fn cmd_call(hub: &ToolHub, args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!("Usage: toolgate call <server> <tool> [json-arguments]");
    }

    let arguments = match args.get(2) {
        Some(text) => serde_json::from_str(text).context("arguments must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let output = hub
        .call_tool(&ServerId::from(args[0].as_str()), &args[1], arguments)
        .await?;

    match output.structured {
        Some(structured) => println!("{}", serde_json::to_string_pretty(&structured)?),
        None => println!("{}", output.content),
    }
    Ok(())
}

async fn cmd_health(hub: &ToolHub) -> Result<()> {
    hub.connect_all().await;

    for (server_id, result) in hub.health_check_all().await {
        match result {
            Ok(ServerStatus::Active) => println!("✓ {}", server_id),
            Ok(status) => println!("✗ {} ({})", server_id, status.as_str()),
            Err(e) => println!("✗ {} ({})", server_id, e),
        }
    }
    Ok(())
}
