use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pv_domain::config::{Config, ConfigSeverity};
use pv_gateway::cli::{load_config, Cli, Command, ConfigCommand};
use pv_gateway::server::GatewayServer;
use pv_gateway::state::Gateway;
use pv_gateway::{doctor, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(config).await
        }
        Some(Command::Doctor) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            let gateway = Gateway::build(config).await?;
            let server = GatewayServer::new(gateway);
            let report = doctor::report(&server).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let has_errors = report["issues"]
                .as_array()
                .map(|issues| issues.iter().any(|i| i["severity"] == "Error"))
                .unwrap_or(false);
            if has_errors {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("palaver {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pv_gateway=debug")),
        )
        .init();
}

/// Start the gateway. Exits 1 on startup failure: config validation
/// errors or an unbindable address.
async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("palaver starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let host = config.server.host.clone();
    let port = config.server.port;

    let gateway = Gateway::build(config).await.context("building gateway")?;
    let server = GatewayServer::new(gateway.clone());
    server.start().await;

    let app = http::router(server.clone());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "palaver listening");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => result.context("server error")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    server.stop();
    gateway.shutdown().await;
    Ok(())
}
