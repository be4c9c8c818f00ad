//! Propylon CLI - a multi-protocol traffic gateway

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use propylon::{Gateway, MemoryStore};

#[derive(Parser)]
#[command(name = "propylon")]
#[command(about = "A multi-protocol traffic gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to the multi-document YAML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, log_level } => run(config, log_level).await,
        Commands::ValidateConfig { config } => validate(config),
    }
}

async fn run(config_path: PathBuf, log_level: String) -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let input = match std::fs::read_to_string(&config_path) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("Error: failed to read {}: {}", config_path.display(), e);
            return ExitCode::from(2);
        }
    };

    tracing::info!(path = %config_path.display(), "loading configuration");
    let mut gateway = match Gateway::from_yaml(&input, Arc::new(MemoryStore::new())).await {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    // Listener bind failures at startup are fatal.
    if let Err(e) = gateway
        .wait_running(std::time::Duration::from_secs(10))
        .await
    {
        eprintln!("Error: gateway failed to start: {}", e);
        gateway.close().await;
        return ExitCode::from(2);
    }
    tracing::info!("gateway running");

    #[cfg(unix)]
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            eprintln!("Error: failed to install SIGHUP handler: {}", e);
            gateway.close().await;
            return ExitCode::from(2);
        }
    };

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                gateway.close().await;
                return ExitCode::SUCCESS;
            }
            _ = reload => {
                tracing::info!(path = %config_path.display(), "SIGHUP: reloading configuration");
                let input = match std::fs::read_to_string(&config_path) {
                    Ok(input) => input,
                    Err(e) => {
                        tracing::error!(error = %e, "reload skipped: config unreadable");
                        continue;
                    }
                };
                if let Err(e) = gateway.reload_from_yaml(&input).await {
                    tracing::error!(error = %e, "reload rejected");
                    continue;
                }
                // Gates that cannot recover within the grace window are an
                // unrecoverable deployment error.
                if let Err(e) = gateway
                    .wait_running(std::time::Duration::from_secs(30))
                    .await
                {
                    tracing::error!(error = %e, "gateway unhealthy after reload");
                    gateway.close().await;
                    return ExitCode::from(3);
                }
                tracing::info!("reload applied");
            }
        }
    }
}

fn validate(config_path: PathBuf) -> ExitCode {
    println!("Validating configuration: {}", config_path.display());

    let input = match std::fs::read_to_string(&config_path) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("Error: failed to read {}: {}", config_path.display(), e);
            return ExitCode::from(2);
        }
    };

    match Gateway::validate(&input) {
        Ok(summary) => {
            println!("Configuration is valid!");
            println!();
            println!("  Pipelines:    {}", summary.pipelines);
            println!("  HTTP servers: {}", summary.http_servers);
            println!("  TCP servers:  {}", summary.tcp_servers);
            println!("  UDP servers:  {}", summary.udp_servers);
            println!("  MQTT proxies: {}", summary.mqtt_proxies);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
