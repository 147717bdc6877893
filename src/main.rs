//! podbridge - POD HD 400 to Boss Katana MIDI bridge

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podbridge::config::AppConfig;
use podbridge::{bridge, ports, transport};

/// Bridge a USB POD HD controller to a MIDI amplifier
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log every forwarded event
    #[arg(short, long)]
    verbose: bool,

    /// Also write a daily rolling log file into this directory
    #[arg(long)]
    log_dir: Option<String>,

    /// List MIDI output ports and connected controllers, then exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path).await?,
        None => AppConfig::default(),
    };

    let level = if args.verbose || config.verbose {
        "debug"
    } else {
        args.log_level.as_str()
    };
    let _log_guard = init_logging(level, args.log_dir.as_deref())?;

    if args.list_ports {
        list_ports_formatted(&config);
        return Ok(());
    }

    info!("Starting podbridge v{}...", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Configuration file: {}", path),
        None => info!("No configuration file, using defaults"),
    }

    bridge::run(config, shutdown_signal()).await?;

    info!("podbridge shutdown complete");
    Ok(())
}

fn init_logging(level: &str, log_dir: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "podbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn list_ports_formatted(config: &AppConfig) {
    use colored::*;

    println!("\n{}", "=== Available MIDI Output Ports ===".bold().cyan());
    match ports::list_output_ports() {
        Ok(outputs) if outputs.is_empty() => {
            println!("  {}", "No output ports found".dimmed());
        }
        Ok(outputs) => {
            for name in outputs {
                if ports::matches_port(&name, &config.amp.port_name) {
                    println!("  {} {}", "[AMP]".green(), name.bright_white());
                } else {
                    println!("        {}", name);
                }
            }
        }
        Err(e) => println!("  {}", format!("Failed to list ports: {:#}", e).red()),
    }

    let c = &config.controller;
    println!(
        "\n{}",
        format!("=== Controllers ({:04x}:{:04x}) ===", c.vendor_id, c.product_id)
            .bold()
            .cyan()
    );
    match transport::list_controllers(c.vendor_id, c.product_id) {
        Ok(found) if found.is_empty() => {
            println!("  {}", "No controller found".dimmed());
        }
        Ok(found) => {
            for device in found {
                println!("  {} {}", "[USB]".green(), device);
            }
        }
        Err(e) => println!("  {}", format!("USB enumeration failed: {}", e).red()),
    }

    println!();
}
