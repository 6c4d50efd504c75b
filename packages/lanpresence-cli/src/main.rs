//! LANPresence CLI - LAN device presence agent for Linux servers
//!
//! This binary provides a minimal footprint agent that can:
//! - Sweep the local subnet for live devices and resolve their MACs
//! - Push presence reports to a collector
//! - Run as a background daemon (for systemd integration)

mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use lanpresence_core::config::{self, AgentConfig};
use lanpresence_core::scanner::{self, ProbeMethod};
use lanpresence_core::CollectorClient;

#[derive(Parser)]
#[command(name = "lanpresence")]
#[command(author = "LANPresence Team")]
#[command(version)]
#[command(about = "LAN device presence agent")]
#[command(long_about = "
LANPresence is a lightweight agent that periodically sweeps a local
IPv4 subnet, correlates live hosts to device identities via their
hardware addresses, and reports who is present on the network.

Quick start:
  1. One-shot sweep:   lanpresence sweep --ssid Home --interface wlan0
  2. Start daemon:     lanpresence daemon --ssid Home --interface wlan0

For systemd integration, see: lanpresence daemon --help
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single sweep cycle and print the presence reports
    Sweep {
        /// SSID the swept network is registered under
        #[arg(long)]
        ssid: String,

        /// Network interface to sweep
        #[arg(short, long)]
        interface: String,

        /// Probe with TCP connect against this port instead of ICMP
        #[arg(long, value_name = "PORT")]
        tcp: Option<u16>,

        /// Push the reports to the collector after sweeping
        #[arg(short, long)]
        push: bool,
    },

    /// Run as a background sweeping daemon
    Daemon {
        /// SSID the swept network is registered under
        #[arg(long)]
        ssid: String,

        /// Network interface to sweep
        #[arg(short, long)]
        interface: String,

        /// Sweep interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Probe with TCP connect against this port instead of ICMP
        #[arg(long, value_name = "PORT")]
        tcp: Option<u16>,

        /// Push reports to the collector instead of tracking in-process
        #[arg(short, long)]
        push: bool,
    },

    /// Show configuration paths and settings
    Config,
}

fn probe_method(tcp: Option<u16>) -> ProbeMethod {
    match tcp {
        Some(port) => ProbeMethod::Tcp(port),
        None => ProbeMethod::Icmp,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("lanpresence={log_level},lanpresence_core={log_level}").into()
            }),
        )
        .with_target(false)
        .init();

    let config = config::load_config()?;

    match cli.command {
        Commands::Sweep {
            ref ssid,
            ref interface,
            tcp,
            push,
        } => cmd_sweep(&cli, &config, ssid, interface, probe_method(tcp), push).await,
        Commands::Daemon {
            ssid,
            interface,
            interval,
            tcp,
            push,
        } => {
            let mut config = config;
            if let Some(secs) = interval {
                config.sweep_interval = std::time::Duration::from_secs(secs);
            }
            daemon::run_daemon(
                daemon::DaemonOptions {
                    ssid,
                    interface,
                    method: probe_method(tcp),
                    push,
                },
                config,
            )
            .await
        }
        Commands::Config => cmd_config(&cli, &config),
    }
}

async fn cmd_sweep(
    cli: &Cli,
    config: &AgentConfig,
    ssid: &str,
    interface: &str,
    method: ProbeMethod,
    push: bool,
) -> Result<()> {
    if matches!(cli.format, OutputFormat::Text) {
        println!("Sweeping `{ssid}` on {interface}...");
    }

    let reports = scanner::run_cycle(ssid, interface, method, &config.sweep_options).await?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("Found {} devices:", reports.len());
            println!();
            for report in &reports {
                println!(
                    "  {:15}  {}",
                    report.device_ipv4_addr, report.device_mac_addr
                );
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "ssid": ssid,
                    "interface": interface,
                    "reports": reports,
                })
            );
        }
    }

    if push {
        let client = CollectorClient::new(&config.collector_url)?;
        match client.push_reports(&reports).await {
            Ok(()) => {
                if matches!(cli.format, OutputFormat::Text) {
                    println!();
                    println!("Pushed {} report(s) to collector", reports.len());
                }
            }
            Err(e) => {
                eprintln!("Push failed: {e:#}");
            }
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli, config: &AgentConfig) -> Result<()> {
    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config::config_file_path_string());
            println!(
                "Collector URL:    {} (from {})",
                config.collector_url, config.collector_url_source
            );
            println!("Sweep interval:   {}s", config.sweep_interval.as_secs());
            println!(
                "Probes per host:  {} (timeout {}s, spacing {}s)",
                config.sweep_options.count,
                config.sweep_options.timeout.as_secs(),
                config.sweep_options.interval.as_secs()
            );
            println!("Concurrency:      {}", config.sweep_options.concurrency);
            println!();
            println!("Environment variables:");
            println!("  LANPRESENCE_COLLECTOR_URL - Override collector endpoint");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config::config_file_path_string(),
                    "collector_url": config.collector_url,
                    "collector_url_source": format!("{}", config.collector_url_source),
                    "sweep_interval_secs": config.sweep_interval.as_secs(),
                    "probe_count": config.sweep_options.count,
                    "probe_timeout_secs": config.sweep_options.timeout.as_secs(),
                    "probe_interval_secs": config.sweep_options.interval.as_secs(),
                    "concurrency": config.sweep_options.concurrency,
                })
            );
        }
    }

    Ok(())
}
