//! claw-notify - Clawbernetes alert notification broker
//!
//! Reads profile-tagged alerts as JSON lines on stdin and fans them out to the
//! configured notification plugins.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use claw_notify::{security, AlertSender, BrokerConfig, PluginBroker, PluginCatalog};
use claw_notify_proto::ProfileAlert;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-notify")]
#[command(about = "Clawbernetes alert notification broker")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "CLAW_NOTIFY_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker, reading alerts from stdin
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-notify/config.json")]
        config: PathBuf,
    },

    /// Validate the config and every plugin binary without starting anything
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-notify/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/claw-notify/config.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Run { config } => run_broker(config).await,
        Commands::Check { config } => check_config(config),
        Commands::InitConfig { output, force } => init_config(output, force),
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("claw_notify=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    Ok(())
}

async fn run_broker(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting claw-notify");

    let config = BrokerConfig::from_file(&config_path)?;
    info!(
        plugin_dir = %config.plugin_dir.display(),
        plugins = config.plugins.len(),
        profiles = config.profiles.len(),
        "loaded config"
    );

    let broker = PluginBroker::start(config).await?;
    let token = broker.cancellation_token();

    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    let sender = broker.sender();
    let (input_done, input_closed) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let accepted = read_alerts(std::io::stdin().lock(), &sender);
        info!(accepted, "alert input closed");
        let _ = input_done.send(());
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("interrupt received, shutting down");
        }
        _ = input_closed => {}
        () = token.cancelled() => {
            warn!("broker stopped on its own");
        }
    }

    let report = broker.shutdown().await?;
    info!(
        drained_batches = report.drained_batches,
        stopped_plugins = report.stopped_plugins,
        delivered = report.dispatch.delivered,
        "claw-notify stopped"
    );

    Ok(())
}

/// Forwards `ProfileAlert` JSON lines to the broker until EOF or until the
/// broker stops accepting. Returns the number of alerts accepted.
fn read_alerts(input: impl BufRead, sender: &AlertSender) -> u64 {
    let mut accepted = 0;

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let item: ProfileAlert = match serde_json::from_str(&line) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "skipping malformed alert line");
                continue;
            }
        };

        if sender.blocking_send(item).is_err() {
            debug!("broker stopped accepting alerts");
            break;
        }
        accepted += 1;
    }

    accepted
}

fn check_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = BrokerConfig::from_file(&config_path)?;
    let catalog = PluginCatalog::scan(&config.plugin_dir)?;

    println!(
        "{}: {} plugin binaries in {} [{}]",
        config_path.display(),
        catalog.len(),
        catalog.dir().display(),
        catalog.types().collect::<Vec<_>>().join(", ")
    );

    for plugin in &config.plugins {
        let binary = catalog.resolve(plugin)?;
        let identity = security::validate_plugin(plugin, binary, &config.run_as)?;

        let runs_as = identity.map_or_else(
            || "broker identity".to_string(),
            |id| format!("{}:{} ({}:{})", id.user, id.group, id.uid, id.gid),
        );
        println!(
            "  {} -> {} as {}",
            plugin.name,
            binary.display(),
            runs_as
        );
    }

    for profile in &config.profiles {
        println!(
            "  profile {} ({}) -> [{}]",
            profile.id,
            profile.name,
            profile.notifications.join(", ")
        );
    }

    println!("OK");
    Ok(())
}

fn init_config(output: PathBuf, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let json = BrokerConfig::example().to_json()?;
    std::fs::write(&output, json)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to: {}", output.display());
    Ok(())
}
