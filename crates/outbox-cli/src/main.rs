//! outbox - inspect and maintain an offline-first sync engine's durable state
//!
//! Works directly on the data directory of a device: list, plan and discard
//! buffered operations, edit the selective-sync policy, sample capabilities
//! and manage configuration files.

mod commands;
mod display;
mod json_output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::{SignalArgs, Workspace};
use console::style;
use json_output::JsonReport;
use outbox_config::{Config, ConfigLoader};
use outbox_types::{NetworkQuality, NetworkType, OperationId};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// outbox - offline-first operation sync
#[derive(Parser)]
#[command(
    name = "outbox",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect and maintain offline-first sync state",
    long_about = "outbox works on the durable state of an offline-first sync engine.\n\
                  It lists and discards buffered operations, shows the order they\n\
                  will be replayed in, edits the selective-sync policy and reports\n\
                  the device capability tier."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON instead of styled text
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and discard buffered operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Sample device capabilities and show the adaptation strategy
    Device {
        /// Battery level between 0.0 and 1.0
        #[arg(long)]
        battery: Option<f32>,
        /// Battery is charging
        #[arg(long)]
        charging: bool,
        /// Active network link
        #[arg(long, value_enum)]
        network: Option<NetworkArg>,
        /// Network quality
        #[arg(long, value_enum)]
        quality: Option<QualityArg>,
    },
    /// Show or edit the selective-sync policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Show or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List buffered operations in enqueue order
    List,
    /// Discard one operation
    Remove {
        /// Operation identifier
        id: OperationId,
    },
    /// Discard every operation
    Clear,
    /// Show the order operations would be replayed in
    Plan,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the policy
    Show,
    /// Enable an entity type
    Enable {
        /// Entity type
        entity_type: String,
    },
    /// Disable an entity type
    Disable {
        /// Entity type
        entity_type: String,
    },
    /// Turn sync on or off globally
    Global {
        /// New state
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Show the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
    /// Write a default configuration file
    Init {
        /// Destination (.yaml, .toml or .json)
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum Switch {
    On,
    Off,
}

#[derive(ValueEnum, Clone, Copy)]
enum NetworkArg {
    Ethernet,
    Wifi,
    Cellular,
    None,
}

impl From<NetworkArg> for NetworkType {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Ethernet => NetworkType::Ethernet,
            NetworkArg::Wifi => NetworkType::Wifi,
            NetworkArg::Cellular => NetworkType::Cellular,
            NetworkArg::None => NetworkType::None,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum QualityArg {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl From<QualityArg> for NetworkQuality {
    fn from(arg: QualityArg) -> Self {
        match arg {
            QualityArg::Poor => NetworkQuality::Poor,
            QualityArg::Fair => NetworkQuality::Fair,
            QualityArg::Good => NetworkQuality::Good,
            QualityArg::Excellent => NetworkQuality::Excellent,
        }
    }
}

/// How results are rendered
#[derive(Clone, Copy)]
struct Output {
    json: bool,
    quiet: bool,
}

impl Output {
    fn emit<T: Serialize>(self, command: &str, result: T, render: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            let report = JsonReport::new(command, result);
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if !self.quiet {
            render(&result);
        }
        Ok(())
    }

    fn message(self, command: &str, change: json_output::ChangeJson) -> Result<()> {
        self.emit(command, change, |change| {
            let mark = if change.changed {
                style("✓").green()
            } else {
                style("ℹ").yellow()
            };
            println!("{} {}", mark, change.message);
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_logging(cli.debug, cli.quiet, cli.verbose, config.logging.json_format)?;

    info!("outbox v{} starting", env!("CARGO_PKG_VERSION"));
    let output = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Queue { action } => queue_command(&config, action, output).await,
        Commands::Device {
            battery,
            charging,
            network,
            quality,
        } => {
            let args = SignalArgs {
                battery,
                charging,
                network: network.map(Into::into),
                quality: quality.map(Into::into),
            };
            device_command(&config, args, output).await
        }
        Commands::Policy { action } => policy_command(&config, action, output).await,
        Commands::Config { action } => config_command(&config, action, output),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConfigLoader::load_default().context("Failed to load configuration")?,
    };
    Ok(config)
}

fn init_logging(debug: bool, quiet: bool, verbose: bool, json: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else if quiet {
        "error"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

async fn queue_command(config: &Config, action: QueueAction, output: Output) -> Result<()> {
    let workspace = Workspace::open(config)?;
    match action {
        QueueAction::List => {
            let queue = workspace.queue_list().await;
            output.emit("queue list", queue, display::display_queue)
        }
        QueueAction::Remove { id } => {
            let change = workspace.queue_remove(id).await?;
            output.message("queue remove", change)
        }
        QueueAction::Clear => {
            let change = workspace.queue_clear().await?;
            output.message("queue clear", change)
        }
        QueueAction::Plan => {
            let steps = workspace.queue_plan().await;
            output.emit("queue plan", steps, |steps| display::display_plan(steps))
        }
    }
}

async fn device_command(config: &Config, args: SignalArgs, output: Output) -> Result<()> {
    let spinner = display::create_spinner(output.quiet || output.json, "Sampling device...");
    let report = commands::device_report(config, args).await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    debug!("Device tier: {}", report.tier);
    output.emit("device", report, display::display_capability)
}

async fn policy_command(config: &Config, action: PolicyAction, output: Output) -> Result<()> {
    let workspace = Workspace::open(config)?;
    let (command, report) = match action {
        PolicyAction::Show => ("policy show", workspace.policy_show().await),
        PolicyAction::Enable { entity_type } => {
            ("policy enable", workspace.policy_enable(&entity_type).await?)
        }
        PolicyAction::Disable { entity_type } => {
            ("policy disable", workspace.policy_disable(&entity_type).await?)
        }
        PolicyAction::Global { state } => (
            "policy global",
            workspace
                .policy_global(matches!(state, Switch::On))
                .await?,
        ),
    };
    output.emit(command, report, display::display_policy)
}

fn config_command(config: &Config, action: ConfigAction, output: Output) -> Result<()> {
    match action {
        ConfigAction::Show { default } => {
            let shown = if default {
                Config::default()
            } else {
                config.clone()
            };
            output.emit("config show", shown, |shown| {
                let title = if default {
                    "Default configuration:"
                } else {
                    "Current configuration:"
                };
                println!("{} {}", style("⚙").blue().bold(), title);
                match serde_yaml::to_string(shown) {
                    Ok(yaml) => print!("{}", yaml),
                    Err(e) => eprintln!("Failed to render configuration: {}", e),
                }
            })
        }
        ConfigAction::Init { path, force } => {
            let change = commands::config_init(&path, force)?;
            output.message("config init", change)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_policy_global() {
        let cli = Cli::try_parse_from(["outbox", "--json", "policy", "global", "off"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Policy {
                action: PolicyAction::Global { state: Switch::Off }
            }
        ));
    }

    #[test]
    fn test_parse_queue_remove() {
        let cli = Cli::try_parse_from(["outbox", "queue", "remove", "42", "-q"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Queue {
                action: QueueAction::Remove { id: 42 }
            }
        ));
        assert!(Cli::try_parse_from(["outbox", "queue", "remove", "abc"]).is_err());
    }
}
