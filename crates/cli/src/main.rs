//! collectord CLI - hot-deploy monitoring collectors from a directory tree

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use collectord::RuntimeConfig;
use std::path::PathBuf;

mod commands;
mod logging;

use commands::{cmd_config_init, cmd_config_show, cmd_run, cmd_tree};
use logging::{init_cli_logging, init_run_logging};

#[derive(Parser)]
#[command(name = "collectord")]
#[command(version, about = "Hot-deploy monitoring collectors from a watched directory tree")]
#[command(after_help = "\
QUICK START:
  collectord config init              # Write ~/.config/collectord/config.toml
  collectord tree --root /srv/coll    # Preview the branches a root produces
  collectord run --root /srv/coll     # Watch, deploy and schedule collectors

LAYOUT:
  /srv/coll/app-orders/health.collector         -> branch app=orders
  /srv/coll/app-orders/env-prod/db.collector    -> branch app=orders,env=prod
  /srv/coll/app-orders/lib/driver.jar           -> branch library")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

/// Where configuration and roots come from
#[derive(Args, Clone)]
struct ConfigArgs {
  /// Config file (default: user config, if present)
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,
  /// Extra deployment root, in addition to the configured ones (repeatable)
  #[arg(short, long = "root", value_name = "DIR")]
  roots: Vec<PathBuf>,
}

impl ConfigArgs {
  fn load(self) -> Result<RuntimeConfig> {
    let mut runtime = RuntimeConfig::load(self.config).context("Failed to load configuration")?;
    runtime.extra_roots = self.roots;
    Ok(runtime)
  }
}

/// Subcommands for `collectord config`
#[derive(Subcommand)]
enum ConfigCommand {
  /// Show current effective configuration
  Show {
    #[command(flatten)]
    args: ConfigArgs,
  },
  /// Write a commented config template to the user config path
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Run the engine in the foreground until ctrl-c
  Run {
    #[command(flatten)]
    args: ConfigArgs,
    /// Log to a rolling file under the data directory instead of the console
    #[arg(long)]
    log_file: bool,
  },
  /// Print the branches the configured roots would produce, without starting anything
  Tree {
    #[command(flatten)]
    args: ConfigArgs,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Manage configuration
  #[command(after_help = "\
CONFIG LOCATIONS:
  $CONFIG_DIR/config.toml
  $XDG_CONFIG_HOME/collectord/config.toml
  ~/.config/collectord/config.toml")]
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Run { args, log_file } => {
      let runtime = args.load()?;
      // File logging for detached runs, console otherwise
      let _guard = init_run_logging(&runtime.config.log, log_file);
      cmd_run(runtime).await
    }
    Commands::Tree { args, json } => {
      init_cli_logging();
      cmd_tree(&args.load()?, json)
    }
    Commands::Config { command } => {
      init_cli_logging();
      match command {
        ConfigCommand::Show { args } => cmd_config_show(&args.load()?),
        ConfigCommand::Init { force } => cmd_config_init(force),
      }
    }
  }
}
