//! Implementation of the config command.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;

use crate::config::Config;

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Generates a default configuration file.
    Init,

    /// Displays the resolved configuration.
    Resolve {
        /// The configuration file to resolve.
        #[arg(short, long, value_name = "TOML")]
        config: Option<PathBuf>,
    },
}

/// Runs the `config` command.
pub fn config(args: Args) -> anyhow::Result<()> {
    let config = match args.command {
        ConfigSubcommand::Init => Config::default(),
        ConfigSubcommand::Resolve { config } => Config::load(config.as_deref())?,
    };

    print!(
        "{}",
        toml::to_string_pretty(&config).context("failed to serialize configuration")?
    );
    Ok(())
}
