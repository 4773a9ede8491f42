use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Credit network payments.
///
/// Runs payment scenarios on an in-process network of credit nodes.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Path to the settings file. The default is `$HOME/.credit/config.yml`.
    #[arg(long = "config-file", short = 'c', env = "CREDIT_CONFIG")]
    pub config_file: Option<PathBuf>,
    /// Overrides the upper bound on the latency of one protocol message, in milliseconds.
    #[arg(long = "message-lag-ms")]
    pub message_lag_ms: Option<u64>,
    /// Overrides the number of candidate paths handed to a payment.
    #[arg(long = "max-paths")]
    pub max_paths: Option<usize>,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run a payment scenario on a local network.
    #[command(name = "simulate", alias = "run")]
    Simulate(SimulateCommand),
    /// Create or display the settings file.
    #[command(subcommand, name = "config")]
    Config(ConfigCommand),
}

#[derive(Debug, Args)]
pub struct SimulateCommand {
    /// The scenario file, in YAML.
    pub scenario: PathBuf,
    /// Skip the final table of trust line balances.
    #[arg(long = "no-balances", default_value_t = false)]
    pub no_balances: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write the default settings to the settings file.
    #[command(name = "init")]
    Init {
        /// Overwrite an existing file.
        #[arg(long = "force", short = 'f', default_value_t = false)]
        force: bool,
    },
    /// Print the settings in use, overrides included.
    #[command(name = "show", alias = "ls")]
    Show,
}

pub struct GlobalOptions {
    pub config_file: Option<PathBuf>,
    pub message_lag_ms: Option<u64>,
    pub max_paths: Option<usize>,
}

impl Config {
    pub fn to_parts(self) -> (GlobalOptions, CliCommand) {
        let global = GlobalOptions {
            config_file: self.config_file,
            message_lag_ms: self.message_lag_ms,
            max_paths: self.max_paths,
        };
        (global, self.command)
    }
}
