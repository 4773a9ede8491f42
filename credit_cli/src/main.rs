use anyhow::anyhow;
use clap::Parser;
use credit_cli::config::{CliCommand, Config, ConfigCommand, GlobalOptions, SimulateCommand};
use credit_cli::report::{balances_table, settings_table, steps_table};
use credit_cli::scenario::Scenario;
use credit_cli::settings::{default_config_path, Settings};
use credit_cli::simulation;
use log::*;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config: Config = Config::parse();
    let (global_options, command) = config.to_parts();

    let result = match command {
        CliCommand::Simulate(simulate_command) => simulate(simulate_command, global_options).await,
        CliCommand::Config(config_command) => exec_config_command(config_command, global_options),
    };

    if let Err(err) = result {
        eprintln!("** Error ** \n {err}");
        std::process::exit(1);
    }
}

fn load_settings(options: &GlobalOptions) -> Result<Settings, anyhow::Error> {
    let path = options.config_file.clone().unwrap_or_else(default_config_path);
    let settings = Settings::load_or_default(&path)?;
    Ok(settings.with_overrides(options))
}

fn exec_config_command(cmd: ConfigCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let path = options.config_file.clone().unwrap_or_else(default_config_path);
    match cmd {
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(anyhow!("{} already exists. Use --force to overwrite it.", path.display()));
            }
            let settings = Settings::default().with_overrides(&options);
            settings.save(&path)?;
            println!("Settings saved to {}", path.display());
        }
        ConfigCommand::Show => {
            let settings = load_settings(&options)?;
            println!("Settings from {}", path.display());
            settings_table(&settings).printstd();
        }
    }
    Ok(())
}

async fn simulate(cmd: SimulateCommand, options: GlobalOptions) -> Result<(), anyhow::Error> {
    let settings = load_settings(&options)?;
    let scenario = Scenario::try_load(&cmd.scenario)?;
    let (nodes, steps) = (scenario.nodes.len(), scenario.steps.len());
    info!("Simulating {} with {nodes} nodes and {steps} steps", cmd.scenario.display());
    let report = simulation::run(&scenario, &settings).await?;
    steps_table(&report).printstd();
    if !cmd.no_balances {
        println!();
        balances_table(&report).printstd();
    }
    if !report.settled {
        println!("Some transactions had not finished after {} ms.", settings.settle_timeout_ms);
    }
    Ok(())
}
