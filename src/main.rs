use clap::Parser;
use contract_net::cli::{self, Cli, Commands};
use contract_net::config::{AppConfig, LoggingConfig};
use contract_net::error::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { dir } => {
            init_logging_simple();
            let dir = dir.unwrap_or(cli.config_dir);
            cli::config::show_config(&dir)?;
        }
        Commands::Simulate(args) => {
            let config = AppConfig::load_from(&cli.config_dir)?;
            init_logging(&config.logging);
            info!(config_dir = %cli.config_dir.display(), "Configuration loaded");

            let json = args.json;
            match cli::simulate::run_simulation(config, args).await {
                Ok(summary) => cli::simulate::print_summary(&summary, json)?,
                Err(e) => {
                    error!(error = %e, "Simulation failed");
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},contract_net=debug", logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
