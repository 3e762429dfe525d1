mod cli;
mod config;
mod errors;
mod pvc;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    cli::{Command, ConfigCommand},
    errors::exit_codes,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let code = match cli.command {
        Command::Pvc(args) => {
            let loaded = match &cli.config {
                Some(path) => config::load_from_path(path),
                None => config::load(),
            };
            let resolved = loaded
                .map_err(|err| format!("config file: {err}"))
                .and_then(|file| config::resolve(&file, &args).map_err(|err| err.to_string()));
            match resolved {
                Ok(cfg) => pvc::run(cfg).await,
                Err(err) => {
                    error!("invalid configuration: {err}");
                    exit_codes::CONFIG
                }
            }
        }
        Command::Version => {
            print_version();
            exit_codes::SUCCESS
        }
        Command::Config(ConfigCommand::Init) => {
            let path = match cli.config {
                Some(path) => path,
                None => config::default_path()?,
            };
            let path = config::write_default_if_missing(&path)?;
            println!("Config initialized at {}", path.display());
            exit_codes::SUCCESS
        }
    };

    Ok(ExitCode::from(code))
}

fn init_tracing() {
    // Logs go to stderr so stdout carries only the run summary.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("pvc-undelete {}", env!("CARGO_PKG_VERSION"));
}
