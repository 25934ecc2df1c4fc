mod config;
mod error;
mod protocol;
mod server;

use clap::Parser;
use config::ServerConfig;
use std::path::PathBuf;
use std::process::ExitCode;

/// decuma_server — synchronous TCP front end for the storage engine.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a TOML config file. When absent, defaults are used and
    /// `--data-dir` must be supplied.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override (or, without `--config`, set) the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the listen address, e.g. `127.0.0.1:8177`.
    #[arg(long)]
    listen_addr: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    if let Some(data_dir) = cli.data_dir {
        config.engine.data_dir = data_dir;
    }
    if let Some(addr) = cli.listen_addr {
        match addr.parse() {
            Ok(addr) => config.listen_addr = addr,
            Err(e) => {
                tracing::error!(error = %e, "invalid --listen-addr");
                return ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let mut server = match server::Server::bind(config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind server");
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server loop exited with an error");
            ExitCode::FAILURE
        }
    }
}
