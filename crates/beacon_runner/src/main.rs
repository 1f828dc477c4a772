use anyhow::Result;
use beacon_logging::{init_logging, LogConfig};
use beacon_runner::{RunnerConfig, Server};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RunnerConfig::parse();

    init_logging(LogConfig {
        app_name: "beacon-runner",
        verbose: config.verbose,
    })?;

    Server::run(config).await
}
