//! crossnet-probe: one-shot request used as the spoke job image
//!
//! Exit status is 0 whenever the target answered, whatever the status code.

use std::process::ExitCode;

use clap::Parser;
use crossnet_client::{ProbeArgs, ProbeClient};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(std::io::stderr)
        .init();

    let config = match ProbeArgs::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Requesting {} ...", config.target_url);

    let client = match ProbeClient::new(config.timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.fetch(&config.target_url).await {
        Ok(resp) => {
            println!("{}", resp.render());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
