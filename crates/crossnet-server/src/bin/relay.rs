//! crossnet-relay: single-hop relay from a spoke to the hub

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use crossnet_client::{ClientError, ProbeClient};
use crossnet_server::server::DEFAULT_CONCURRENCY;
use crossnet_server::{Mode, ServerBuilder};

#[derive(Parser, Debug)]
#[command(name = "crossnet-relay")]
#[command(about = "Forward every request as one GET to TARGET_URL")]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "TARGET_URL")]
    target_url: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value_t = 15)]
    timeout_secs: u64,

    #[arg(long, env = "K_SERVICE", default_value = "")]
    service: String,

    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let Some(target) = args.target_url.clone().filter(|t| !t.trim().is_empty()) else {
        eprintln!("{}", ClientError::MissingTarget);
        return ExitCode::FAILURE;
    };

    match run(args, target).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, target: String) -> anyhow::Result<()> {
    let client = ProbeClient::new(Duration::from_secs(args.timeout_secs))?;

    println!("Listening on port {}, proxying to {}", args.port, target);

    ServerBuilder::new(Mode::Relay { client, target })
        .port(args.port)
        .service(args.service)
        .concurrency(args.concurrency)
        .with_metrics()
        .build()?
        .run()
        .await?;

    Ok(())
}
