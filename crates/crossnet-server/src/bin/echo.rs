//! crossnet-echo: delayed echo payload for the spoke front ends

use std::time::Duration;

use clap::Parser;
use crossnet_server::server::DEFAULT_CONCURRENCY;
use crossnet_server::{Mode, ServerBuilder};

#[derive(Parser, Debug)]
#[command(name = "crossnet-echo")]
#[command(about = "Answer every request with the instance identity after a delay")]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Seconds to sleep before answering
    #[arg(long, env = "RESPONSE_DELAY_SECS", default_value_t = 10)]
    delay_secs: u64,

    #[arg(long, env = "K_SERVICE", default_value = "")]
    service: String,

    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let server = ServerBuilder::new(Mode::Echo {
        delay: Duration::from_secs(args.delay_secs),
    })
    .port(args.port)
    .service(args.service)
    .concurrency(args.concurrency)
    .with_metrics()
    .build()?;

    println!("Listening on port {}", args.port);
    server.run().await?;

    Ok(())
}
