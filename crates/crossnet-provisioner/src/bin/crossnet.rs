//! crossnet CLI: provision, exercise and tear down the hub and spoke demo
//!
//! Run the entry points in order:
//! ```bash
//! crossnet bootstrap
//! crossnet provision --scale 2
//! crossnet connect
//! crossnet exercise --concurrency 4
//! crossnet teardown
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossnet_core::{DeployConfig, Topology};
use crossnet_provisioner::{
    exercise, plan_for_teardown, ControlPlane, Decommissioner, ExerciseOptions, GcloudCli,
    InMemoryControlPlane, Phase, Plan, Reconciler,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crossnet")]
#[command(about = "Serverless workloads with colliding ranges talking to a shared hub")]
struct Cli {
    /// Deploy config (JSON); defaults come from CROSSNET_* variables
    #[arg(long, global = true, env = "CROSSNET_CONFIG")]
    config: Option<PathBuf>,

    /// Plan against an in-memory control plane instead of gcloud
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the deployer identity and enable APIs
    Bootstrap,

    /// Create networks, the hub instance, images and serverless workloads
    Provision {
        /// Relay services per spoke
        #[arg(long)]
        scale: Option<usize>,
    },

    /// Create tunnels, routing sessions, translation and load balancers
    Connect,

    /// Test spoke to hub and hub to spoke traffic
    Exercise {
        /// Parallel requests per spoke front end
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Seconds to wait for BGP sessions; 0 skips the wait
        #[arg(long, default_value_t = 120)]
        settle_timeout: u64,

        /// Exit non-zero when any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Delete everything, dependents first
    Teardown {
        /// Minimum relay services per spoke to remove; deployed relays are
        /// discovered either way
        #[arg(long)]
        scale: Option<usize>,
    },

    /// Print the creation order
    Plan {
        #[arg(long)]
        scale: Option<usize>,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<DeployConfig> {
    let config = match &cli.config {
        Some(path) => DeployConfig::load_with_overrides(path, |key| std::env::var(key).ok())
            .with_context(|| format!("reading {}", path.display()))?,
        None => DeployConfig::from_env()?,
    };
    let scale = match &cli.command {
        Command::Provision { scale } | Command::Teardown { scale } | Command::Plan { scale } => {
            *scale
        }
        _ => None,
    };
    Ok(match scale {
        Some(scale) => config.with_relay_scale(scale),
        None => config,
    })
}

async fn control_plane(
    cli: &Cli,
    config: &mut DeployConfig,
) -> anyhow::Result<Box<dyn ControlPlane>> {
    if cli.dry_run {
        let control = InMemoryControlPlane::new().with_default_project("crossnet-dry-run");
        if config.project.is_empty() {
            config.project = control.default_project().await?.unwrap_or_default();
        }
        return Ok(Box::new(control));
    }

    let mut control = GcloudCli::new(config)?;
    if config.project.is_empty() {
        if let Some(project) = control.default_project().await? {
            tracing::info!(project = %project, "Using gcloud default project");
            config.project = project.clone();
            control = control.with_project(project);
        }
    }
    Ok(Box::new(control))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(&cli)?;
    let control = control_plane(&cli, &mut config).await?;
    config.validate()?;

    let topology = Topology::build(&config)?;
    let plan = Plan::build(&config, &topology)?;
    let reconciler = Reconciler::new(&*control, config.fan_out);

    let phase = match &cli.command {
        Command::Bootstrap => Some(Phase::Identity),
        Command::Provision { .. } => Some(Phase::Base),
        Command::Connect => Some(Phase::Connectivity),
        _ => None,
    };
    if let Some(phase) = phase {
        let report = reconciler.reconcile(&plan.graph, phase).await?;
        println!(
            "[OK] {}: {} created, {} already present",
            phase,
            report.created.len(),
            report.skipped.len()
        );
        if phase == Phase::Connectivity {
            println!(
                "Wait about 60 seconds for BGP sessions to converge \
                 before running `crossnet exercise`."
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    match cli.command {
        Command::Exercise {
            concurrency,
            settle_timeout,
            strict,
        } => {
            let options = ExerciseOptions {
                concurrency,
                settle_timeout: (settle_timeout > 0).then(|| Duration::from_secs(settle_timeout)),
                ..Default::default()
            };
            let report = exercise(&*control, &config, &topology, &options).await;

            for check in report.spoke_to_hub.iter().chain(&report.hub_to_spoke) {
                let marker = if check.passed { "[OK]" } else { "[FAIL]" };
                println!("{} {}", marker, check.name);
                for line in check.detail.lines() {
                    println!("    {}", line);
                }
            }
            let failures = report.failures().len();
            if failures == 0 {
                println!("[OK] all checks passed");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("[WARN] {} check(s) failed", failures);
                Ok(if strict { ExitCode::FAILURE } else { ExitCode::SUCCESS })
            }
        }
        Command::Teardown { .. } => {
            let plan = plan_for_teardown(&*control, &config).await?;
            let report = Decommissioner::new(&*control, config.fan_out)
                .teardown(&plan.graph)
                .await?;
            println!(
                "[OK] teardown: {} deleted, {} already absent",
                report.deleted.len(),
                report.absent.len()
            );
            for failure in &report.soft_failures {
                println!("[WARN] {}", failure);
            }
            for failure in &report.hard_failures {
                eprintln!("[FAIL] {}", failure);
            }
            Ok(if report.success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Plan { .. } => {
            for step in plan.graph.provision_order()? {
                println!(
                    "{:<13} {:<20} {}",
                    step.phase.to_string(),
                    step.resource.kind.label(),
                    step.resource.name
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Bootstrap | Command::Provision { .. } | Command::Connect => Ok(ExitCode::SUCCESS),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crossnet=info,crossnet_provisioner=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[FAIL] {:#}", e);
            ExitCode::FAILURE
        }
    }
}
