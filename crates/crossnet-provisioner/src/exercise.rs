//! Traffic checks in both directions
//!
//! Nothing here aborts: each check is reported on its own and the caller
//! decides whether failures change the exit status.

use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crossnet_core::topology::FRONT_END_PORT;
use crossnet_core::{DeployConfig, Topology};

use crate::control::ControlPlane;

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Per-request limit for requests issued from the hub instance
pub const CURL_MAX_TIME_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ExerciseOptions {
    /// Parallel requests per front end
    pub concurrency: usize,
    /// Wait for routing sessions before testing; `None` skips the wait
    pub settle_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for ExerciseOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            settle_timeout: Some(DEFAULT_SETTLE_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExerciseReport {
    /// `Some(false)` when the settle wait timed out
    pub converged: Option<bool>,
    pub spoke_to_hub: Vec<CheckResult>,
    pub hub_to_spoke: Vec<CheckResult>,
}

impl ExerciseReport {
    pub fn failures(&self) -> Vec<&CheckResult> {
        self.spoke_to_hub
            .iter()
            .chain(&self.hub_to_spoke)
            .filter(|c| !c.passed)
            .collect()
    }

    pub fn all_passed(&self) -> bool {
        self.failures().is_empty()
    }
}

/// Command run on the hub: `concurrency` parallel requests, one status code per line
pub fn curl_command(ip: &str, concurrency: usize) -> String {
    let n = concurrency.max(1);
    format!(
        "seq {n} | xargs -P {n} -I{{}} curl -sk -o /dev/null \
         -w '%{{http_code}}\\n' --max-time {t} https://{ip}:{port}/",
        n = n,
        t = CURL_MAX_TIME_SECS,
        ip = ip,
        port = FRONT_END_PORT
    )
}

/// Count the 2xx status lines in curl output
pub fn count_successes(stdout: &str) -> usize {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.len() == 3 && l.starts_with('2') && l.chars().all(|c| c.is_ascii_digit()))
        .count()
}

/// Poll every VPN router until all sessions are up or `timeout` passes
pub async fn wait_for_bgp<C>(
    control: &C,
    config: &DeployConfig,
    topology: &Topology,
    timeout: Duration,
    interval: Duration,
) -> bool
where
    C: ControlPlane + ?Sized,
{
    let routers: Vec<&str> = topology.advertisements().into_iter().map(|(r, _)| r).collect();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let mut pending = Vec::new();
        for router in &routers {
            match control.bgp_status(router, &config.region).await {
                Ok(status) if status.converged() => {}
                Ok(status) => pending.push(format!(
                    "{} ({}/{})",
                    router, status.established, status.total
                )),
                Err(e) => pending.push(format!("{} ({})", router, e)),
            }
        }

        if pending.is_empty() {
            info!(routers = routers.len(), "[OK] all BGP sessions established");
            return true;
        }
        if tokio::time::Instant::now() + interval > deadline {
            warn!(
                pending = %pending.join(", "),
                "[WARN] BGP sessions not converged, testing anyway"
            );
            return false;
        }
        info!(pending = pending.len(), "Waiting for BGP sessions");
        tokio::time::sleep(interval).await;
    }
}

async fn spoke_to_hub<C>(
    control: &C,
    config: &DeployConfig,
    topology: &Topology,
) -> Vec<CheckResult>
where
    C: ControlPlane + ?Sized,
{
    let runs = topology.spokes.iter().map(|spoke| async move {
        let job = &spoke.probe_job;
        info!(job = %job, "Executing probe job");
        match control.execute_job(job, &config.region).await {
            Ok(outcome) if outcome.succeeded => CheckResult::pass(job.clone(), outcome.output),
            Ok(outcome) => CheckResult::fail(job.clone(), outcome.output),
            Err(e) => CheckResult::fail(job.clone(), e.to_string()),
        }
    });
    join_all(runs).await
}

async fn hub_to_spoke<C>(
    control: &C,
    config: &DeployConfig,
    topology: &Topology,
    concurrency: usize,
) -> Vec<CheckResult>
where
    C: ControlPlane + ?Sized,
{
    let zone = config.zone();
    let mut results = Vec::new();

    for spoke in &topology.spokes {
        let name = format!("hub -> spoke{}", spoke.index);
        let address = &spoke.load_balancer.address;

        let ip = match control.address_ip(address, &config.region).await {
            Ok(ip) => ip,
            Err(e) => {
                results.push(CheckResult::fail(name, format!("cannot resolve {}: {}", address, e)));
                continue;
            }
        };

        let command = curl_command(&ip.to_string(), concurrency);
        let result = match control.run_on_instance(&topology.hub.instance, &zone, &command).await {
            Ok(output) => {
                let ok = count_successes(&output.stdout);
                let detail = format!("{}/{} requests to {} succeeded", ok, concurrency, ip);
                if output.success() && ok == concurrency {
                    CheckResult::pass(name, detail)
                } else {
                    CheckResult::fail(name, format!("{} {}", detail, output.stderr.trim()))
                }
            }
            Err(e) => CheckResult::fail(name, e.to_string()),
        };
        results.push(result);
    }

    results
}

/// Run the optional settle wait then both traffic directions
pub async fn exercise<C>(
    control: &C,
    config: &DeployConfig,
    topology: &Topology,
    options: &ExerciseOptions,
) -> ExerciseReport
where
    C: ControlPlane + ?Sized,
{
    let concurrency = options.concurrency.max(1);
    let mut report = ExerciseReport::default();

    if let Some(timeout) = options.settle_timeout {
        let converged =
            wait_for_bgp(control, config, topology, timeout, options.poll_interval).await;
        report.converged = Some(converged);
    }

    report.spoke_to_hub = spoke_to_hub(control, config, topology).await;
    report.hub_to_spoke = hub_to_spoke(control, config, topology, concurrency).await;

    for check in report.spoke_to_hub.iter().chain(&report.hub_to_spoke) {
        if check.passed {
            info!(check = %check.name, "[OK] {}", check.detail.lines().next().unwrap_or_default());
        } else {
            warn!(check = %check.name, "[FAIL] {}", check.detail.trim());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Phase;
    use crate::memory::InMemoryControlPlane;
    use crate::plan::Plan;
    use crate::reconcile::Reconciler;

    async fn deployed() -> (DeployConfig, Topology, InMemoryControlPlane) {
        let config = DeployConfig::new("demo");
        let topology = Topology::build(&config).unwrap();
        let plan = Plan::build(&config, &topology).unwrap();
        let control = InMemoryControlPlane::new();
        let reconciler = Reconciler::new(&control, 5);
        for phase in [Phase::Identity, Phase::Base, Phase::Connectivity] {
            reconciler.reconcile(&plan.graph, phase).await.unwrap();
        }
        (config, topology, control)
    }

    #[test]
    fn test_curl_command() {
        let cmd = curl_command("10.1.0.5", 3);
        assert!(cmd.starts_with("seq 3 | xargs -P 3 "));
        assert!(cmd.contains("%{http_code}"));
        assert!(cmd.ends_with("https://10.1.0.5:443/"));
    }

    #[test]
    fn test_count_successes() {
        assert_eq!(count_successes("200\n204\n000\n503\n"), 2);
        assert_eq!(count_successes(""), 0);
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let (config, topology, control) = deployed().await;
        let options = ExerciseOptions {
            concurrency: 4,
            ..Default::default()
        };
        let report = exercise(&control, &config, &topology, &options).await;

        assert_eq!(report.converged, Some(true));
        assert_eq!(report.spoke_to_hub.len(), 2);
        assert_eq!(report.hub_to_spoke.len(), 2);
        assert!(report.all_passed(), "{:?}", report.failures());
    }

    #[tokio::test]
    async fn test_failures_are_per_check() {
        let (config, topology, control) = deployed().await;
        control.fail_job(&topology.spokes[0].probe_job, "ERROR: timeout");
        let ip = control
            .address_ip(&topology.spokes[1].load_balancer.address, &config.region)
            .await
            .unwrap();
        control.drop_requests_to(ip);

        let report = exercise(&control, &config, &topology, &ExerciseOptions::default()).await;
        let failed: Vec<&str> = report.failures().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec![topology.spokes[0].probe_job.as_str(), "hub -> spoke2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconverged_bgp_is_a_warning() {
        let (config, topology, control) = deployed().await;
        control.hold_bgp_down(&topology.hub.vpn_router);

        let started = tokio::time::Instant::now();
        let report = exercise(&control, &config, &topology, &ExerciseOptions::default()).await;
        assert_eq!(report.converged, Some(false));
        assert!(started.elapsed() <= DEFAULT_SETTLE_TIMEOUT);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn test_missing_front_end_is_reported() {
        let config = DeployConfig::new("demo");
        let topology = Topology::build(&config).unwrap();
        let control = InMemoryControlPlane::new();
        let options = ExerciseOptions {
            settle_timeout: None,
            ..Default::default()
        };

        let report = exercise(&control, &config, &topology, &options).await;
        assert_eq!(report.converged, None);
        assert_eq!(report.failures().len(), 4);
        assert!(report.hub_to_spoke[0].detail.contains("cannot resolve"));
    }
}
