//! Dependency-ordered teardown
//!
//! Each step checks existence first; an absent resource counts as deleted.
//! Subnet deletions are retried while serverless address reservations drain,
//! IAM binding removals are best-effort, and any other failure is recorded and
//! teardown carries on. Enabled APIs are left in place.

use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crossnet_core::{DeployConfig, Resource, ResourceKind, ResourceSpec, Topology};

use crate::control::ControlPlane;
use crate::error::Result;
use crate::graph::{Step, StepGraph};
use crate::plan::{Plan, RELAY_BINARY};
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeleteOutcome {
    Deleted,
    Absent,
    /// Logged, does not fail the teardown
    Soft(String),
    Hard(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub absent: Vec<String>,
    pub soft_failures: Vec<String>,
    pub hard_failures: Vec<String>,
}

impl TeardownReport {
    /// True when no hard failure occurred
    pub fn success(&self) -> bool {
        self.hard_failures.is_empty()
    }

    fn record(&mut self, resource: &Resource, outcome: DeleteOutcome) {
        match outcome {
            DeleteOutcome::Deleted => self.deleted.push(resource.to_string()),
            DeleteOutcome::Absent => self.absent.push(resource.to_string()),
            DeleteOutcome::Soft(e) => {
                self.soft_failures.push(format!("{}: {}", resource, e))
            }
            DeleteOutcome::Hard(e) => {
                self.hard_failures.push(format!("{}: {}", resource, e))
            }
        }
    }
}

pub struct Decommissioner<'a, C: ?Sized> {
    control: &'a C,
    fan_out: usize,
    subnet_retry: RetryPolicy,
}

impl<'a, C> Decommissioner<'a, C>
where
    C: ControlPlane + ?Sized,
{
    pub fn new(control: &'a C, fan_out: usize) -> Self {
        Self {
            control,
            fan_out: fan_out.max(1),
            subnet_retry: RetryPolicy::subnet_release(),
        }
    }

    pub fn with_subnet_retry(mut self, policy: RetryPolicy) -> Self {
        self.subnet_retry = policy;
        self
    }

    /// Delete everything in `graph`, dependents before their dependencies
    pub async fn teardown(&self, graph: &StepGraph) -> Result<TeardownReport> {
        let order: Vec<&Step> = graph
            .teardown_order()?
            .into_iter()
            .filter(|s| s.resource.kind != ResourceKind::ProjectApi)
            .collect();
        let mut report = TeardownReport::default();

        info!(steps = order.len(), "Tearing down");

        let mut rest: &[&Step] = &order;
        while let Some(first) = rest.first() {
            if first.fan_out {
                let run = rest.iter().take_while(|s| s.fan_out).count();
                let (batch, tail) = rest.split_at(run);
                let outcomes: Vec<(&Resource, DeleteOutcome)> = stream::iter(batch.iter())
                    .map(|step| async move {
                        (&step.resource, self.delete_step(&step.resource).await)
                    })
                    .buffer_unordered(self.fan_out)
                    .collect()
                    .await;
                for (resource, outcome) in outcomes {
                    report.record(resource, outcome);
                }
                rest = tail;
            } else {
                let outcome = self.delete_step(&first.resource).await;
                report.record(&first.resource, outcome);
                rest = &rest[1..];
            }
        }

        info!(
            deleted = report.deleted.len(),
            absent = report.absent.len(),
            soft = report.soft_failures.len(),
            hard = report.hard_failures.len(),
            "Teardown finished"
        );
        Ok(report)
    }

    async fn delete_step(&self, resource: &Resource) -> DeleteOutcome {
        let outcome = match resource.kind {
            ResourceKind::Subnet => self.delete_subnet(resource).await,
            ResourceKind::IamBinding => match self.delete_once(resource).await {
                DeleteOutcome::Hard(e) => DeleteOutcome::Soft(e),
                other => other,
            },
            _ => self.delete_once(resource).await,
        };

        match &outcome {
            DeleteOutcome::Deleted => {
                info!(resource = %resource.name, "[OK] deleted {}", resource)
            }
            DeleteOutcome::Absent => {
                info!(resource = %resource.name, "[SKIP] {} not found", resource)
            }
            DeleteOutcome::Soft(e) => warn!(
                resource = %resource.name,
                error = %e,
                "[WARN] could not delete {}",
                resource
            ),
            DeleteOutcome::Hard(e) => error!(
                resource = %resource.name,
                error = %e,
                "[FAIL] could not delete {}",
                resource
            ),
        }
        outcome
    }

    async fn delete_once(&self, resource: &Resource) -> DeleteOutcome {
        match self.control.exists(resource).await {
            Ok(false) => return DeleteOutcome::Absent,
            Ok(true) => {}
            Err(e) => return DeleteOutcome::Hard(e.to_string()),
        }
        match self.control.delete(resource).await {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) if e.is_not_found() => DeleteOutcome::Absent,
            Err(e) => DeleteOutcome::Hard(e.to_string()),
        }
    }

    async fn delete_subnet(&self, resource: &Resource) -> DeleteOutcome {
        let name = format!("delete {}", resource);
        let result = retry_with_backoff(&self.subnet_retry, &name, || async move {
            match self.delete_once(resource).await {
                DeleteOutcome::Hard(e) => Err(e),
                other => Ok(other),
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err((e, attempts)) => {
                DeleteOutcome::Soft(format!("gave up after {} attempts: {}", attempts, e))
            }
        }
    }
}

/// Relay number of a service named `<prefix>-spoke<N>-relay-<M>`
fn relay_index(prefix: &str, name: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?.strip_prefix("-spoke")?;
    let (spoke, relay) = rest.split_once("-relay-")?;
    if spoke.is_empty() || !spoke.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if relay.is_empty() || !relay.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    relay.parse().ok()
}

/// Highest relay count still deployed under `config`'s prefix
///
/// Falls back to the relay image: an image with no services left behind
/// still needs a relay-enabled plan to be removed.
pub async fn discover_relay_scale<C>(control: &C, config: &DeployConfig) -> Result<usize>
where
    C: ControlPlane + ?Sized,
{
    let services = control.list_services(&config.region).await?;
    let deployed = services
        .iter()
        .filter_map(|name| relay_index(&config.prefix, name))
        .max()
        .unwrap_or(0);
    if deployed > 0 {
        return Ok(deployed);
    }

    let relay_config = config.clone().with_relay_scale(1);
    let topology = Topology::build(&relay_config)?;
    let plan = Plan::build(&relay_config, &topology)?;
    let image = plan.graph.steps().iter().find(|s| {
        matches!(
            &s.resource.spec,
            ResourceSpec::ContainerImage { binary, .. } if binary == RELAY_BINARY
        )
    });
    match image {
        Some(step) if control.exists(&step.resource).await? => Ok(1),
        _ => Ok(0),
    }
}

/// Plan covering everything a teardown of `config` must remove
///
/// The relay count is widened to what is actually deployed, so a teardown
/// run without the provisioning scale still removes every relay.
pub async fn plan_for_teardown<C>(control: &C, config: &DeployConfig) -> Result<Plan>
where
    C: ControlPlane + ?Sized,
{
    let discovered = match discover_relay_scale(control, config).await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Could not list deployed relays, using configured scale");
            0
        }
    };
    let mut config = config.clone();
    if discovered > config.relay_scale {
        info!(
            configured = config.relay_scale,
            deployed = discovered,
            "Widening teardown to deployed relays"
        );
        config.relay_scale = discovered;
    }
    let topology = Topology::build(&config)?;
    Plan::build(&config, &topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Phase;
    use crate::memory::InMemoryControlPlane;
    use crate::plan::Plan;
    use crate::reconcile::Reconciler;
    use crossnet_core::{DeployConfig, ResourceCategory, Topology};
    use std::time::Duration;

    async fn provisioned(relay: usize) -> (Plan, InMemoryControlPlane) {
        let config = DeployConfig::new("demo").with_relay_scale(relay);
        let topology = Topology::build(&config).unwrap();
        let plan = Plan::build(&config, &topology).unwrap();
        let control = InMemoryControlPlane::new();
        let reconciler = Reconciler::new(&control, 5);
        for phase in [Phase::Identity, Phase::Base, Phase::Connectivity] {
            reconciler.reconcile(&plan.graph, phase).await.unwrap();
        }
        (plan, control)
    }

    fn step(plan: &Plan, kind: ResourceKind) -> Resource {
        plan.graph
            .steps()
            .iter()
            .find(|s| s.resource.kind == kind)
            .unwrap()
            .resource
            .clone()
    }

    #[tokio::test]
    async fn test_teardown_empties_every_category() {
        let (plan, control) = provisioned(1).await;
        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();

        assert!(report.success());
        for category in ResourceCategory::ALL {
            assert_eq!(control.count_in(category), 0, "{:?} left behind", category);
        }
        // APIs stay enabled
        assert!(control
            .resources()
            .iter()
            .all(|r| r.kind == ResourceKind::ProjectApi));
    }

    #[tokio::test]
    async fn test_second_teardown_deletes_nothing() {
        let (plan, control) = provisioned(0).await;
        let decommissioner = Decommissioner::new(&control, 5);
        decommissioner.teardown(&plan.graph).await.unwrap();
        let deletes = control.deletes();

        let report = decommissioner.teardown(&plan.graph).await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(report.success());
        assert_eq!(control.deletes(), deletes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_subnet_recovers() {
        let (plan, control) = provisioned(0).await;
        let subnet = step(&plan, ResourceKind::Subnet);
        control.sticky_delete(&subnet, 3);

        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();
        assert!(report.success());
        assert!(report.soft_failures.is_empty());
        assert!(!control.contains(&subnet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_subnet_soft_fails_within_bound() {
        let (plan, control) = provisioned(0).await;
        let subnet = step(&plan, ResourceKind::Subnet);
        control.sticky_delete(&subnet, 100);

        let started = tokio::time::Instant::now();
        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();

        assert_eq!(report.soft_failures.len(), 1);
        assert!(report.soft_failures[0].contains("6 attempts"));
        assert!(started.elapsed() <= Duration::from_secs(310));
        assert!(report.success());
        assert!(control.contains(&subnet));
    }

    #[tokio::test]
    async fn test_iam_unbind_is_best_effort() {
        let (plan, control) = provisioned(0).await;
        let binding = step(&plan, ResourceKind::IamBinding);
        control.sticky_delete(&binding, 1);

        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(report.soft_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_hard_failure_continues() {
        let (plan, control) = provisioned(0).await;
        let instance = step(&plan, ResourceKind::Instance);
        control.sticky_delete(&instance, 1);

        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();
        assert!(!report.success());
        assert_eq!(report.hard_failures.len(), 1);
        // everything not blocked by the instance is still removed
        assert_eq!(control.count_in(ResourceCategory::Serverless), 0);
        assert_eq!(control.count_in(ResourceCategory::Identity), 0);
    }

    #[test]
    fn test_relay_index() {
        assert_eq!(relay_index("crossnet", "crossnet-spoke1-relay-3"), Some(3));
        assert_eq!(relay_index("crossnet", "crossnet-spoke2-relay-12"), Some(12));
        assert_eq!(relay_index("crossnet", "crossnet-spoke1-echo"), None);
        assert_eq!(relay_index("crossnet", "other-spoke1-relay-3"), None);
        assert_eq!(relay_index("crossnet", "crossnet-spoke1-relay-x"), None);
        assert_eq!(relay_index("crossnet", "crossnet-spokeA-relay-1"), None);
    }

    #[tokio::test]
    async fn test_discovers_deployed_relays() {
        let (_, control) = provisioned(3).await;
        let config = DeployConfig::new("demo");
        assert_eq!(discover_relay_scale(&control, &config).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_discovers_nothing_without_relays() {
        let (_, control) = provisioned(0).await;
        let config = DeployConfig::new("demo");
        assert_eq!(discover_relay_scale(&control, &config).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_image_alone_is_discovered() {
        let (plan, control) = provisioned(1).await;
        for service in plan
            .graph
            .steps()
            .iter()
            .filter(|s| s.resource.kind == ResourceKind::RunService)
        {
            control.delete(&service.resource).await.unwrap();
        }
        let config = DeployConfig::new("demo");
        assert_eq!(discover_relay_scale(&control, &config).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_teardown_plan_widens_to_deployed_relays() {
        let (_, control) = provisioned(2).await;
        let config = DeployConfig::new("demo");
        let plan = plan_for_teardown(&control, &config).await.unwrap();

        let report = Decommissioner::new(&control, 5)
            .teardown(&plan.graph)
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(control.count_in(ResourceCategory::Serverless), 0);
        assert_eq!(control.count_in(ResourceCategory::Registry), 0);
    }
}
