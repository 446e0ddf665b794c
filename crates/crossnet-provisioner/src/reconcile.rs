//! Idempotent creation
//!
//! Every step is `exists` then `create`. A resource that already exists is
//! left untouched, whatever its configuration.

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::info;

use crossnet_core::{EnvValue, EnvVar, Resource, ResourceSpec};

use crate::control::ControlPlane;
use crate::error::Result;
use crate::graph::{Phase, Step, StepGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Created,
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    fn record(&mut self, resource: &Resource, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Created => self.created.push(resource.to_string()),
            StepOutcome::Skipped => self.skipped.push(resource.to_string()),
        }
    }

    pub fn total(&self) -> usize {
        self.created.len() + self.skipped.len()
    }
}

/// Replace deferred environment values with concrete ones
pub async fn resolve_env<C>(control: &C, resource: &Resource) -> Result<Resource>
where
    C: ControlPlane + ?Sized,
{
    let env = match &resource.spec {
        ResourceSpec::RunService { env, .. } | ResourceSpec::RunJob { env, .. } => env,
        _ => return Ok(resource.clone()),
    };

    let mut resolved = Vec::with_capacity(env.len());
    for var in env {
        let value = match &var.value {
            EnvValue::Literal(v) => v.clone(),
            EnvValue::InstanceUrl {
                instance,
                zone,
                port,
            } => {
                let ip = control.instance_ip(instance, zone).await?;
                format!("http://{}:{}/", ip, port)
            }
        };
        resolved.push(EnvVar::literal(var.name.clone(), value));
    }

    let mut out = resource.clone();
    match &mut out.spec {
        ResourceSpec::RunService { env, .. } | ResourceSpec::RunJob { env, .. } => *env = resolved,
        _ => {}
    }
    Ok(out)
}

/// Create `resource` unless it already exists
pub async fn reconcile_step<C>(control: &C, resource: &Resource) -> Result<StepOutcome>
where
    C: ControlPlane + ?Sized,
{
    if control.exists(resource).await? {
        info!(resource = %resource.name, "[SKIP] {} already exists", resource);
        return Ok(StepOutcome::Skipped);
    }

    let resolved = resolve_env(control, resource).await?;
    control.create(&resolved).await?;
    info!(resource = %resource.name, "[OK] created {}", resource);
    Ok(StepOutcome::Created)
}

pub struct Reconciler<'a, C: ?Sized> {
    control: &'a C,
    fan_out: usize,
}

impl<'a, C> Reconciler<'a, C>
where
    C: ControlPlane + ?Sized,
{
    pub fn new(control: &'a C, fan_out: usize) -> Self {
        Self {
            control,
            fan_out: fan_out.max(1),
        }
    }

    /// Reconcile every step of `phase` in dependency order.
    ///
    /// Runs of adjacent fan-out steps are reconciled concurrently, at most
    /// `fan_out` at a time. The first failure aborts the phase.
    pub async fn reconcile(&self, graph: &StepGraph, phase: Phase) -> Result<ReconcileReport> {
        let order = graph.phase_order(phase)?;
        let mut report = ReconcileReport::default();

        info!(phase = %phase, steps = order.len(), "Reconciling");

        let mut rest: &[&Step] = &order;
        while let Some(first) = rest.first() {
            if first.fan_out {
                let run = rest.iter().take_while(|s| s.fan_out).count();
                let (batch, tail) = rest.split_at(run);
                self.reconcile_batch(batch, &mut report).await?;
                rest = tail;
            } else {
                let outcome = reconcile_step(self.control, &first.resource)
                    .await
                    .map_err(|e| e.at_step(first.resource.to_string()))?;
                report.record(&first.resource, outcome);
                rest = &rest[1..];
            }
        }

        Ok(report)
    }

    async fn reconcile_batch(&self, batch: &[&Step], report: &mut ReconcileReport) -> Result<()> {
        info!(steps = batch.len(), limit = self.fan_out, "Reconciling serverless workloads");

        let outcomes: Vec<(&Resource, StepOutcome)> = stream::iter(batch.iter())
            .map(|step| async move {
                let outcome = reconcile_step(self.control, &step.resource)
                    .await
                    .map_err(|e| e.at_step(step.resource.to_string()))?;
                Ok::<_, crate::error::ProvisionError>((&step.resource, outcome))
            })
            .buffer_unordered(self.fan_out)
            .try_collect()
            .await?;

        for (resource, outcome) in outcomes {
            report.record(resource, outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryControlPlane;
    use crate::plan::Plan;
    use crossnet_core::{DeployConfig, ResourceKind, Topology};

    fn plan() -> Plan {
        let config = DeployConfig::new("demo").with_relay_scale(1);
        let topology = Topology::build(&config).unwrap();
        Plan::build(&config, &topology).unwrap()
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let plan = plan();
        let control = InMemoryControlPlane::new();
        let reconciler = Reconciler::new(&control, 5);

        for phase in [Phase::Identity, Phase::Base, Phase::Connectivity] {
            reconciler.reconcile(&plan.graph, phase).await.unwrap();
        }
        let created = control.creates();
        assert_eq!(created, plan.graph.len());

        for phase in [Phase::Identity, Phase::Base, Phase::Connectivity] {
            let report = reconciler.reconcile(&plan.graph, phase).await.unwrap();
            assert!(report.created.is_empty());
        }
        assert_eq!(control.creates(), created);
    }

    #[tokio::test]
    async fn test_existing_resource_is_left_alone() {
        let plan = plan();
        let control = InMemoryControlPlane::new();
        let step = plan.graph.phase_order(Phase::Identity).unwrap()[0];
        control.insert(step.resource.clone());

        let report = Reconciler::new(&control, 1)
            .reconcile(&plan.graph, Phase::Identity)
            .await
            .unwrap();
        assert_eq!(report.skipped, vec![step.resource.to_string()]);
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let plan = plan();
        let control = InMemoryControlPlane::new();
        let order = plan.graph.phase_order(Phase::Identity).unwrap();
        let failing = order[1].resource.clone();
        control.fail_create(&failing, "quota exceeded");

        let err = Reconciler::new(&control, 5)
            .reconcile(&plan.graph, Phase::Identity)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&failing.to_string()));
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(control.creates(), 1);
    }

    #[tokio::test]
    async fn test_job_target_resolved_from_hub_address() {
        let plan = plan();
        let control = InMemoryControlPlane::new();
        let reconciler = Reconciler::new(&control, 5);
        reconciler.reconcile(&plan.graph, Phase::Identity).await.unwrap();
        reconciler.reconcile(&plan.graph, Phase::Base).await.unwrap();

        let hub = plan
            .graph
            .steps()
            .iter()
            .find(|s| s.resource.kind == ResourceKind::Instance)
            .unwrap();
        let ip = control
            .instance_ip(&hub.resource.name, hub.resource.zone().unwrap())
            .await
            .unwrap();

        let job = control
            .resources()
            .into_iter()
            .find(|r| r.kind == ResourceKind::RunJob)
            .unwrap();
        match job.spec {
            ResourceSpec::RunJob { env, .. } => {
                assert_eq!(env[0].value, EnvValue::Literal(format!("http://{}:80/", ip)));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fan_out_failure_is_reported() {
        let plan = plan();
        let control = InMemoryControlPlane::new();
        let reconciler = Reconciler::new(&control, 2);
        reconciler.reconcile(&plan.graph, Phase::Identity).await.unwrap();

        let service = plan
            .graph
            .steps()
            .iter()
            .find(|s| s.fan_out)
            .unwrap()
            .resource
            .clone();
        control.fail_create(&service, "revision failed");

        let err = reconciler.reconcile(&plan.graph, Phase::Base).await.unwrap_err();
        assert!(err.to_string().contains("revision failed"));
    }
}
