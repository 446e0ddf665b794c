//! In-memory control plane
//!
//! Backs `--dry-run` and the test suites. Resources live in a map keyed by
//! identity; failures can be injected per resource.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use crossnet_core::{Resource, ResourceCategory, ResourceKind, ResourceSpec};

use crate::control::{BgpStatus, CommandOutput, ControlPlane, JobOutcome};
use crate::error::{ProvisionError, Result};

#[derive(Default)]
struct State {
    resources: BTreeMap<String, Resource>,
    addresses: HashMap<String, Ipv4Addr>,
    next_address: u32,
    create_failures: HashMap<String, String>,
    /// Remaining failing delete attempts per key
    sticky: HashMap<String, u32>,
    failing_jobs: HashMap<String, String>,
    unconverged: Vec<String>,
    failing_curls: Vec<Ipv4Addr>,
}

pub struct InMemoryControlPlane {
    state: Mutex<State>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    delete_attempts: AtomicUsize,
    project: Option<String>,
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            delete_attempts: AtomicUsize::new(0),
            project: None,
        }
    }

    /// Report `project` as the ambient CLI project
    pub fn with_default_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a resource without counting a creation
    pub fn insert(&self, resource: Resource) {
        let mut state = self.lock();
        assign_address(&mut state, &resource);
        state.resources.insert(resource.key(), resource);
    }

    pub fn fail_create(&self, resource: &Resource, message: &str) {
        self.lock()
            .create_failures
            .insert(resource.key(), message.to_string());
    }

    /// Make the next `attempts` deletions of `resource` fail
    pub fn sticky_delete(&self, resource: &Resource, attempts: u32) {
        self.lock().sticky.insert(resource.key(), attempts);
    }

    pub fn fail_job(&self, job: &str, output: &str) {
        self.lock()
            .failing_jobs
            .insert(job.to_string(), output.to_string());
    }

    /// Keep every session on `router` down
    pub fn hold_bgp_down(&self, router: &str) {
        self.lock().unconverged.push(router.to_string());
    }

    /// Requests to `ip` from an instance get no answer
    pub fn drop_requests_to(&self, ip: Ipv4Addr) {
        self.lock().failing_curls.push(ip);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn delete_attempts(&self) -> usize {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.lock().resources.values().cloned().collect()
    }

    pub fn contains(&self, resource: &Resource) -> bool {
        self.lock().resources.contains_key(&resource.key())
    }

    pub fn count_in(&self, category: ResourceCategory) -> usize {
        self.lock()
            .resources
            .values()
            .filter(|r| r.kind.category() == Some(category))
            .count()
    }

    fn find(&self, kind: ResourceKind, name: &str) -> Option<Resource> {
        self.lock()
            .resources
            .values()
            .find(|r| r.kind == kind && r.name == name)
            .cloned()
    }
}

/// Instances and addresses get a stable address from a private block
fn assign_address(state: &mut State, resource: &Resource) {
    if !matches!(resource.kind, ResourceKind::Instance | ResourceKind::Address) {
        return;
    }
    if state.addresses.contains_key(&resource.key()) {
        return;
    }
    state.next_address += 1;
    let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 250, 0, 1)) + state.next_address);
    state.addresses.insert(resource.key(), ip);
}

/// `seq N` in a generated command line
fn sequence_len(command: &str) -> usize {
    command
        .split_whitespace()
        .skip_while(|w| *w != "seq")
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn exists(&self, resource: &Resource) -> Result<bool> {
        Ok(self.contains(resource))
    }

    async fn create(&self, resource: &Resource) -> Result<()> {
        let mut state = self.lock();
        if let Some(message) = state.create_failures.get(&resource.key()) {
            return Err(ProvisionError::Injected(message.clone()));
        }
        assign_address(&mut state, resource);
        state.resources.insert(resource.key(), resource.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let key = resource.key();
        let mut state = self.lock();

        if let Some(remaining) = state.sticky.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProvisionError::Injected(format!(
                    "{} is still in use",
                    resource
                )));
            }
        }

        if state.resources.remove(&key).is_none() {
            return Err(ProvisionError::NotFound(resource.to_string()));
        }
        state.addresses.remove(&key);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn instance_ip(&self, instance: &str, _zone: &str) -> Result<Ipv4Addr> {
        let resource = self
            .find(ResourceKind::Instance, instance)
            .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", instance)))?;
        self.lock()
            .addresses
            .get(&resource.key())
            .copied()
            .ok_or_else(|| ProvisionError::NotFound(format!("address of {}", instance)))
    }

    async fn address_ip(&self, address: &str, _region: &str) -> Result<Ipv4Addr> {
        let resource = self
            .find(ResourceKind::Address, address)
            .ok_or_else(|| ProvisionError::NotFound(format!("address {}", address)))?;
        self.lock()
            .addresses
            .get(&resource.key())
            .copied()
            .ok_or_else(|| ProvisionError::NotFound(format!("address {}", address)))
    }

    async fn execute_job(&self, job: &str, _region: &str) -> Result<JobOutcome> {
        if self.find(ResourceKind::RunJob, job).is_none() {
            return Err(ProvisionError::NotFound(format!("job {}", job)));
        }
        let failure = self.lock().failing_jobs.get(job).cloned();
        Ok(match failure {
            Some(output) => JobOutcome {
                job: job.to_string(),
                succeeded: false,
                output,
            },
            None => JobOutcome {
                job: job.to_string(),
                succeeded: true,
                output: "Status: 200\nBody:\nOK\n".to_string(),
            },
        })
    }

    async fn run_on_instance(
        &self,
        instance: &str,
        _zone: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        if self.find(ResourceKind::Instance, instance).is_none() {
            return Err(ProvisionError::NotFound(format!("instance {}", instance)));
        }
        let dropped = self
            .lock()
            .failing_curls
            .iter()
            .any(|ip| command.contains(&ip.to_string()));
        let code = if dropped { "000" } else { "200" };
        let stdout = vec![code; sequence_len(command)].join("\n") + "\n";
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn bgp_status(&self, router: &str, _region: &str) -> Result<BgpStatus> {
        if self.find(ResourceKind::Router, router).is_none() {
            return Err(ProvisionError::NotFound(format!("router {}", router)));
        }
        let state = self.lock();
        let total = state
            .resources
            .values()
            .filter(|r| {
                matches!(&r.spec, ResourceSpec::BgpPeer { router: owner, .. } if owner == router)
            })
            .count();
        let established = if state.unconverged.iter().any(|r| r == router) {
            0
        } else {
            total
        };
        Ok(BgpStatus {
            router: router.to_string(),
            established,
            total,
        })
    }

    async fn list_services(&self, region: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .resources
            .values()
            .filter(|r| r.kind == ResourceKind::RunService && r.region() == Some(region))
            .map(|r| r.name.clone())
            .collect())
    }

    async fn default_project(&self) -> Result<Option<String>> {
        Ok(self.project.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossnet_core::Scope;

    fn network(name: &str) -> Resource {
        Resource::new(ResourceKind::Network, name, Scope::Global, ResourceSpec::Network)
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let control = InMemoryControlPlane::new();
        let net = network("n");
        assert!(!control.exists(&net).await.unwrap());

        control.create(&net).await.unwrap();
        assert!(control.exists(&net).await.unwrap());
        assert_eq!(control.count_in(ResourceCategory::Network), 1);

        control.delete(&net).await.unwrap();
        assert!(!control.exists(&net).await.unwrap());
        assert!(control.delete(&net).await.unwrap_err().is_not_found());
        assert_eq!((control.creates(), control.deletes()), (1, 1));
    }

    #[tokio::test]
    async fn test_sticky_delete() {
        let control = InMemoryControlPlane::new();
        let net = network("n");
        control.insert(net.clone());
        control.sticky_delete(&net, 2);

        assert!(control.delete(&net).await.is_err());
        assert!(control.delete(&net).await.is_err());
        control.delete(&net).await.unwrap();
        assert_eq!(control.delete_attempts(), 3);
    }

    #[test]
    fn test_sequence_len() {
        assert_eq!(sequence_len("seq 4 | xargs -P 4"), 4);
        assert_eq!(sequence_len("curl -sk https://10.0.0.1/"), 1);
    }
}
