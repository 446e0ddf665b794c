//! Control-plane seam
//!
//! Everything the orchestration layers know about the cloud goes through
//! [`ControlPlane`]. `exists` never reports absence as an error.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use crossnet_core::Resource;

use crate::error::Result;

/// Result of one completed job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    pub succeeded: bool,
    pub output: String,
}

/// Output of a command run on an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Session state of one routing router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpStatus {
    pub router: String,
    pub established: usize,
    pub total: usize,
}

impl BgpStatus {
    pub fn converged(&self) -> bool {
        self.total > 0 && self.established == self.total
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Whether a resource with this identity exists
    async fn exists(&self, resource: &Resource) -> Result<bool>;

    async fn create(&self, resource: &Resource) -> Result<()>;

    async fn delete(&self, resource: &Resource) -> Result<()>;

    /// Internal address of a compute instance
    async fn instance_ip(&self, instance: &str, zone: &str) -> Result<Ipv4Addr>;

    /// Address held by a reserved internal address
    async fn address_ip(&self, address: &str, region: &str) -> Result<Ipv4Addr>;

    /// Execute a job and wait for it to finish
    async fn execute_job(&self, job: &str, region: &str) -> Result<JobOutcome>;

    /// Run a shell command on an instance through the identity-aware tunnel
    async fn run_on_instance(&self, instance: &str, zone: &str, command: &str)
        -> Result<CommandOutput>;

    async fn bgp_status(&self, router: &str, region: &str) -> Result<BgpStatus>;

    /// Names of the serverless services deployed in `region`
    async fn list_services(&self, region: &str) -> Result<Vec<String>>;

    /// Project configured in the ambient CLI, if any
    async fn default_project(&self) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgp_converged() {
        let status = |established, total| BgpStatus {
            router: "r".into(),
            established,
            total,
        };
        assert!(status(4, 4).converged());
        assert!(!status(3, 4).converged());
        assert!(!status(0, 0).converged());
    }
}
