//! crossnet-provisioner: idempotent orchestration of the hub and spoke demo
//!
//! The five operator entry points map onto this crate as follows:
//! - identity bootstrap, base provisioning and connectivity: [`Reconciler`]
//!   over one [`Phase`] of the [`Plan`]
//! - decommissioning: [`Decommissioner`] over the whole plan
//! - traffic checks: [`exercise`]
//!
//! All of them talk to the cloud through [`ControlPlane`]; [`GcloudCli`]
//! drives the real CLI and [`InMemoryControlPlane`] stands in for dry runs
//! and tests.

pub mod cert;
pub mod control;
pub mod error;
pub mod exercise;
pub mod gcloud;
pub mod graph;
pub mod memory;
pub mod plan;
pub mod reconcile;
pub mod retry;
pub mod teardown;

pub use control::{BgpStatus, CommandOutput, ControlPlane, JobOutcome};
pub use error::{ProvisionError, Result};
pub use exercise::{exercise, ExerciseOptions, ExerciseReport};
pub use gcloud::GcloudCli;
pub use graph::{Phase, Step, StepGraph};
pub use memory::InMemoryControlPlane;
pub use plan::Plan;
pub use reconcile::{ReconcileReport, Reconciler};
pub use retry::RetryPolicy;
pub use teardown::{discover_relay_scale, plan_for_teardown, Decommissioner, TeardownReport};
