//! crossnet-core: configuration, address plan and resource model
//!
//! Serverless workloads in every spoke egress from the same colliding range.
//! This crate owns the data that keeps that safe:
//! - [`DeployConfig`]: project, region and scale settings threaded through
//!   every entry point
//! - [`Topology`]: the hub and spoke address plan, BGP sessions and
//!   advertisement allow-lists, with collision validation
//! - [`Resource`]: a control-plane object identified by kind, name and scope
//!
//! Routing, NAT and load balancing are performed by the cloud provider; this
//! crate only describes what to ask for.

mod config;
mod error;
mod resource;
pub mod topology;

pub use config::{env, DeployConfig, DEFAULT_FAN_OUT, DEFAULT_REGION, MAX_SPOKES};
pub use error::Error;
pub use resource::{
    EnvValue, EnvVar, Ingress, NatType, Resource, ResourceCategory, ResourceKind, ResourceSpec,
    Scope, VpcEgress,
};
pub use topology::{
    LinkPlan, LoadBalancerPlan, Side, SpokePlan, SubnetPlan, SubnetPurpose, Topology, TunnelPlan,
};

pub type Result<T> = std::result::Result<T, Error>;
