//! Control-plane resources and their desired configuration
//!
//! A [`Resource`] is identified by kind, name and scope. Its spec is only used
//! when the resource has to be created; an existing resource is never compared
//! against it.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::topology::SubnetPurpose;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project,
    Global,
    Region(String),
    Zone(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project => write!(f, "project"),
            Scope::Global => write!(f, "global"),
            Scope::Region(r) => write!(f, "region/{}", r),
            Scope::Zone(z) => write!(f, "zone/{}", z),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ProjectApi,
    ServiceAccount,
    IamBinding,
    ArtifactRepository,
    ContainerImage,
    Network,
    Subnet,
    FirewallRule,
    Instance,
    Router,
    VpnGateway,
    VpnTunnel,
    RouterInterface,
    BgpPeer,
    Nat,
    NatRule,
    ServerlessNeg,
    BackendService,
    BackendAttachment,
    UrlMap,
    SslCertificate,
    TargetHttpsProxy,
    Address,
    ForwardingRule,
    RunService,
    RunJob,
}

/// Resource families counted when checking that teardown is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Identity,
    Registry,
    Network,
    Firewall,
    Compute,
    Serverless,
    Vpn,
    Translation,
    LoadBalancing,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 9] = [
        Self::Identity,
        Self::Registry,
        Self::Network,
        Self::Firewall,
        Self::Compute,
        Self::Serverless,
        Self::Vpn,
        Self::Translation,
        Self::LoadBalancing,
    ];
}

impl ResourceKind {
    /// `None` for project prerequisites that teardown leaves in place
    pub fn category(&self) -> Option<ResourceCategory> {
        use ResourceCategory as C;
        match self {
            Self::ProjectApi => None,
            Self::ServiceAccount | Self::IamBinding => Some(C::Identity),
            Self::ArtifactRepository | Self::ContainerImage => Some(C::Registry),
            Self::Network | Self::Subnet => Some(C::Network),
            Self::FirewallRule => Some(C::Firewall),
            Self::Instance => Some(C::Compute),
            Self::RunService | Self::RunJob => Some(C::Serverless),
            Self::Router
            | Self::VpnGateway
            | Self::VpnTunnel
            | Self::RouterInterface
            | Self::BgpPeer => Some(C::Vpn),
            Self::Nat | Self::NatRule => Some(C::Translation),
            Self::ServerlessNeg
            | Self::BackendService
            | Self::BackendAttachment
            | Self::UrlMap
            | Self::SslCertificate
            | Self::TargetHttpsProxy
            | Self::Address
            | Self::ForwardingRule => Some(C::LoadBalancing),
        }
    }

    /// Position in the teardown sequence, lowest first.
    ///
    /// Workloads holding subnet address reservations go first, then the load
    /// balancing chain, translation, tunnels and routing, compute, subnets,
    /// networks, registry, and identity last.
    pub fn teardown_rank(&self) -> u8 {
        match self {
            Self::RunService | Self::RunJob => 0,
            Self::ForwardingRule => 10,
            Self::Address => 11,
            Self::TargetHttpsProxy => 12,
            Self::SslCertificate => 13,
            Self::UrlMap => 14,
            Self::BackendAttachment => 15,
            Self::BackendService => 16,
            Self::ServerlessNeg => 17,
            Self::NatRule => 20,
            Self::Nat => 21,
            Self::BgpPeer => 30,
            Self::RouterInterface => 31,
            Self::VpnTunnel => 32,
            Self::VpnGateway => 33,
            Self::Router => 40,
            Self::Instance => 50,
            Self::FirewallRule => 51,
            Self::Subnet => 60,
            Self::Network => 61,
            Self::ContainerImage => 70,
            Self::ArtifactRepository => 71,
            Self::IamBinding => 80,
            Self::ServiceAccount => 81,
            Self::ProjectApi => 90,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ProjectApi => "api",
            Self::ServiceAccount => "service account",
            Self::IamBinding => "iam binding",
            Self::ArtifactRepository => "artifact repository",
            Self::ContainerImage => "container image",
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::FirewallRule => "firewall rule",
            Self::Instance => "instance",
            Self::Router => "router",
            Self::VpnGateway => "vpn gateway",
            Self::VpnTunnel => "vpn tunnel",
            Self::RouterInterface => "router interface",
            Self::BgpPeer => "bgp peer",
            Self::Nat => "nat",
            Self::NatRule => "nat rule",
            Self::ServerlessNeg => "serverless neg",
            Self::BackendService => "backend service",
            Self::BackendAttachment => "backend attachment",
            Self::UrlMap => "url map",
            Self::SslCertificate => "ssl certificate",
            Self::TargetHttpsProxy => "target https proxy",
            Self::Address => "address",
            Self::ForwardingRule => "forwarding rule",
            Self::RunService => "run service",
            Self::RunJob => "run job",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Environment variable value injected into a serverless workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    /// `http://<internal ip>:<port>/` of an instance, resolved at creation time
    InstanceUrl {
        instance: String,
        zone: String,
        port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// Internet egress with auto-allocated external addresses
    Public,
    /// Hybrid NAT for traffic leaving through a tunnel
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ingress {
    All,
    Internal,
    InternalAndCloudLoadBalancing,
}

impl Ingress {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Ingress::All => "all",
            Ingress::Internal => "internal",
            Ingress::InternalAndCloudLoadBalancing => "internal-and-cloud-load-balancing",
        }
    }
}

/// Direct VPC egress placement of a serverless workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcEgress {
    pub network: String,
    pub subnet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    ProjectApi {
        api: String,
    },
    ServiceAccount {
        account_id: String,
        email: String,
        display_name: String,
    },
    IamBinding {
        member: String,
        role: String,
    },
    ArtifactRepository,
    ContainerImage {
        uri: String,
        /// Binary baked into the image by the shared Dockerfile
        binary: String,
    },
    Network,
    Subnet {
        network: String,
        range: Ipv4Net,
        purpose: SubnetPurpose,
    },
    FirewallRule {
        network: String,
        source_ranges: Vec<Ipv4Net>,
        allow: Vec<String>,
        target_tags: Vec<String>,
    },
    Instance {
        machine_type: String,
        subnet: String,
        tags: Vec<String>,
        startup_script: String,
    },
    Router {
        network: String,
        asn: Option<u32>,
        /// Custom advertisement allow-list; empty means no BGP advertisements
        advertised: Vec<Ipv4Net>,
    },
    VpnGateway {
        network: String,
    },
    VpnTunnel {
        gateway: String,
        interface: u8,
        peer_gateway: String,
        router: String,
        shared_secret: String,
    },
    RouterInterface {
        router: String,
        tunnel: String,
        ip: Ipv4Addr,
        mask_length: u8,
    },
    BgpPeer {
        router: String,
        interface: String,
        peer_ip: Ipv4Addr,
        peer_asn: u32,
    },
    Nat {
        router: String,
        nat_type: NatType,
        /// Subnets translated by a private NAT
        source_subnets: Vec<String>,
    },
    NatRule {
        router: String,
        nat: String,
        number: u32,
        match_expression: String,
        source_nat_subnets: Vec<String>,
    },
    ServerlessNeg {
        service: String,
    },
    BackendService,
    BackendAttachment {
        backend: String,
        neg: String,
    },
    UrlMap {
        default_service: String,
    },
    SslCertificate {
        common_name: String,
        validity_days: u32,
    },
    TargetHttpsProxy {
        url_map: String,
        certificate: String,
    },
    Address {
        subnet: String,
    },
    ForwardingRule {
        network: String,
        subnet: String,
        address: String,
        target_proxy: String,
        port: u16,
    },
    RunService {
        image: String,
        egress: VpcEgress,
        ingress: Ingress,
        max_instances: u32,
        concurrency: u32,
        env: Vec<EnvVar>,
    },
    RunJob {
        image: String,
        egress: VpcEgress,
        max_retries: u32,
        task_timeout_secs: u32,
        env: Vec<EnvVar>,
    },
}

/// A resource at a fully-qualified identity with its desired configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
    pub scope: Scope,
    pub spec: ResourceSpec,
}

impl Resource {
    pub fn new(
        kind: ResourceKind,
        name: impl Into<String>,
        scope: Scope,
        spec: ResourceSpec,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            scope,
            spec,
        }
    }

    /// Identity string, unique within a project
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.kind.label(), self.scope, self.name)
    }

    pub fn region(&self) -> Option<&str> {
        match &self.scope {
            Scope::Region(r) => Some(r),
            _ => None,
        }
    }

    pub fn zone(&self) -> Option<&str> {
        match &self.scope {
            Scope::Zone(z) => Some(z),
            _ => None,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_has_a_kind() {
        let kinds = [
            ResourceKind::ServiceAccount,
            ResourceKind::ContainerImage,
            ResourceKind::Subnet,
            ResourceKind::FirewallRule,
            ResourceKind::Instance,
            ResourceKind::RunJob,
            ResourceKind::VpnTunnel,
            ResourceKind::NatRule,
            ResourceKind::ForwardingRule,
        ];
        let mut categories: Vec<_> = kinds.iter().filter_map(|k| k.category()).collect();
        categories.sort();
        assert_eq!(categories, ResourceCategory::ALL.to_vec());
        assert_eq!(ResourceKind::ProjectApi.category(), None);
    }

    #[test]
    fn test_teardown_rank_orders_dependents_first() {
        use ResourceKind::*;
        let chain = [
            RunService,
            ForwardingRule,
            Nat,
            VpnTunnel,
            Router,
            Subnet,
            Network,
            ServiceAccount,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].teardown_rank() < pair[1].teardown_rank(), "{:?}", pair);
        }
    }

    #[test]
    fn test_key_includes_scope() {
        let a = Resource::new(
            ResourceKind::Network,
            "net",
            Scope::Global,
            ResourceSpec::Network,
        );
        let b = Resource::new(
            ResourceKind::Subnet,
            "net",
            Scope::Region("r".into()),
            ResourceSpec::Subnet {
                network: "net".into(),
                range: "10.0.0.0/24".parse().unwrap(),
                purpose: SubnetPurpose::General,
            },
        );
        assert_eq!(a.key(), "network:global:net");
        assert_eq!(b.key(), "subnet:region/r:net");
    }
}
