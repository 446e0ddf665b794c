//! `gcloud` control plane
//!
//! Each resource maps to one describe, create and delete invocation. Sub-resources
//! without their own describe call (router interfaces, BGP peers, backend
//! attachments, IAM bindings) are looked up in the parent's JSON.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crossnet_core::{
    DeployConfig, EnvValue, EnvVar, NatType, Resource, ResourceKind, ResourceSpec, Scope,
    SubnetPurpose,
};

use crate::cert::SelfSignedCert;
use crate::control::{BgpStatus, CommandOutput, ControlPlane, JobOutcome};
use crate::error::{ProvisionError, Result};

/// Bound on a single CLI call
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

pub const HUB_IMAGE_FAMILY: &str = "debian-12";
pub const HUB_IMAGE_PROJECT: &str = "debian-cloud";

/// How existence of a resource is decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Success means present, a not-found error means absent
    Describe(Vec<String>),
    /// Fetch JSON and search it with [`present_in`]
    Search(Vec<String>),
}

pub struct GcloudCli {
    program: PathBuf,
    project: String,
    build_context: PathBuf,
    timeout: Duration,
    cert_dir: TempDir,
}

fn s(v: impl Into<String>) -> String {
    v.into()
}

fn flag(name: &str, value: impl std::fmt::Display) -> String {
    format!("--{}={}", name, value)
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join(",")
}

fn scope_flag(resource: &Resource) -> Option<String> {
    match &resource.scope {
        Scope::Region(r) => Some(flag("region", r)),
        Scope::Zone(z) => Some(flag("zone", z)),
        Scope::Project | Scope::Global => None,
    }
}

const DENIED_MARKERS: [&str; 5] = [
    "PERMISSION_DENIED",
    "HTTPError 403",
    "code=403",
    "Forbidden",
    "or it may not exist",
];

const NOT_FOUND_MARKERS: [&str; 5] = [
    "NOT_FOUND",
    "HTTPError 404",
    "code=404",
    "was not found",
    "Cannot find",
];

/// stderr of a call that failed because the resource is missing
///
/// A denied call is never reported as missing, whatever else it says.
pub fn is_not_found(stderr: &str) -> bool {
    if DENIED_MARKERS.iter().any(|m| stderr.contains(m)) {
        return false;
    }
    NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
}

pub fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("ALREADY_EXISTS") || stderr.to_ascii_lowercase().contains("already exists")
}

/// Render env vars for `--set-env-vars`, switching delimiter when a value has a comma
pub fn env_flag(env: &[EnvVar]) -> Result<Option<String>> {
    if env.is_empty() {
        return Ok(None);
    }
    let mut pairs = Vec::with_capacity(env.len());
    for var in env {
        match &var.value {
            EnvValue::Literal(v) => pairs.push(format!("{}={}", var.name, v)),
            EnvValue::InstanceUrl { .. } => {
                return Err(ProvisionError::Unresolved(var.name.clone()))
            }
        }
    }
    let value = if pairs.iter().any(|p| p.contains(',')) {
        format!("^@^{}", pairs.join("@"))
    } else {
        pairs.join(",")
    };
    Ok(Some(flag("set-env-vars", value)))
}

/// Whether `resource` appears in the JSON returned by its [`Lookup::Search`]
pub fn present_in(resource: &Resource, json: &Value) -> bool {
    let names = |field: &str| -> Vec<String> {
        json.get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    match &resource.spec {
        ResourceSpec::RouterInterface { .. } => names("interfaces").contains(&resource.name),
        ResourceSpec::BgpPeer { .. } => names("bgpPeers").contains(&resource.name),
        ResourceSpec::BackendAttachment { neg, .. } => json
            .get("backends")
            .and_then(Value::as_array)
            .map(|backends| {
                backends.iter().any(|b| {
                    b.get("group")
                        .and_then(Value::as_str)
                        .is_some_and(|g| g.ends_with(&format!("/networkEndpointGroups/{}", neg)))
                })
            })
            .unwrap_or(false),
        ResourceSpec::IamBinding { member, role } => json
            .get("bindings")
            .and_then(Value::as_array)
            .map(|bindings| {
                bindings.iter().any(|b| {
                    b.get("role").and_then(Value::as_str) == Some(role.as_str())
                        && b.get("members")
                            .and_then(Value::as_array)
                            .is_some_and(|m| m.iter().any(|v| v.as_str() == Some(member.as_str())))
                })
            })
            .unwrap_or(false),
        ResourceSpec::ProjectApi { .. } => json.as_array().is_some_and(|a| !a.is_empty()),
        _ => false,
    }
}

/// Established and total sessions from `routers get-status` JSON
pub fn parse_bgp_status(router: &str, json: &Value) -> BgpStatus {
    let peers = json
        .pointer("/result/bgpPeerStatus")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let established = peers
        .iter()
        .filter(|p| p.get("status").and_then(Value::as_str) == Some("UP"))
        .count();
    BgpStatus {
        router: router.to_string(),
        established,
        total: peers.len(),
    }
}

impl GcloudCli {
    pub fn new(config: &DeployConfig) -> Result<Self> {
        Ok(Self {
            program: PathBuf::from("gcloud"),
            project: config.project.clone(),
            build_context: config.build_context.clone(),
            timeout: COMMAND_TIMEOUT,
            cert_dir: tempfile::Builder::new().prefix("crossnet-certs").tempdir()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn cert_paths(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = self.cert_dir.path();
        (dir.join(format!("{}.crt", name)), dir.join(format!("{}.key", name)))
    }

    /// Arguments deciding whether `resource` exists
    pub fn lookup(&self, resource: &Resource) -> Lookup {
        let name = resource.name.clone();
        let mut args: Vec<String> = match (&resource.kind, &resource.spec) {
            (_, ResourceSpec::ProjectApi { api }) => {
                return Lookup::Search(self.finish(vec![
                    s("services"),
                    s("list"),
                    s("--enabled"),
                    flag("filter", format!("config.name={}", api)),
                    s("--format=json"),
                ]))
            }
            (_, ResourceSpec::ServiceAccount { email, .. }) => {
                vec![s("iam"), s("service-accounts"), s("describe"), email.clone()]
            }
            (_, ResourceSpec::IamBinding { .. }) => {
                return Lookup::Search(self.finish(vec![
                    s("projects"),
                    s("get-iam-policy"),
                    self.project.clone(),
                    s("--format=json"),
                ]))
            }
            (_, ResourceSpec::ArtifactRepository) => {
                let mut v = vec![s("artifacts"), s("repositories"), s("describe"), name];
                v.extend(resource.region().map(|r| flag("location", r)));
                return Lookup::Describe(self.finish(v));
            }
            (_, ResourceSpec::ContainerImage { uri, .. }) => {
                return Lookup::Describe(self.finish(vec![
                    s("artifacts"),
                    s("docker"),
                    s("images"),
                    s("describe"),
                    uri.clone(),
                ]))
            }
            (_, ResourceSpec::RouterInterface { router, .. })
            | (_, ResourceSpec::BgpPeer { router, .. }) => {
                let mut v = vec![s("compute"), s("routers"), s("describe"), router.clone()];
                v.extend(scope_flag(resource));
                v.push(s("--format=json"));
                return Lookup::Search(self.finish(v));
            }
            (_, ResourceSpec::BackendAttachment { backend, .. }) => {
                let mut v = vec![
                    s("compute"),
                    s("backend-services"),
                    s("describe"),
                    backend.clone(),
                ];
                v.extend(scope_flag(resource));
                v.push(s("--format=json"));
                return Lookup::Search(self.finish(v));
            }
            (_, ResourceSpec::Nat { router, .. }) => vec![
                s("compute"),
                s("routers"),
                s("nats"),
                s("describe"),
                name,
                flag("router", router),
            ],
            (_, ResourceSpec::NatRule { router, nat, number, .. }) => vec![
                s("compute"),
                s("routers"),
                s("nats"),
                s("rules"),
                s("describe"),
                number.to_string(),
                flag("router", router),
                flag("nat", nat),
            ],
            (kind, _) => {
                let mut v = command_group(*kind);
                v.push(s("describe"));
                v.push(name);
                v
            }
        };
        args.extend(scope_flag(resource));
        args.push(s("--format=json"));
        Lookup::Describe(self.finish(args))
    }

    /// Arguments creating `resource`
    pub fn create_args(&self, resource: &Resource) -> Result<Vec<String>> {
        let name = resource.name.clone();
        let region = resource.region().unwrap_or_default().to_string();
        let mut args: Vec<String> = match &resource.spec {
            ResourceSpec::ProjectApi { api } => vec![s("services"), s("enable"), api.clone()],
            ResourceSpec::ServiceAccount {
                account_id,
                display_name,
                ..
            } => vec![
                s("iam"),
                s("service-accounts"),
                s("create"),
                account_id.clone(),
                flag("display-name", display_name),
            ],
            ResourceSpec::IamBinding { member, role } => {
                return Ok(self.finish(vec![
                    s("projects"),
                    s("add-iam-policy-binding"),
                    self.project.clone(),
                    flag("member", member),
                    flag("role", role),
                    s("--condition=None"),
                ]))
            }
            ResourceSpec::ArtifactRepository => {
                return Ok(self.finish(vec![
                    s("artifacts"),
                    s("repositories"),
                    s("create"),
                    name,
                    s("--repository-format=docker"),
                    flag("location", region),
                ]))
            }
            ResourceSpec::ContainerImage { uri, binary } => {
                let context = self.build_context.display().to_string();
                let config = self.build_context.join("cloudbuild.yaml");
                vec![
                    s("builds"),
                    s("submit"),
                    context,
                    flag("config", config.display()),
                    flag("substitutions", format!("_IMAGE={},_BIN={}", uri, binary)),
                ]
            }
            ResourceSpec::Network => vec![
                s("compute"),
                s("networks"),
                s("create"),
                name,
                s("--subnet-mode=custom"),
            ],
            ResourceSpec::Subnet {
                network,
                range,
                purpose,
            } => {
                let mut v = vec![
                    s("compute"),
                    s("networks"),
                    s("subnets"),
                    s("create"),
                    name,
                    flag("network", network),
                    flag("range", range),
                ];
                match purpose {
                    SubnetPurpose::ProxyOnly => {
                        v.push(s("--purpose=REGIONAL_MANAGED_PROXY"));
                        v.push(s("--role=ACTIVE"));
                    }
                    SubnetPurpose::NatPool => v.push(s("--purpose=PRIVATE_NAT")),
                    SubnetPurpose::General
                    | SubnetPurpose::Overlapping
                    | SubnetPurpose::Routable => {}
                }
                v
            }
            ResourceSpec::FirewallRule {
                network,
                source_ranges,
                allow,
                target_tags,
            } => {
                let mut v = vec![
                    s("compute"),
                    s("firewall-rules"),
                    s("create"),
                    name,
                    flag("network", network),
                    s("--direction=INGRESS"),
                    flag("allow", join(allow)),
                    flag("source-ranges", join(source_ranges)),
                ];
                if !target_tags.is_empty() {
                    v.push(flag("target-tags", join(target_tags)));
                }
                v
            }
            ResourceSpec::Instance {
                machine_type,
                subnet,
                tags,
                startup_script,
            } => {
                if startup_script.contains(',') {
                    return Err(ProvisionError::Unsupported(format!(
                        "startup script for {} containing ','",
                        resource.name
                    )));
                }
                vec![
                    s("compute"),
                    s("instances"),
                    s("create"),
                    name,
                    flag("machine-type", machine_type),
                    flag("subnet", subnet),
                    s("--no-address"),
                    flag("image-family", HUB_IMAGE_FAMILY),
                    flag("image-project", HUB_IMAGE_PROJECT),
                    flag("tags", join(tags)),
                    flag("metadata", format!("startup-script={}", startup_script)),
                ]
            }
            ResourceSpec::Router {
                network,
                asn,
                advertised,
            } => {
                let mut v = vec![
                    s("compute"),
                    s("routers"),
                    s("create"),
                    name,
                    flag("network", network),
                ];
                if let Some(asn) = asn {
                    v.push(flag("asn", asn));
                }
                if !advertised.is_empty() {
                    v.push(s("--advertisement-mode=custom"));
                    v.push(flag("set-advertisement-ranges", join(advertised)));
                }
                v
            }
            ResourceSpec::VpnGateway { network } => vec![
                s("compute"),
                s("vpn-gateways"),
                s("create"),
                name,
                flag("network", network),
            ],
            ResourceSpec::VpnTunnel {
                gateway,
                interface,
                peer_gateway,
                router,
                shared_secret,
            } => vec![
                s("compute"),
                s("vpn-tunnels"),
                s("create"),
                name,
                flag("vpn-gateway", gateway),
                flag("interface", interface),
                flag("peer-gcp-gateway", peer_gateway),
                flag("router", router),
                s("--ike-version=2"),
                flag("shared-secret", shared_secret),
            ],
            ResourceSpec::RouterInterface {
                router,
                tunnel,
                ip,
                mask_length,
            } => vec![
                s("compute"),
                s("routers"),
                s("add-interface"),
                router.clone(),
                flag("interface-name", &name),
                flag("vpn-tunnel", tunnel),
                flag("ip-address", ip),
                flag("mask-length", mask_length),
            ],
            ResourceSpec::BgpPeer {
                router,
                interface,
                peer_ip,
                peer_asn,
            } => vec![
                s("compute"),
                s("routers"),
                s("add-bgp-peer"),
                router.clone(),
                flag("peer-name", &name),
                flag("interface", interface),
                flag("peer-ip-address", peer_ip),
                flag("peer-asn", peer_asn),
            ],
            ResourceSpec::Nat {
                router,
                nat_type,
                source_subnets,
            } => {
                let mut v = vec![
                    s("compute"),
                    s("routers"),
                    s("nats"),
                    s("create"),
                    name,
                    flag("router", router),
                ];
                match nat_type {
                    NatType::Public => {
                        v.push(s("--auto-allocate-nat-external-ips"));
                        v.push(s("--nat-all-subnet-ip-ranges"));
                    }
                    NatType::Private => {
                        v.push(s("--type=PRIVATE"));
                        let ranges: Vec<String> =
                            source_subnets.iter().map(|sn| format!("{}:ALL", sn)).collect();
                        v.push(flag("nat-custom-subnet-ip-ranges", ranges.join(",")));
                    }
                }
                v
            }
            ResourceSpec::NatRule {
                router,
                nat,
                number,
                match_expression,
                source_nat_subnets,
            } => vec![
                s("compute"),
                s("routers"),
                s("nats"),
                s("rules"),
                s("create"),
                number.to_string(),
                flag("router", router),
                flag("nat", nat),
                flag("match", match_expression),
                flag("source-nat-active-ranges", join(source_nat_subnets)),
            ],
            ResourceSpec::ServerlessNeg { service } => vec![
                s("compute"),
                s("network-endpoint-groups"),
                s("create"),
                name,
                s("--network-endpoint-type=serverless"),
                flag("cloud-run-service", service),
            ],
            ResourceSpec::BackendService => vec![
                s("compute"),
                s("backend-services"),
                s("create"),
                name,
                s("--load-balancing-scheme=INTERNAL_MANAGED"),
                s("--protocol=HTTPS"),
            ],
            ResourceSpec::BackendAttachment { backend, neg } => vec![
                s("compute"),
                s("backend-services"),
                s("add-backend"),
                backend.clone(),
                flag("network-endpoint-group", neg),
                flag("network-endpoint-group-region", &region),
            ],
            ResourceSpec::UrlMap { default_service } => vec![
                s("compute"),
                s("url-maps"),
                s("create"),
                name,
                flag("default-service", default_service),
            ],
            ResourceSpec::SslCertificate { .. } => {
                let (cert, key) = self.cert_paths(&resource.name);
                vec![
                    s("compute"),
                    s("ssl-certificates"),
                    s("create"),
                    name,
                    flag("certificate", cert.display()),
                    flag("private-key", key.display()),
                ]
            }
            ResourceSpec::TargetHttpsProxy {
                url_map,
                certificate,
            } => vec![
                s("compute"),
                s("target-https-proxies"),
                s("create"),
                name,
                flag("url-map", url_map),
                flag("url-map-region", &region),
                flag("ssl-certificates", certificate),
                flag("ssl-certificates-region", &region),
            ],
            ResourceSpec::Address { subnet } => vec![
                s("compute"),
                s("addresses"),
                s("create"),
                name,
                flag("subnet", subnet),
            ],
            ResourceSpec::ForwardingRule {
                network,
                subnet,
                address,
                target_proxy,
                port,
            } => vec![
                s("compute"),
                s("forwarding-rules"),
                s("create"),
                name,
                s("--load-balancing-scheme=INTERNAL_MANAGED"),
                flag("network", network),
                flag("subnet", subnet),
                flag("address", address),
                flag("ports", port),
                flag("target-https-proxy", target_proxy),
                flag("target-https-proxy-region", &region),
            ],
            ResourceSpec::RunService {
                image,
                egress,
                ingress,
                max_instances,
                concurrency,
                env,
            } => {
                let mut v = vec![
                    s("run"),
                    s("deploy"),
                    name,
                    flag("image", image),
                    flag("network", &egress.network),
                    flag("subnet", &egress.subnet),
                    s("--vpc-egress=all-traffic"),
                    flag("ingress", ingress.as_flag()),
                    flag("max-instances", max_instances),
                    flag("concurrency", concurrency),
                    s("--allow-unauthenticated"),
                ];
                v.extend(env_flag(env)?);
                v
            }
            ResourceSpec::RunJob {
                image,
                egress,
                max_retries,
                task_timeout_secs,
                env,
            } => {
                let mut v = vec![
                    s("run"),
                    s("jobs"),
                    s("create"),
                    name,
                    flag("image", image),
                    flag("network", &egress.network),
                    flag("subnet", &egress.subnet),
                    s("--vpc-egress=all-traffic"),
                    flag("max-retries", max_retries),
                    flag("task-timeout", format!("{}s", task_timeout_secs)),
                ];
                v.extend(env_flag(env)?);
                v
            }
        };
        args.extend(scope_flag(resource));
        Ok(self.finish(args))
    }

    /// Arguments deleting `resource`
    pub fn delete_args(&self, resource: &Resource) -> Result<Vec<String>> {
        let name = resource.name.clone();
        let region = resource.region().unwrap_or_default().to_string();
        let mut args: Vec<String> = match &resource.spec {
            ResourceSpec::ProjectApi { .. } => {
                return Err(ProvisionError::Unsupported("disabling APIs".into()))
            }
            ResourceSpec::ServiceAccount { email, .. } => {
                vec![s("iam"), s("service-accounts"), s("delete"), email.clone()]
            }
            ResourceSpec::IamBinding { member, role } => {
                return Ok(self.finish(vec![
                    s("projects"),
                    s("remove-iam-policy-binding"),
                    self.project.clone(),
                    flag("member", member),
                    flag("role", role),
                    s("--all"),
                ]))
            }
            ResourceSpec::ArtifactRepository => {
                return Ok(self.finish(vec![
                    s("artifacts"),
                    s("repositories"),
                    s("delete"),
                    name,
                    flag("location", region),
                ]))
            }
            ResourceSpec::ContainerImage { uri, .. } => {
                return Ok(self.finish(vec![
                    s("artifacts"),
                    s("docker"),
                    s("images"),
                    s("delete"),
                    uri.clone(),
                    s("--delete-tags"),
                ]))
            }
            ResourceSpec::RouterInterface { router, .. } => vec![
                s("compute"),
                s("routers"),
                s("remove-interface"),
                router.clone(),
                flag("interface-name", &name),
            ],
            ResourceSpec::BgpPeer { router, .. } => vec![
                s("compute"),
                s("routers"),
                s("remove-bgp-peer"),
                router.clone(),
                flag("peer-name", &name),
            ],
            ResourceSpec::Nat { router, .. } => vec![
                s("compute"),
                s("routers"),
                s("nats"),
                s("delete"),
                name,
                flag("router", router),
            ],
            ResourceSpec::NatRule {
                router,
                nat,
                number,
                ..
            } => vec![
                s("compute"),
                s("routers"),
                s("nats"),
                s("rules"),
                s("delete"),
                number.to_string(),
                flag("router", router),
                flag("nat", nat),
            ],
            ResourceSpec::BackendAttachment { backend, neg } => vec![
                s("compute"),
                s("backend-services"),
                s("remove-backend"),
                backend.clone(),
                flag("network-endpoint-group", neg),
                flag("network-endpoint-group-region", &region),
            ],
            _ => {
                let mut v = command_group(resource.kind);
                v.push(s("delete"));
                v.push(name);
                v
            }
        };
        args.extend(scope_flag(resource));
        Ok(self.finish(args))
    }

    fn finish(&self, mut args: Vec<String>) -> Vec<String> {
        args.push(flag("project", &self.project));
        args.push(s("--quiet"));
        args
    }

    /// Run gcloud; a non-zero exit is returned, not raised
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        let command = summarize(args);
        debug!(command = %command, "Running");

        let mut cmd = Command::new(&self.program);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(command = %command, "Timed out after {:?}", self.timeout);
                ProvisionError::Timeout {
                    command: command.clone(),
                    after: self.timeout,
                }
            })?
            .map_err(|source| ProvisionError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run gcloud and return stdout, mapping not-found and other failures to errors
    async fn run_checked(&self, args: &[String], what: &str) -> Result<String> {
        let output = self.run(args).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if is_not_found(&output.stderr) {
            return Err(ProvisionError::NotFound(what.to_string()));
        }
        Err(ProvisionError::Command {
            command: summarize(args),
            stderr: output.stderr.trim().to_string(),
        })
    }

    async fn write_certificate(&self, resource: &Resource) -> Result<()> {
        if let ResourceSpec::SslCertificate {
            common_name,
            validity_days,
        } = &resource.spec
        {
            let generated = SelfSignedCert::generate(common_name, *validity_days)?;
            let (cert, key) = self.cert_paths(&resource.name);
            write_file(&cert, &generated.cert_pem).await?;
            write_file(&key, &generated.key_pem).await?;
        }
        Ok(())
    }

    async fn describe_value(&self, args: &[String], what: &str) -> Result<String> {
        Ok(self.run_checked(args, what).await?.trim().to_string())
    }
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await?;
    Ok(())
}

/// `gcloud` command group for kinds with plain describe/delete verbs
fn command_group(kind: ResourceKind) -> Vec<String> {
    let path: &[&str] = match kind {
        ResourceKind::Network => &["compute", "networks"],
        ResourceKind::Subnet => &["compute", "networks", "subnets"],
        ResourceKind::FirewallRule => &["compute", "firewall-rules"],
        ResourceKind::Instance => &["compute", "instances"],
        ResourceKind::Router => &["compute", "routers"],
        ResourceKind::VpnGateway => &["compute", "vpn-gateways"],
        ResourceKind::VpnTunnel => &["compute", "vpn-tunnels"],
        ResourceKind::ServerlessNeg => &["compute", "network-endpoint-groups"],
        ResourceKind::BackendService => &["compute", "backend-services"],
        ResourceKind::UrlMap => &["compute", "url-maps"],
        ResourceKind::SslCertificate => &["compute", "ssl-certificates"],
        ResourceKind::TargetHttpsProxy => &["compute", "target-https-proxies"],
        ResourceKind::Address => &["compute", "addresses"],
        ResourceKind::ForwardingRule => &["compute", "forwarding-rules"],
        ResourceKind::RunService => &["run", "services"],
        ResourceKind::RunJob => &["run", "jobs"],
        ResourceKind::ServiceAccount => &["iam", "service-accounts"],
        ResourceKind::Nat => &["compute", "routers", "nats"],
        ResourceKind::NatRule => &["compute", "routers", "nats", "rules"],
        ResourceKind::RouterInterface | ResourceKind::BgpPeer => &["compute", "routers"],
        ResourceKind::BackendAttachment => &["compute", "backend-services"],
        ResourceKind::ArtifactRepository => &["artifacts", "repositories"],
        ResourceKind::ContainerImage => &["artifacts", "docker", "images"],
        ResourceKind::IamBinding => &["projects"],
        ResourceKind::ProjectApi => &["services"],
    };
    path.iter().map(|p| p.to_string()).collect()
}

/// Command line without secrets, for error messages
fn summarize(args: &[String]) -> String {
    let shown: Vec<&str> = args
        .iter()
        .map(|a| {
            if a.starts_with("--shared-secret=") {
                "--shared-secret=***"
            } else {
                a.as_str()
            }
        })
        .collect();
    format!("gcloud {}", shown.join(" "))
}

#[async_trait]
impl ControlPlane for GcloudCli {
    async fn exists(&self, resource: &Resource) -> Result<bool> {
        match self.lookup(resource) {
            Lookup::Describe(args) => match self.run_checked(&args, &resource.to_string()).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
            Lookup::Search(args) => match self.run_checked(&args, &resource.to_string()).await {
                Ok(stdout) => {
                    let json: Value =
                        serde_json::from_str(&stdout).map_err(|e| ProvisionError::Parse {
                            command: summarize(&args),
                            detail: e.to_string(),
                        })?;
                    Ok(present_in(resource, &json))
                }
                // the parent is gone, so the sub-resource is too
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
        }
    }

    async fn create(&self, resource: &Resource) -> Result<()> {
        self.write_certificate(resource).await?;
        let args = self.create_args(resource)?;
        let output = self.run(&args).await?;
        if output.success() {
            return Ok(());
        }
        if is_already_exists(&output.stderr) {
            warn!(resource = %resource.name, "Created concurrently, treating as present");
            return Ok(());
        }
        Err(ProvisionError::Command {
            command: summarize(&args),
            stderr: output.stderr.trim().to_string(),
        })
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        let args = self.delete_args(resource)?;
        self.run_checked(&args, &resource.to_string()).await?;
        Ok(())
    }

    async fn instance_ip(&self, instance: &str, zone: &str) -> Result<Ipv4Addr> {
        let args = self.finish(vec![
            s("compute"),
            s("instances"),
            s("describe"),
            s(instance),
            flag("zone", zone),
            s("--format=value(networkInterfaces[0].networkIP)"),
        ]);
        let value = self.describe_value(&args, &format!("instance {}", instance)).await?;
        value.parse().map_err(|_| ProvisionError::Parse {
            command: summarize(&args),
            detail: format!("not an IPv4 address: {:?}", value),
        })
    }

    async fn address_ip(&self, address: &str, region: &str) -> Result<Ipv4Addr> {
        let args = self.finish(vec![
            s("compute"),
            s("addresses"),
            s("describe"),
            s(address),
            flag("region", region),
            s("--format=value(address)"),
        ]);
        let value = self.describe_value(&args, &format!("address {}", address)).await?;
        value.parse().map_err(|_| ProvisionError::Parse {
            command: summarize(&args),
            detail: format!("not an IPv4 address: {:?}", value),
        })
    }

    async fn execute_job(&self, job: &str, region: &str) -> Result<JobOutcome> {
        let args = self.finish(vec![
            s("run"),
            s("jobs"),
            s("execute"),
            s(job),
            flag("region", region),
            s("--wait"),
        ]);
        let output = self.run(&args).await?;
        if !output.success() && is_not_found(&output.stderr) {
            return Err(ProvisionError::NotFound(format!("job {}", job)));
        }
        Ok(JobOutcome {
            job: job.to_string(),
            succeeded: output.success(),
            output: format!("{}{}", output.stdout, output.stderr),
        })
    }

    async fn run_on_instance(
        &self,
        instance: &str,
        zone: &str,
        command: &str,
    ) -> Result<CommandOutput> {
        let args = self.finish(vec![
            s("compute"),
            s("ssh"),
            s(instance),
            flag("zone", zone),
            s("--tunnel-through-iap"),
            flag("command", command),
        ]);
        self.run(&args).await
    }

    async fn bgp_status(&self, router: &str, region: &str) -> Result<BgpStatus> {
        let args = self.finish(vec![
            s("compute"),
            s("routers"),
            s("get-status"),
            s(router),
            flag("region", region),
            s("--format=json"),
        ]);
        let stdout = self.run_checked(&args, &format!("router {}", router)).await?;
        let json: Value = serde_json::from_str(&stdout)?;
        Ok(parse_bgp_status(router, &json))
    }

    async fn list_services(&self, region: &str) -> Result<Vec<String>> {
        let args = self.finish(vec![
            s("run"),
            s("services"),
            s("list"),
            flag("region", region),
            s("--format=value(metadata.name)"),
        ]);
        let stdout = self.run_checked(&args, &format!("services in {}", region)).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn default_project(&self) -> Result<Option<String>> {
        let output = self
            .run(&[s("config"), s("get-value"), s("project")])
            .await?;
        let project = output.stdout.trim();
        let set = output.success() && !project.is_empty() && project != "(unset)";
        Ok(set.then(|| project.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cli() -> GcloudCli {
        GcloudCli::new(&DeployConfig::new("demo")).unwrap()
    }

    fn regional(kind: ResourceKind, name: &str, spec: ResourceSpec) -> Resource {
        Resource::new(kind, name, Scope::Region("us-central1".into()), spec)
    }

    #[test]
    fn test_proxy_only_subnet_args() {
        let subnet = regional(
            ResourceKind::Subnet,
            "p-spoke1-proxy",
            ResourceSpec::Subnet {
                network: "p-spoke1".into(),
                range: "10.1.8.0/23".parse().unwrap(),
                purpose: SubnetPurpose::ProxyOnly,
            },
        );
        let args = cli().create_args(&subnet).unwrap();
        assert_eq!(
            args,
            [
                "compute",
                "networks",
                "subnets",
                "create",
                "p-spoke1-proxy",
                "--network=p-spoke1",
                "--range=10.1.8.0/23",
                "--purpose=REGIONAL_MANAGED_PROXY",
                "--role=ACTIVE",
                "--region=us-central1",
                "--project=demo",
                "--quiet",
            ]
        );
    }

    #[test]
    fn test_private_nat_args() {
        let nat = regional(
            ResourceKind::Nat,
            "p-spoke1-private-nat",
            ResourceSpec::Nat {
                router: "p-spoke1-nat-router".into(),
                nat_type: NatType::Private,
                source_subnets: vec!["p-spoke1-overlap".into()],
            },
        );
        let args = cli().create_args(&nat).unwrap();
        assert!(args.contains(&"--type=PRIVATE".to_string()));
        assert!(args.contains(&"--nat-custom-subnet-ip-ranges=p-spoke1-overlap:ALL".to_string()));
        assert!(args.contains(&"--router=p-spoke1-nat-router".to_string()));
    }

    #[test]
    fn test_sub_resources_search_parent() {
        let peer = regional(
            ResourceKind::BgpPeer,
            "p-hub-to-spoke1-0-peer",
            ResourceSpec::BgpPeer {
                router: "p-hub-vpn-router".into(),
                interface: "p-hub-to-spoke1-0-if".into(),
                peer_ip: "169.254.0.2".parse().unwrap(),
                peer_asn: 64513,
            },
        );
        match cli().lookup(&peer) {
            Lookup::Search(args) => {
                assert_eq!(&args[..4], ["compute", "routers", "describe", "p-hub-vpn-router"]);
            }
            other => panic!("unexpected lookup {:?}", other),
        }

        let router = json!({
            "name": "p-hub-vpn-router",
            "bgpPeers": [{ "name": "p-hub-to-spoke1-0-peer" }],
            "interfaces": [{ "name": "p-hub-to-spoke1-0-if" }]
        });
        assert!(present_in(&peer, &router));
        assert!(!present_in(&peer, &json!({ "name": "p-hub-vpn-router" })));
    }

    #[test]
    fn test_iam_binding_presence() {
        let binding = Resource::new(
            ResourceKind::IamBinding,
            "roles/run.admin=sa",
            Scope::Project,
            ResourceSpec::IamBinding {
                member: "serviceAccount:sa@demo.iam.gserviceaccount.com".into(),
                role: "roles/run.admin".into(),
            },
        );
        let policy = json!({
            "bindings": [
                {
                    "role": "roles/run.admin",
                    "members": ["serviceAccount:sa@demo.iam.gserviceaccount.com"]
                },
                { "role": "roles/viewer", "members": ["user:a@example.com"] }
            ]
        });
        assert!(present_in(&binding, &policy));
        assert!(!present_in(&binding, &json!({ "bindings": [] })));
    }

    #[test]
    fn test_backend_attachment_presence() {
        let attachment = regional(
            ResourceKind::BackendAttachment,
            "b+n",
            ResourceSpec::BackendAttachment {
                backend: "b".into(),
                neg: "n".into(),
            },
        );
        let backend = json!({
            "backends": [{
                "group": "https://www.googleapis.com/compute/v1/projects/demo\
                          /regions/us-central1/networkEndpointGroups/n"
            }]
        });
        assert!(present_in(&attachment, &backend));
        assert!(!present_in(&attachment, &json!({})));
    }

    #[test]
    fn test_env_flag() {
        let plain = [EnvVar::literal("TARGET_URL", "http://10.0.0.2:80/")];
        assert_eq!(
            env_flag(&plain).unwrap().unwrap(),
            "--set-env-vars=TARGET_URL=http://10.0.0.2:80/"
        );

        let comma = [EnvVar::literal("A", "x,y"), EnvVar::literal("B", "z")];
        assert_eq!(env_flag(&comma).unwrap().unwrap(), "--set-env-vars=^@^A=x,y@B=z");

        let deferred = [EnvVar {
            name: "TARGET_URL".into(),
            value: EnvValue::InstanceUrl {
                instance: "hub".into(),
                zone: "z".into(),
                port: 80,
            },
        }];
        assert!(matches!(env_flag(&deferred), Err(ProvisionError::Unresolved(_))));
        assert!(env_flag(&[]).unwrap().is_none());
    }

    #[test]
    fn test_apis_are_never_disabled() {
        let api = Resource::new(
            ResourceKind::ProjectApi,
            "run.googleapis.com",
            Scope::Project,
            ResourceSpec::ProjectApi {
                api: "run.googleapis.com".into(),
            },
        );
        assert!(matches!(cli().delete_args(&api), Err(ProvisionError::Unsupported(_))));
    }

    #[test]
    fn test_parse_bgp_status() {
        let status = json!({
            "result": { "bgpPeerStatus": [{ "status": "UP" }, { "status": "DOWN" }] }
        });
        let parsed = parse_bgp_status("r", &status);
        assert_eq!((parsed.established, parsed.total), (1, 2));
        assert!(!parsed.converged());
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found(
            "ERROR: (gcloud.compute.networks.describe) Could not fetch resource:\n \
             - The resource 'projects/demo/global/networks/x' was not found"
        ));
        assert!(is_not_found("ERROR: NOT_FOUND: Resource 'x' does not exist"));
        assert!(is_not_found(
            "ERROR: (gcloud.run.services.delete) Cannot find service [crossnet-spoke1-echo]"
        ));
        assert!(is_not_found("ERROR: (gcloud.artifacts.docker.images.delete) HTTPError 404"));
        assert!(!is_not_found("ERROR: PERMISSION_DENIED"));
        assert!(is_already_exists("ERROR: ALREADY_EXISTS: The resource already exists"));
    }

    #[test]
    fn test_denied_is_never_absent() {
        assert!(!is_not_found(
            "ERROR: (gcloud.run.jobs.delete) PERMISSION_DENIED: Permission \
             'run.jobs.delete' denied on resource 'x' (or it may not exist)."
        ));
        assert!(!is_not_found(
            "ERROR: (gcloud.iam.service-accounts.delete) HTTPError 403: \
             Permission denied, or the service account does not exist"
        ));
        assert!(!is_not_found("ERROR: Subnetwork 'p-spoke1-nat' does not exist in region"));
        assert!(!is_not_found(
            "ERROR: (gcloud.compute.routers.describe) Some requests did not succeed"
        ));
    }

    #[test]
    fn test_summary_hides_secret() {
        let args = vec![s("compute"), s("--shared-secret=hunter2")];
        let summary = summarize(&args);
        assert!(!summary.contains("hunter2"));
    }

    #[cfg(unix)]
    fn fake_gcloud(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("gcloud");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_not_found_means_absent() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_gcloud(
            dir.path(),
            "echo \"ERROR: (gcloud) NOT_FOUND: network\" >&2\nexit 1",
        );
        let cli = cli().with_program(program);
        let network =
            Resource::new(ResourceKind::Network, "n", Scope::Global, ResourceSpec::Network);

        assert!(!cli.exists(&network).await.unwrap());
        assert!(cli.delete(&network).await.unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_failures_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_gcloud(dir.path(), "echo \"ERROR: PERMISSION_DENIED\" >&2\nexit 1");
        let cli = cli().with_program(program);
        let network =
            Resource::new(ResourceKind::Network, "n", Scope::Global, ResourceSpec::Network);

        let err = cli.exists(&network).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Command { .. }));
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_cli_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_gcloud(dir.path(), "sleep 5");
        let cli = cli()
            .with_program(program)
            .with_timeout(Duration::from_millis(200));
        let network =
            Resource::new(ResourceKind::Network, "n", Scope::Global, ResourceSpec::Network);

        let err = cli.exists(&network).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }
}
