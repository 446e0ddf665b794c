//! Resource plan derived from the deploy config and topology
//!
//! Insertion order is a valid creation order; serverless workloads are added
//! last within their phase so the fan-out steps form one contiguous run.

use crossnet_core::topology::{FirewallPlan, SubnetPlan, FRONT_END_PORT, HUB_HTTP_PORT};
use crossnet_core::{
    DeployConfig, EnvValue, EnvVar, Ingress, NatType, Resource, ResourceKind, ResourceSpec, Scope,
    SpokePlan, Topology, VpcEgress,
};

use crate::cert::DEFAULT_VALIDITY_DAYS;
use crate::error::Result;
use crate::graph::{Phase, StepGraph};

/// Provider APIs enabled during bootstrap
pub const REQUIRED_APIS: &[&str] = &[
    "compute.googleapis.com",
    "run.googleapis.com",
    "artifactregistry.googleapis.com",
    "cloudbuild.googleapis.com",
    "iam.googleapis.com",
    "iap.googleapis.com",
];

/// Roles granted to the deployer identity
pub const DEPLOYER_ROLES: &[&str] = &[
    "roles/compute.admin",
    "roles/run.admin",
    "roles/artifactregistry.admin",
    "roles/cloudbuild.builds.editor",
    "roles/iam.serviceAccountUser",
    "roles/iap.tunnelResourceAccessor",
];

pub const ECHO_BINARY: &str = "crossnet-echo";
pub const PROBE_BINARY: &str = "crossnet-probe";
pub const RELAY_BINARY: &str = "crossnet-relay";

/// Private NAT rule matching traffic leaving through a tunnel
pub const HYBRID_MATCH: &str = "nexthop.is_hybrid";

pub const SERVICE_MAX_INSTANCES: u32 = 5;
pub const SERVICE_CONCURRENCY: u32 = 80;
pub const JOB_TASK_TIMEOUT_SECS: u32 = 300;

/// Serves a fixed page on the hub's HTTP port; must stay free of commas
pub const HUB_STARTUP_SCRIPT: &str = "#! /bin/bash\n\
mkdir -p /srv/www && hostname > /srv/www/index.html\n\
cd /srv/www && nohup python3 -m http.server 80 >/var/log/hub-http.log 2>&1 &\n";

pub struct Plan {
    pub graph: StepGraph,
}

struct Builder<'a> {
    config: &'a DeployConfig,
    region: Scope,
    zone: Scope,
    graph: StepGraph,
}

impl<'a> Builder<'a> {
    fn add(
        &mut self,
        phase: Phase,
        kind: ResourceKind,
        name: &str,
        scope: &Scope,
        spec: ResourceSpec,
        deps: &[&str],
    ) -> Result<String> {
        self.graph
            .add(Resource::new(kind, name, scope.clone(), spec), phase, deps)
    }

    fn regional(
        &mut self,
        phase: Phase,
        kind: ResourceKind,
        name: &str,
        spec: ResourceSpec,
        deps: &[&str],
    ) -> Result<String> {
        let scope = self.region.clone();
        self.add(phase, kind, name, &scope, spec, deps)
    }

    fn network(&mut self, name: &str) -> Result<String> {
        self.add(
            Phase::Base,
            ResourceKind::Network,
            name,
            &Scope::Global,
            ResourceSpec::Network,
            &[],
        )
    }

    fn subnet(&mut self, plan: &SubnetPlan, network: &str) -> Result<String> {
        self.regional(
            Phase::Base,
            ResourceKind::Subnet,
            &plan.name,
            ResourceSpec::Subnet {
                network: plan.network.clone(),
                range: plan.range,
                purpose: plan.purpose,
            },
            &[network],
        )
    }

    fn firewall(&mut self, plan: &FirewallPlan, network: &str) -> Result<String> {
        self.add(
            Phase::Base,
            ResourceKind::FirewallRule,
            &plan.name,
            &Scope::Global,
            ResourceSpec::FirewallRule {
                network: plan.network.clone(),
                source_ranges: plan.source_ranges.clone(),
                allow: plan.allow.clone(),
                target_tags: plan.target_tags.clone(),
            },
            &[network],
        )
    }
}

struct SpokeKeys {
    network: String,
    overlapping: String,
    routable: String,
    proxy_only: String,
    nat_pool: String,
}

impl Plan {
    pub fn build(config: &DeployConfig, topology: &Topology) -> Result<Self> {
        let mut b = Builder {
            config,
            region: Scope::Region(config.region.clone()),
            zone: Scope::Zone(config.zone()),
            graph: StepGraph::new(),
        };

        let identity = identity(&mut b)?;
        let images = registry(&mut b, &identity)?;

        // hub
        let hub = &topology.hub;
        let hub_net = b.network(&hub.network)?;
        let hub_subnet = b.subnet(&hub.general, &hub_net)?;
        for fw in &hub.firewalls {
            b.firewall(fw, &hub_net)?;
        }
        let zone = b.zone.clone();
        let hub_vm = b.add(
            Phase::Base,
            ResourceKind::Instance,
            &hub.instance,
            &zone,
            ResourceSpec::Instance {
                machine_type: config.machine_type.clone(),
                subnet: hub.general.name.clone(),
                tags: vec![hub.instance_tag.clone()],
                startup_script: HUB_STARTUP_SCRIPT.to_string(),
            },
            &[&hub_subnet],
        )?;
        let hub_nat_router = b.regional(
            Phase::Base,
            ResourceKind::Router,
            &hub.nat_router,
            ResourceSpec::Router {
                network: hub.network.clone(),
                asn: None,
                advertised: Vec::new(),
            },
            &[&hub_net],
        )?;
        b.regional(
            Phase::Base,
            ResourceKind::Nat,
            &hub.public_nat,
            ResourceSpec::Nat {
                router: hub.nat_router.clone(),
                nat_type: NatType::Public,
                source_subnets: Vec::new(),
            },
            &[&hub_nat_router, &hub_subnet],
        )?;

        let mut spoke_keys = Vec::new();
        for spoke in &topology.spokes {
            spoke_keys.push(spoke_base(&mut b, spoke)?);
        }

        // serverless workloads, one contiguous fan-out run
        let hub_url = EnvValue::InstanceUrl {
            instance: hub.instance.clone(),
            zone: config.zone(),
            port: HUB_HTTP_PORT,
        };
        for (spoke, keys) in topology.spokes.iter().zip(&spoke_keys) {
            let egress = VpcEgress {
                network: spoke.network.clone(),
                subnet: spoke.overlapping.name.clone(),
            };
            add_serverless(
                &mut b,
                ResourceKind::RunService,
                &spoke.echo_service,
                ResourceSpec::RunService {
                    image: images.echo_uri.clone(),
                    egress: egress.clone(),
                    ingress: Ingress::InternalAndCloudLoadBalancing,
                    max_instances: SERVICE_MAX_INSTANCES,
                    concurrency: SERVICE_CONCURRENCY,
                    env: Vec::new(),
                },
                &[&images.echo, &keys.overlapping],
            )?;
            add_serverless(
                &mut b,
                ResourceKind::RunJob,
                &spoke.probe_job,
                ResourceSpec::RunJob {
                    image: images.probe_uri.clone(),
                    egress: egress.clone(),
                    max_retries: 0,
                    task_timeout_secs: JOB_TASK_TIMEOUT_SECS,
                    env: vec![EnvVar {
                        name: "TARGET_URL".into(),
                        value: hub_url.clone(),
                    }],
                },
                &[&images.probe, &keys.overlapping, &hub_vm],
            )?;
            if let Some((relay_key, relay_uri)) = &images.relay {
                for relay in &spoke.relay_services {
                    add_serverless(
                        &mut b,
                        ResourceKind::RunService,
                        relay,
                        ResourceSpec::RunService {
                            image: relay_uri.clone(),
                            egress: egress.clone(),
                            ingress: Ingress::Internal,
                            max_instances: SERVICE_MAX_INSTANCES,
                            concurrency: SERVICE_CONCURRENCY,
                            env: vec![EnvVar {
                                name: "TARGET_URL".into(),
                                value: hub_url.clone(),
                            }],
                        },
                        &[relay_key, &keys.overlapping, &hub_vm],
                    )?;
                }
            }
        }

        connectivity(&mut b, topology, &hub_net, &spoke_keys)?;

        Ok(Self { graph: b.graph })
    }
}

fn identity(b: &mut Builder<'_>) -> Result<Vec<String>> {
    let config = b.config;
    let mut keys = Vec::new();
    for api in REQUIRED_APIS {
        keys.push(b.add(
            Phase::Identity,
            ResourceKind::ProjectApi,
            api,
            &Scope::Project,
            ResourceSpec::ProjectApi {
                api: api.to_string(),
            },
            &[],
        )?);
    }
    let api_deps: Vec<&str> = keys.iter().map(String::as_str).collect();

    let email = config.service_account_email();
    let account = b.add(
        Phase::Identity,
        ResourceKind::ServiceAccount,
        &config.service_account,
        &Scope::Project,
        ResourceSpec::ServiceAccount {
            account_id: config.service_account.clone(),
            email: email.clone(),
            display_name: format!("{} deployer", config.prefix),
        },
        &api_deps,
    )?;

    let mut out = vec![account.clone()];
    for role in DEPLOYER_ROLES {
        out.push(b.add(
            Phase::Identity,
            ResourceKind::IamBinding,
            &format!("{}={}", role, email),
            &Scope::Project,
            ResourceSpec::IamBinding {
                member: format!("serviceAccount:{}", email),
                role: role.to_string(),
            },
            &[&account],
        )?);
    }
    out.extend(keys);
    Ok(out)
}

struct Images {
    echo: String,
    echo_uri: String,
    probe: String,
    probe_uri: String,
    relay: Option<(String, String)>,
}

fn registry(b: &mut Builder<'_>, identity: &[String]) -> Result<Images> {
    let config = b.config;
    let repo_name = config.name("images");
    let repo = b.regional(
        Phase::Base,
        ResourceKind::ArtifactRepository,
        &repo_name,
        ResourceSpec::ArtifactRepository,
        &[&identity[0]],
    )?;
    let registry = config.registry_path(&repo_name);

    let (echo, echo_uri) = image(b, &registry, &repo, "echo", ECHO_BINARY)?;
    let (probe, probe_uri) = image(b, &registry, &repo, "probe", PROBE_BINARY)?;
    let relay = if config.relay_scale > 0 {
        Some(image(b, &registry, &repo, "relay", RELAY_BINARY)?)
    } else {
        None
    };

    Ok(Images {
        echo,
        echo_uri,
        probe,
        probe_uri,
        relay,
    })
}

/// Image `<registry>/<short>:latest` built from `binary`; returns (key, uri)
fn image(
    b: &mut Builder<'_>,
    registry: &str,
    repo: &str,
    short: &str,
    binary: &str,
) -> Result<(String, String)> {
    let uri = format!("{}/{}:latest", registry, short);
    let name = format!("{}-{}", b.config.name("images"), short);
    let key = b.regional(
        Phase::Base,
        ResourceKind::ContainerImage,
        &name,
        ResourceSpec::ContainerImage {
            uri: uri.clone(),
            binary: binary.to_string(),
        },
        &[repo],
    )?;
    Ok((key, uri))
}

fn spoke_base(b: &mut Builder<'_>, spoke: &SpokePlan) -> Result<SpokeKeys> {
    let network = b.network(&spoke.network)?;
    let overlapping = b.subnet(&spoke.overlapping, &network)?;
    let routable = b.subnet(&spoke.routable, &network)?;
    let proxy_only = b.subnet(&spoke.proxy_only, &network)?;
    let nat_pool = b.subnet(&spoke.nat_pool, &network)?;
    for fw in &spoke.firewalls {
        b.firewall(fw, &network)?;
    }
    Ok(SpokeKeys {
        network,
        overlapping,
        routable,
        proxy_only,
        nat_pool,
    })
}

fn add_serverless(
    b: &mut Builder<'_>,
    kind: ResourceKind,
    name: &str,
    spec: ResourceSpec,
    deps: &[&str],
) -> Result<String> {
    let resource = Resource::new(kind, name, b.region.clone(), spec);
    b.graph.add_fan_out(resource, Phase::Base, deps)
}

fn connectivity(
    b: &mut Builder<'_>,
    topology: &Topology,
    hub_net: &str,
    spokes: &[SpokeKeys],
) -> Result<()> {
    const C: Phase = Phase::Connectivity;
    let hub = &topology.hub;

    let hub_gw = b.regional(
        C,
        ResourceKind::VpnGateway,
        &hub.vpn_gateway,
        ResourceSpec::VpnGateway {
            network: hub.network.clone(),
        },
        &[hub_net],
    )?;
    let hub_router = b.regional(
        C,
        ResourceKind::Router,
        &hub.vpn_router,
        ResourceSpec::Router {
            network: hub.network.clone(),
            asn: Some(hub.asn),
            advertised: hub.advertised.clone(),
        },
        &[hub_net],
    )?;

    for (spoke, keys) in topology.spokes.iter().zip(spokes) {
        let gw = b.regional(
            C,
            ResourceKind::VpnGateway,
            &spoke.vpn_gateway,
            ResourceSpec::VpnGateway {
                network: spoke.network.clone(),
            },
            &[&keys.network],
        )?;
        let router = b.regional(
            C,
            ResourceKind::Router,
            &spoke.vpn_router,
            ResourceSpec::Router {
                network: spoke.network.clone(),
                asn: Some(spoke.asn),
                advertised: spoke.advertised.clone(),
            },
            &[&keys.network],
        )?;

        let link = topology.links.iter().find(|l| l.spoke == spoke.index);
        for tunnel in link.map(|l| l.tunnels.as_slice()).unwrap_or_default() {
            let (own_router, own_gw, peer_gw) = match tunnel.side {
                crossnet_core::Side::Hub => (&hub_router, &hub_gw, &gw),
                crossnet_core::Side::Spoke => (&router, &gw, &hub_gw),
            };
            let t = b.regional(
                C,
                ResourceKind::VpnTunnel,
                &tunnel.name,
                ResourceSpec::VpnTunnel {
                    gateway: tunnel.gateway.clone(),
                    interface: tunnel.interface,
                    peer_gateway: tunnel.peer_gateway.clone(),
                    router: tunnel.router.clone(),
                    shared_secret: tunnel.shared_secret.clone(),
                },
                &[own_gw, peer_gw, own_router],
            )?;
            let iface = b.regional(
                C,
                ResourceKind::RouterInterface,
                &tunnel.interface_name,
                ResourceSpec::RouterInterface {
                    router: tunnel.router.clone(),
                    tunnel: tunnel.name.clone(),
                    ip: tunnel.local_ip,
                    mask_length: tunnel.link_range.prefix_len(),
                },
                &[&t, own_router],
            )?;
            b.regional(
                C,
                ResourceKind::BgpPeer,
                &tunnel.peer_name,
                ResourceSpec::BgpPeer {
                    router: tunnel.router.clone(),
                    interface: tunnel.interface_name.clone(),
                    peer_ip: tunnel.peer_ip,
                    peer_asn: tunnel.peer_asn,
                },
                &[&iface],
            )?;
        }

        // translation on a router of its own
        let nat_router = b.regional(
            C,
            ResourceKind::Router,
            &spoke.nat_router,
            ResourceSpec::Router {
                network: spoke.network.clone(),
                asn: None,
                advertised: Vec::new(),
            },
            &[&keys.network],
        )?;
        let nat = b.regional(
            C,
            ResourceKind::Nat,
            &spoke.private_nat,
            ResourceSpec::Nat {
                router: spoke.nat_router.clone(),
                nat_type: NatType::Private,
                source_subnets: vec![spoke.overlapping.name.clone()],
            },
            &[&nat_router, &keys.overlapping, &keys.nat_pool],
        )?;
        b.regional(
            C,
            ResourceKind::NatRule,
            &format!("{}-rule-1", spoke.private_nat),
            ResourceSpec::NatRule {
                router: spoke.nat_router.clone(),
                nat: spoke.private_nat.clone(),
                number: 1,
                match_expression: HYBRID_MATCH.to_string(),
                source_nat_subnets: vec![spoke.nat_pool.name.clone()],
            },
            &[&nat],
        )?;

        load_balancer(b, spoke, keys)?;
    }

    Ok(())
}

fn load_balancer(b: &mut Builder<'_>, spoke: &SpokePlan, keys: &SpokeKeys) -> Result<()> {
    const C: Phase = Phase::Connectivity;
    let lb = &spoke.load_balancer;
    // a serverless NEG names its service without holding it
    let neg = b.regional(
        C,
        ResourceKind::ServerlessNeg,
        &lb.neg,
        ResourceSpec::ServerlessNeg {
            service: spoke.echo_service.clone(),
        },
        &[&keys.network],
    )?;
    let backend = b.regional(
        C,
        ResourceKind::BackendService,
        &lb.backend,
        ResourceSpec::BackendService,
        &[],
    )?;
    b.regional(
        C,
        ResourceKind::BackendAttachment,
        &format!("{}+{}", lb.backend, lb.neg),
        ResourceSpec::BackendAttachment {
            backend: lb.backend.clone(),
            neg: lb.neg.clone(),
        },
        &[&backend, &neg],
    )?;
    let url_map = b.regional(
        C,
        ResourceKind::UrlMap,
        &lb.url_map,
        ResourceSpec::UrlMap {
            default_service: lb.backend.clone(),
        },
        &[&backend],
    )?;
    let cert = b.regional(
        C,
        ResourceKind::SslCertificate,
        &lb.certificate,
        ResourceSpec::SslCertificate {
            common_name: lb.common_name.clone(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        },
        &[],
    )?;
    let proxy = b.regional(
        C,
        ResourceKind::TargetHttpsProxy,
        &lb.https_proxy,
        ResourceSpec::TargetHttpsProxy {
            url_map: lb.url_map.clone(),
            certificate: lb.certificate.clone(),
        },
        &[&url_map, &cert],
    )?;
    let address = b.regional(
        C,
        ResourceKind::Address,
        &lb.address,
        ResourceSpec::Address {
            subnet: spoke.routable.name.clone(),
        },
        &[&keys.routable],
    )?;
    b.regional(
        C,
        ResourceKind::ForwardingRule,
        &lb.forwarding_rule,
        ResourceSpec::ForwardingRule {
            network: spoke.network.clone(),
            subnet: spoke.routable.name.clone(),
            address: lb.address.clone(),
            target_proxy: lb.https_proxy.clone(),
            port: FRONT_END_PORT,
        },
        &[&address, &proxy, &keys.proxy_only, &keys.network],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossnet_core::ResourceCategory;

    fn plan(spokes: usize, relay: usize) -> Plan {
        let config = DeployConfig::new("demo").with_spokes(spokes).with_relay_scale(relay);
        let topology = Topology::build(&config).unwrap();
        Plan::build(&config, &topology).unwrap()
    }

    #[test]
    fn test_every_category_is_planned() {
        let plan = plan(2, 0);
        for category in ResourceCategory::ALL {
            assert!(
                plan.graph
                    .steps()
                    .iter()
                    .any(|s| s.resource.kind.category() == Some(category)),
                "no step in {:?}",
                category
            );
        }
    }

    #[test]
    fn test_provision_order_matches_insertion() {
        let plan = plan(2, 1);
        let order = plan.graph.provision_order().unwrap();
        let inserted: Vec<String> = plan.graph.steps().iter().map(|s| s.resource.key()).collect();
        let ordered: Vec<String> = order.iter().map(|s| s.resource.key()).collect();
        assert_eq!(inserted, ordered);
    }

    #[test]
    fn test_fan_out_steps_are_contiguous() {
        let plan = plan(3, 2);
        let base = plan.graph.phase_order(Phase::Base).unwrap();
        let flags: Vec<bool> = base.iter().map(|s| s.fan_out).collect();
        let first = flags.iter().position(|&f| f).unwrap();
        let last = flags.iter().rposition(|&f| f).unwrap();
        assert!(flags[first..=last].iter().all(|&f| f));
        // echo + probe + 2 relays per spoke
        assert_eq!(last - first + 1, 3 * 4);
    }

    #[test]
    fn test_relay_image_only_with_scale() {
        let without = plan(1, 0);
        let with = plan(1, 1);
        let relay_image = |p: &Plan| {
            p.graph.steps().iter().any(|s| {
                matches!(
                    &s.resource.spec,
                    ResourceSpec::ContainerImage { binary, .. } if binary == RELAY_BINARY
                )
            })
        };
        assert!(!relay_image(&without));
        assert!(relay_image(&with));
    }

    #[test]
    fn test_link_has_four_sessions() {
        let plan = plan(2, 0);
        let peers = plan
            .graph
            .steps()
            .iter()
            .filter(|s| s.resource.kind == ResourceKind::BgpPeer)
            .count();
        assert_eq!(peers, 2 * 4);
    }

    #[test]
    fn test_teardown_starts_with_serverless() {
        let plan = plan(2, 1);
        let order = plan.graph.teardown_order().unwrap();
        let serverless = order
            .iter()
            .take_while(|s| s.resource.kind.category() == Some(ResourceCategory::Serverless))
            .count();
        assert_eq!(serverless, 2 * 3);
        assert_eq!(order.last().unwrap().resource.kind, ResourceKind::ProjectApi);
    }

    #[test]
    fn test_teardown_unwinds_network_stack_in_order() {
        use ResourceKind as K;

        let plan = plan(3, 1);
        let order = plan.graph.teardown_order().unwrap();
        let chain: [(&str, &[ResourceKind]); 6] = [
            (
                "load balancing",
                &[
                    K::ForwardingRule,
                    K::Address,
                    K::TargetHttpsProxy,
                    K::SslCertificate,
                    K::UrlMap,
                    K::BackendAttachment,
                    K::BackendService,
                    K::ServerlessNeg,
                ],
            ),
            ("nat", &[K::NatRule, K::Nat]),
            ("tunnels", &[K::BgpPeer, K::RouterInterface, K::VpnTunnel, K::VpnGateway]),
            ("routers", &[K::Router]),
            ("subnets", &[K::Subnet]),
            ("networks", &[K::Network]),
        ];
        let positions = |kinds: &[ResourceKind]| -> (usize, usize) {
            let hits: Vec<usize> = order
                .iter()
                .enumerate()
                .filter(|(_, s)| kinds.contains(&s.resource.kind))
                .map(|(i, _)| i)
                .collect();
            assert!(!hits.is_empty(), "{:?} missing from teardown", kinds);
            (hits[0], hits[hits.len() - 1])
        };

        for pair in chain.windows(2) {
            let (before, before_kinds) = pair[0];
            let (after, after_kinds) = pair[1];
            let (_, last_before) = positions(before_kinds);
            let (first_after, _) = positions(after_kinds);
            assert!(
                last_before < first_after,
                "{} (last at {}) must be gone before {} (first at {})",
                before,
                last_before,
                after,
                first_after
            );
        }
    }

    #[test]
    fn test_startup_script_is_comma_free() {
        assert!(!HUB_STARTUP_SCRIPT.contains(','));
    }
}
