//! Hub and spoke address plan
//!
//! Every spoke reuses the same overlapping range for serverless egress. Those
//! ranges are only valid because they never leave their own network: routers
//! advertise an explicit allow-list of network-unique ranges, and traffic that
//! leaves through a tunnel is translated into the spoke's NAT pool first.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::Error;

/// Private ASN of the hub side of every link
pub const HUB_ASN: u32 = 64512;

/// Range reused by every spoke for serverless direct egress
pub fn overlapping_range() -> Ipv4Net {
    net(240, 0, 0, 0, 8)
}

pub fn hub_general_range() -> Ipv4Net {
    net(10, 0, 0, 0, 24)
}

/// Source range of identity-aware proxy TCP forwarding
pub fn iap_range() -> Ipv4Net {
    net(35, 235, 240, 0, 20)
}

/// Front-end port of every spoke load balancer
pub const FRONT_END_PORT: u16 = 443;

/// Port the hub instance serves HTTP on
pub const HUB_HTTP_PORT: u16 = 80;

/// Tunnels per side of a link (one per HA gateway interface)
pub const TUNNELS_PER_SIDE: u8 = 2;

fn net(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(a, b, c, d), prefix).expect("prefix length is at most 32")
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetPurpose {
    /// Ordinary compute subnet
    General,
    /// Serverless egress range, identical in every spoke
    Overlapping,
    /// Load balancer front ends, advertised over BGP
    Routable,
    /// Envoy proxy capacity for regional managed load balancers
    ProxyOnly,
    /// Source pool for private NAT, advertised over BGP
    NatPool,
}

impl SubnetPurpose {
    /// Whether this range must be unique across all networks
    pub fn network_unique(&self) -> bool {
        matches!(self, Self::General | Self::Routable | Self::NatPool)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPlan {
    pub name: String,
    pub network: String,
    pub range: Ipv4Net,
    pub purpose: SubnetPurpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPlan {
    pub name: String,
    pub network: String,
    pub source_ranges: Vec<Ipv4Net>,
    /// `tcp:22` style allow entries
    pub allow: Vec<String>,
    pub target_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubPlan {
    pub network: String,
    pub general: SubnetPlan,
    pub instance: String,
    pub instance_tag: String,
    pub vpn_gateway: String,
    pub vpn_router: String,
    pub asn: u32,
    pub advertised: Vec<Ipv4Net>,
    pub nat_router: String,
    pub public_nat: String,
    pub firewalls: Vec<FirewallPlan>,
}

/// Names of the load-balancing chain in front of a spoke's echo service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerPlan {
    pub neg: String,
    pub backend: String,
    pub url_map: String,
    pub certificate: String,
    pub https_proxy: String,
    pub address: String,
    pub forwarding_rule: String,
    pub common_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokePlan {
    /// 1-based spoke number
    pub index: usize,
    pub network: String,
    pub overlapping: SubnetPlan,
    pub routable: SubnetPlan,
    pub proxy_only: SubnetPlan,
    pub nat_pool: SubnetPlan,
    pub vpn_gateway: String,
    pub vpn_router: String,
    pub asn: u32,
    pub advertised: Vec<Ipv4Net>,
    /// Dedicated to private NAT, never shared with BGP
    pub nat_router: String,
    pub private_nat: String,
    pub echo_service: String,
    pub probe_job: String,
    pub relay_services: Vec<String>,
    pub load_balancer: LoadBalancerPlan,
    pub firewalls: Vec<FirewallPlan>,
}

impl SpokePlan {
    pub fn subnets(&self) -> [&SubnetPlan; 4] {
        [
            &self.overlapping,
            &self.routable,
            &self.proxy_only,
            &self.nat_pool,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Hub,
    Spoke,
}

/// One tunnel and the BGP session it carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPlan {
    pub name: String,
    pub side: Side,
    /// HA gateway interface (0 or 1)
    pub interface: u8,
    pub gateway: String,
    pub peer_gateway: String,
    pub router: String,
    pub interface_name: String,
    pub peer_name: String,
    /// Link-local /30 shared by both ends of the session
    pub link_range: Ipv4Net,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub local_asn: u32,
    pub peer_asn: u32,
    pub shared_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPlan {
    pub spoke: usize,
    pub tunnels: Vec<TunnelPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub hub: HubPlan,
    pub spokes: Vec<SpokePlan>,
    pub links: Vec<LinkPlan>,
}

impl Topology {
    /// Derive the address plan for `config.spokes` spokes
    pub fn build(config: &DeployConfig) -> crate::Result<Self> {
        if config.spokes == 0 || config.spokes > crate::config::MAX_SPOKES {
            return Err(Error::InvalidTopology(format!(
                "unsupported spoke count {}",
                config.spokes
            )));
        }

        let hub_network = config.name("hub");
        let instance_tag = config.name("hub-web");

        let spokes: Vec<SpokePlan> = (1..=config.spokes)
            .map(|i| build_spoke(config, i))
            .collect();

        let mut hub_http_sources: Vec<Ipv4Net> =
            spokes.iter().map(|s| s.nat_pool.range).collect();
        hub_http_sources.sort();

        let hub = HubPlan {
            general: SubnetPlan {
                name: config.name("hub-general"),
                network: hub_network.clone(),
                range: hub_general_range(),
                purpose: SubnetPurpose::General,
            },
            instance: config.name("hub-vm"),
            vpn_gateway: config.name("hub-vpn-gw"),
            vpn_router: config.name("hub-vpn-router"),
            asn: HUB_ASN,
            advertised: vec![hub_general_range()],
            nat_router: config.name("hub-nat-router"),
            public_nat: config.name("hub-public-nat"),
            firewalls: vec![
                FirewallPlan {
                    name: config.name("hub-allow-iap-ssh"),
                    network: hub_network.clone(),
                    source_ranges: vec![iap_range()],
                    allow: vec!["tcp:22".into()],
                    target_tags: vec![instance_tag.clone()],
                },
                FirewallPlan {
                    name: config.name("hub-allow-spokes"),
                    network: hub_network.clone(),
                    source_ranges: hub_http_sources,
                    allow: vec![format!("tcp:{}", HUB_HTTP_PORT), "icmp".into()],
                    target_tags: vec![instance_tag.clone()],
                },
            ],
            instance_tag,
            network: hub_network,
        };

        let links = spokes
            .iter()
            .map(|spoke| build_link(config, &hub, spoke))
            .collect();

        let topology = Self { hub, spokes, links };
        topology.validate()?;
        Ok(topology)
    }

    pub fn spoke(&self, index: usize) -> Option<&SpokePlan> {
        self.spokes.iter().find(|s| s.index == index)
    }

    /// Ranges reused by more than one network
    pub fn colliding_ranges(&self) -> Vec<Ipv4Net> {
        let mut ranges: Vec<Ipv4Net> = self.spokes.iter().map(|s| s.overlapping.range).collect();
        ranges.sort();
        ranges.dedup();
        ranges
    }

    /// All subnets, hub first
    pub fn subnets(&self) -> Vec<&SubnetPlan> {
        let mut out = vec![&self.hub.general];
        for spoke in &self.spokes {
            out.extend(spoke.subnets());
        }
        out
    }

    /// Ranges each router advertises, by router name
    pub fn advertisements(&self) -> Vec<(&str, &[Ipv4Net])> {
        let mut out = vec![(self.hub.vpn_router.as_str(), self.hub.advertised.as_slice())];
        for spoke in &self.spokes {
            out.push((spoke.vpn_router.as_str(), spoke.advertised.as_slice()));
        }
        out
    }

    /// Check the collision-containment invariants.
    pub fn validate(&self) -> crate::Result<()> {
        let colliding = self.colliding_ranges();

        if colliding.len() > 1 {
            return Err(Error::InvalidTopology(format!(
                "overlapping subnets must share one range, found {:?}",
                colliding
            )));
        }

        for (router, ranges) in self.advertisements() {
            for range in ranges {
                if let Some(bad) = colliding.iter().find(|c| overlaps(c, range)) {
                    return Err(Error::Collision {
                        range: bad.to_string(),
                        context: format!("advertisement of {}", router),
                    });
                }
            }
        }

        for firewall in &self.hub.firewalls {
            for range in &firewall.source_ranges {
                if let Some(bad) = colliding.iter().find(|c| overlaps(c, range)) {
                    return Err(Error::Collision {
                        range: bad.to_string(),
                        context: format!("hub firewall {}", firewall.name),
                    });
                }
            }
        }

        let unique: Vec<&SubnetPlan> = self
            .subnets()
            .into_iter()
            .filter(|s| s.purpose.network_unique())
            .collect();
        for (i, a) in unique.iter().enumerate() {
            if let Some(c) = colliding.iter().find(|c| overlaps(c, &a.range)) {
                return Err(Error::Collision {
                    range: c.to_string(),
                    context: format!("subnet {}", a.name),
                });
            }
            for b in &unique[i + 1..] {
                if overlaps(&a.range, &b.range) {
                    return Err(Error::RangeOverlap {
                        a: format!("{} ({})", a.name, a.range),
                        b: format!("{} ({})", b.name, b.range),
                    });
                }
            }
        }

        for spoke in &self.spokes {
            let subnets = spoke.subnets();
            for (i, a) in subnets.iter().enumerate() {
                for b in &subnets[i + 1..] {
                    if overlaps(&a.range, &b.range) {
                        return Err(Error::RangeOverlap {
                            a: format!("{} ({})", a.name, a.range),
                            b: format!("{} ({})", b.name, b.range),
                        });
                    }
                }
            }
            if spoke.nat_router == spoke.vpn_router {
                return Err(Error::InvalidTopology(format!(
                    "spoke {} shares a router between NAT and BGP",
                    spoke.index
                )));
            }
        }

        let tunnels: Vec<&TunnelPlan> = self.links.iter().flat_map(|l| &l.tunnels).collect();
        for tunnel in &tunnels {
            if tunnel.local_asn == tunnel.peer_asn {
                return Err(Error::InvalidTopology(format!(
                    "tunnel {} peers with its own ASN {}",
                    tunnel.name, tunnel.local_asn
                )));
            }
            if !tunnel.link_range.contains(&tunnel.local_ip)
                || !tunnel.link_range.contains(&tunnel.peer_ip)
            {
                return Err(Error::InvalidTopology(format!(
                    "tunnel {} session addresses outside {}",
                    tunnel.name, tunnel.link_range
                )));
            }
        }
        let mut link_ranges: Vec<(Ipv4Net, &str)> = tunnels
            .iter()
            .filter(|t| t.side == Side::Hub)
            .map(|t| (t.link_range, t.name.as_str()))
            .collect();
        link_ranges.sort();
        for pair in link_ranges.windows(2) {
            if overlaps(&pair[0].0, &pair[1].0) {
                return Err(Error::RangeOverlap {
                    a: format!("{} ({})", pair[0].1, pair[0].0),
                    b: format!("{} ({})", pair[1].1, pair[1].0),
                });
            }
        }

        Ok(())
    }
}

fn build_spoke(config: &DeployConfig, i: usize) -> SpokePlan {
    let octet = i as u8;
    let spoke = format!("spoke{}", i);
    let network = config.name(&spoke);
    let subnet = |suffix: &str, range: Ipv4Net, purpose: SubnetPurpose| SubnetPlan {
        name: config.name(&format!("{}-{}", spoke, suffix)),
        network: network.clone(),
        range,
        purpose,
    };

    let routable = subnet("routable", net(10, octet, 0, 0, 24), SubnetPurpose::Routable);
    let nat_pool = subnet("natpool", net(10, octet, 16, 0, 24), SubnetPurpose::NatPool);
    let advertised = vec![routable.range, nat_pool.range];

    SpokePlan {
        index: i,
        overlapping: subnet("overlap", overlapping_range(), SubnetPurpose::Overlapping),
        proxy_only: subnet("proxy", net(10, octet, 8, 0, 23), SubnetPurpose::ProxyOnly),
        routable,
        nat_pool,
        vpn_gateway: config.name(&format!("{}-vpn-gw", spoke)),
        vpn_router: config.name(&format!("{}-vpn-router", spoke)),
        asn: HUB_ASN + i as u32,
        advertised,
        nat_router: config.name(&format!("{}-nat-router", spoke)),
        private_nat: config.name(&format!("{}-private-nat", spoke)),
        echo_service: config.name(&format!("{}-echo", spoke)),
        probe_job: config.name(&format!("{}-probe", spoke)),
        relay_services: (1..=config.relay_scale)
            .map(|n| config.name(&format!("{}-relay-{}", spoke, n)))
            .collect(),
        load_balancer: LoadBalancerPlan {
            neg: config.name(&format!("{}-neg", spoke)),
            backend: config.name(&format!("{}-backend", spoke)),
            url_map: config.name(&format!("{}-urlmap", spoke)),
            certificate: config.name(&format!("{}-cert", spoke)),
            https_proxy: config.name(&format!("{}-https-proxy", spoke)),
            address: config.name(&format!("{}-lb-ip", spoke)),
            forwarding_rule: config.name(&format!("{}-lb-rule", spoke)),
            common_name: format!("{}.{}.internal", spoke, config.prefix),
        },
        firewalls: vec![FirewallPlan {
            name: config.name(&format!("{}-allow-hub", spoke)),
            network: network.clone(),
            source_ranges: vec![hub_general_range()],
            allow: vec![format!("tcp:{}", FRONT_END_PORT)],
            target_tags: Vec::new(),
        }],
        network,
    }
}

fn build_link(config: &DeployConfig, hub: &HubPlan, spoke: &SpokePlan) -> LinkPlan {
    let i = spoke.index;
    let secret = config.tunnel_secret(&format!("spoke{}", i));
    let mut tunnels = Vec::new();

    for k in 0..TUNNELS_PER_SIDE {
        let third = (4 * (i - 1) + k as usize) as u8;
        let link_range = net(169, 254, third, 0, 30);
        let hub_ip = Ipv4Addr::new(169, 254, third, 1);
        let spoke_ip = Ipv4Addr::new(169, 254, third, 2);

        let hub_tunnel = config.name(&format!("hub-to-spoke{}-{}", i, k));
        let spoke_tunnel = config.name(&format!("spoke{}-to-hub-{}", i, k));

        tunnels.push(TunnelPlan {
            interface_name: format!("{}-if", hub_tunnel),
            peer_name: format!("{}-peer", hub_tunnel),
            name: hub_tunnel,
            side: Side::Hub,
            interface: k,
            gateway: hub.vpn_gateway.clone(),
            peer_gateway: spoke.vpn_gateway.clone(),
            router: hub.vpn_router.clone(),
            link_range,
            local_ip: hub_ip,
            peer_ip: spoke_ip,
            local_asn: hub.asn,
            peer_asn: spoke.asn,
            shared_secret: secret.clone(),
        });
        tunnels.push(TunnelPlan {
            interface_name: format!("{}-if", spoke_tunnel),
            peer_name: format!("{}-peer", spoke_tunnel),
            name: spoke_tunnel,
            side: Side::Spoke,
            interface: k,
            gateway: spoke.vpn_gateway.clone(),
            peer_gateway: hub.vpn_gateway.clone(),
            router: spoke.vpn_router.clone(),
            link_range,
            local_ip: spoke_ip,
            peer_ip: hub_ip,
            local_asn: spoke.asn,
            peer_asn: hub.asn,
            shared_secret: secret.clone(),
        });
    }

    LinkPlan { spoke: i, tunnels }
}
