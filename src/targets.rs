use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::hetzner::ServerRecord;

/// One entry of the http_sd response: a set of scrape targets sharing the
/// same label set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Turns inventory records into Prometheus target groups.
#[derive(Clone, Debug)]
pub struct TargetFormatter {
    /// Port appended to every resolved address.
    pub node_port: u16,
    /// Preferred private network, either a network id or a CIDR.
    pub node_network: Option<String>,
    /// Prefix for the `__meta_<prefix>_...` label namespace.
    pub label_prefix: String,
}

impl TargetFormatter {
    /// Pure transformation of records into groups. Records whose address
    /// cannot be resolved are dropped. Groups with identical label sets are
    /// merged, preserving first-occurrence order.
    pub fn format(&self, servers: &[ServerRecord]) -> Vec<TargetGroup> {
        let mut groups: Vec<TargetGroup> = Vec::new();
        let mut index: HashMap<BTreeMap<String, String>, usize> = HashMap::new();

        for server in servers {
            let Some(ip) = self.resolve_ip(server) else {
                debug!(
                    message = "server has no resolvable address, dropping",
                    id = server.id,
                    name = %server.name,
                );
                continue;
            };

            let target = format!("{}:{}", ip, self.node_port);
            let labels = self.labels(server);

            match index.get(&labels) {
                Some(&at) => groups[at].targets.push(target),
                None => {
                    index.insert(labels.clone(), groups.len());
                    groups.push(TargetGroup {
                        targets: vec![target],
                        labels,
                    });
                }
            }
        }

        groups
    }

    /// Address selection: a private address on the preferred network wins,
    /// then public IPv4, then public IPv6.
    fn resolve_ip(&self, server: &ServerRecord) -> Option<String> {
        if let Some(selector) = &self.node_network {
            let cidr = selector.parse::<IpNet>().ok();

            for net in &server.private_net {
                if net.network.to_string() == *selector {
                    return Some(net.ip.clone());
                }

                if let Some(cidr) = &cidr
                    && let Ok(addr) = net.ip.parse::<IpAddr>()
                    && cidr.contains(&addr)
                {
                    return Some(net.ip.clone());
                }
            }
        }

        if let Some(ipv4) = &server.public_net.ipv4 {
            return Some(ipv4.ip.clone());
        }

        server.public_net.ipv6.as_ref().map(|ipv6| ipv6.ip.clone())
    }

    fn labels(&self, server: &ServerRecord) -> BTreeMap<String, String> {
        let image = server.image.as_ref();
        let unknown = || "unknown".to_string();
        let none = || "none".to_string();

        let mut labels = BTreeMap::new();
        let mut meta = |key: &str, value: String| {
            labels.insert(format!("__meta_{}_{key}", self.label_prefix), value);
        };

        meta("data_center", server.datacenter.name.clone());
        meta(
            "image",
            image.and_then(|i| i.name.clone()).unwrap_or_else(unknown),
        );
        meta(
            "image_type",
            image
                .and_then(|i| i.kind.clone().or_else(|| i.description.clone()))
                .unwrap_or_else(unknown),
        );
        meta("location", server.datacenter.location.name.clone());
        meta("location_city", server.datacenter.location.city.clone());
        meta(
            "location_country",
            server.datacenter.location.country.clone(),
        );
        meta("name", server.name.clone());
        meta(
            "os_flavor",
            image
                .and_then(|i| i.os_flavor.clone())
                .unwrap_or_else(unknown),
        );
        meta(
            "os_version",
            image
                .and_then(|i| i.os_version.clone())
                .unwrap_or_else(unknown),
        );
        meta(
            "placement_group",
            server
                .placement_group
                .as_ref()
                .map(|group| group.name.clone())
                .unwrap_or_else(none),
        );
        meta(
            "public_ipv4",
            server
                .public_net
                .ipv4
                .as_ref()
                .map(|a| a.ip.clone())
                .unwrap_or_else(none),
        );
        meta(
            "public_ipv6",
            server
                .public_net
                .ipv6
                .as_ref()
                .map(|a| a.ip.clone())
                .unwrap_or_else(none),
        );
        meta("server_cpu_cores", server.server_type.cores.to_string());
        meta("server_cpu_type", server.server_type.cpu_type.clone());
        meta("server_disk", server.server_type.disk.to_string());
        meta("server_memory", server.server_type.memory.to_string());
        meta("server_storage", server.server_type.storage_type.clone());
        meta("server_type", server.server_type.name.clone());
        meta("status", server.status.clone());

        for (key, value) in &server.labels {
            labels.insert(
                format!(
                    "__meta_{}_label_{}",
                    self.label_prefix,
                    sanitize_label_key(key)
                ),
                value.clone(),
            );
        }

        labels
    }
}

/// Collapse runs of '.', '_' and '-' into a single underscore.
fn sanitize_label_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_run = false;

    for c in key.chars() {
        if matches!(c, '.' | '_' | '-') {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }

    out
}
