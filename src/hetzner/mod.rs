pub mod client;

pub use client::{HetznerClient, HetznerError};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Optional server-side filters applied to every inventory fetch.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerFilter {
    /// Only return servers matching this name exactly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// A label selector expression, e.g. "env=prod".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Only return servers in this status, e.g. "running".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// Not all fields are included, only the fields we need. Unknown fields
// in API responses are ignored.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ServerRecord {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub public_net: PublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    pub server_type: ServerType,
    pub datacenter: Datacenter,
    pub image: Option<Image>,
    #[serde(default)]
    pub placement_group: Option<PlacementGroup>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PublicNet {
    pub ipv4: Option<Address>,
    pub ipv6: Option<Address>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Address {
    pub ip: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PrivateNet {
    pub network: u64,
    pub ip: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ServerType {
    pub name: String,
    pub cores: u64,
    pub cpu_type: String,
    pub disk: f64,
    pub memory: f64,
    pub storage_type: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Datacenter {
    pub name: String,
    pub location: Location,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Location {
    pub name: String,
    pub city: String,
    pub country: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Image {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub description: Option<String>,
    pub os_flavor: Option<String>,
    pub os_version: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PlacementGroup {
    pub name: String,
}
