use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::*;

lazy_static! {
    static ref DATACENTER: Regex = Regex::new(r"^\s*Datacenter: (.+)$").unwrap();
    static ref NODE: Regex = Regex::new(
        r"^\s*([UD][NLJM])\s+([0-9]+\.[0-9]+\.[0-9]+\.[0-9]+)\s+([0-9]+(?:\.[0-9]+)? (?:bytes|B|KiB|MiB|GiB|TiB|PiB))\s+([0-9]+)\s+([0-9?.%]+)\s+([a-zA-Z0-9\-]+)\s+(.+?)\s*$"
    )
    .unwrap();
    static ref GOSSIP_ACTIVE: Regex = Regex::new(r"^\s*Gossip active\s+:\s+(true|false)\s*$").unwrap();
}

/// A single row of the `nodetool status` table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    /// Two letter state code such as `UN` or `DJ`.
    pub state: String,
    pub address: String,
    pub load: String,
    pub tokens: String,
    /// Effective ownership, `?` when unknown.
    pub owns: String,
    pub host_id: String,
    pub rack: String,
}

impl Node {
    pub fn is_up(&self) -> bool {
        self.state.contains('U')
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Datacenter {
    pub name: String,
    pub nodes: Vec<Node>,
}

/// The ring as reported by `nodetool status`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub datacenters: Vec<Datacenter>,
}

impl Status {
    /// Parse the output of `nodetool status`.
    ///
    /// Never fails: lines which are neither a datacenter header nor a node row are skipped, as
    /// are node rows appearing before the first datacenter header.
    pub fn parse(raw: &str) -> Self {
        let mut datacenters: Vec<Datacenter> = Vec::new();
        for line in raw.lines() {
            if let Some(caps) = DATACENTER.captures(line) {
                datacenters.push(Datacenter {
                    name: caps[1].trim().to_string(),
                    nodes: Vec::new(),
                });
                continue;
            }
            let dc = match datacenters.last_mut() {
                Some(dc) => dc,
                None => continue,
            };
            if let Some(caps) = NODE.captures(line) {
                dc.nodes.push(Node {
                    state: caps[1].to_string(),
                    address: caps[2].to_string(),
                    load: caps[3].to_string(),
                    tokens: caps[4].to_string(),
                    owns: caps[5].to_string(),
                    host_id: caps[6].to_string(),
                    rack: caps[7].to_string(),
                });
            }
        }
        Status { datacenters }
    }

    pub fn is_empty(&self) -> bool {
        self.datacenters.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.datacenters.iter().flat_map(|dc| dc.nodes.iter())
    }

    pub fn find_node(&self, ip: &str) -> Option<&Node> {
        self.nodes().find(|n| n.address == ip)
    }

    /// Whether `ip` is in the ring and `UN`.
    pub fn has_up_node(&self, ip: &str) -> bool {
        self.find_node(ip).map(|n| n.state == "UN").unwrap_or(false)
    }
}

/// Extract the `Gossip active` flag from the output of `nodetool info`.
pub fn parse_gossip_active(info: &str) -> Result<bool> {
    info.lines()
        .find_map(|line| GOSSIP_ACTIVE.captures(line).map(|caps| &caps[1] == "true"))
        .ok_or_else(|| ErrorKind::GossipStateMissing(info.to_string()).into())
}
