use crate::error::{Error, Result};
use crate::types::{Server, User};
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Candidate servers for a given account. The snapshot is read-only; any
/// host remapping happens on per-request clones.
pub trait ServerStore: Send + Sync {
    fn available_servers_for(&self, user: &User) -> Vec<Server>;
}

/// Server snapshot loaded from a YAML file at startup.
pub struct YamlServerStore {
    servers: Vec<Server>,
}

impl YamlServerStore {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read servers file: {}", e)))?;
        let servers: Vec<Server> = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse servers file: {}", e)))?;
        Ok(Self::from_servers(servers))
    }

    pub fn from_servers(servers: Vec<Server>) -> Self {
        Self { servers }
    }
}

impl ServerStore for YamlServerStore {
    fn available_servers_for(&self, _user: &User) -> Vec<Server> {
        self.servers.clone()
    }
}

/// IPv4-only region lookup. IPv6 and unparsable addresses resolve to no
/// region, so region-based exclusion never triggers for them.
pub trait GeoResolver: Send + Sync {
    fn region_for(&self, ip: Ipv4Addr) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct GeoRow {
    cidr: String,
    region: String,
}

struct GeoEntry {
    network: u32,
    prefix_len: u8,
    region: String,
}

/// Longest-prefix lookup over a static CIDR table.
pub struct StaticGeoResolver {
    entries: Vec<GeoEntry>,
}

impl StaticGeoResolver {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read geo file: {}", e)))?;
        let rows: Vec<GeoRow> = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse geo file: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(parse_cidr(&row.cidr, row.region)?);
        }
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

fn parse_cidr(cidr: &str, region: String) -> Result<GeoEntry> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("Invalid CIDR: {}", cidr)))?;
    let network: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::Config(format!("Invalid CIDR address: {}", cidr)))?;
    let prefix_len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| Error::Config(format!("Invalid CIDR prefix: {}", cidr)))?;

    Ok(GeoEntry {
        network: u32::from(network),
        prefix_len,
        region,
    })
}

impl GeoResolver for StaticGeoResolver {
    fn region_for(&self, ip: Ipv4Addr) -> Option<String> {
        let ip = u32::from(ip);
        self.entries
            .iter()
            .filter(|e| {
                e.prefix_len == 0 || (ip ^ e.network) >> (32 - e.prefix_len as u32) == 0
            })
            .max_by_key(|e| e.prefix_len)
            .map(|e| e.region.clone())
    }
}
