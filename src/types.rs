use serde::{Deserialize, Serialize};

/// Account snapshot from the user store. Read-only to this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub token: String,
    /// Upload bytes consumed
    #[serde(default)]
    pub upload: u64,
    /// Download bytes consumed
    #[serde(default)]
    pub download: u64,
    /// Traffic quota in bytes
    #[serde(default)]
    pub transfer_enable: u64,
    /// Unix timestamp; None means the plan never expires
    #[serde(default)]
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub banned: bool,
}

impl User {
    pub fn traffic_used(&self) -> u64 {
        self.upload + self.download
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Shadowsocks,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Vmess => "vmess",
            ServerKind::Vless => "vless",
            ServerKind::Trojan => "trojan",
            ServerKind::Hysteria => "hysteria",
            ServerKind::Shadowsocks => "shadowsocks",
        }
    }
}

/// Backend server snapshot. Hysteria v2 is modeled as kind `hysteria` with
/// `version == Some(2)`; the `hysteria2` token only exists in type filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default)]
    pub version: Option<u8>,
    #[serde(default)]
    pub cipher: Option<String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Region-name substrings; a match against the requester's region hides
    /// the server from that region
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Alternate inbound addresses, selectable via the 1-based `inbound`
    /// request parameter
    #[serde(default)]
    pub ips: Vec<String>,
}

/// What the client identifier told us about the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub version: Option<String>,
    pub supports_hy2: bool,
}

/// Per-request server filter. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    /// Allowed type tokens, in the fixed allowed-type order
    pub types: Vec<String>,
    /// None when no filter was given or the raw filter exceeded the cap
    pub keywords: Option<Vec<String>>,
    /// Requester region, when the IP resolved to one
    pub region: Option<String>,
    pub supports_hy2: bool,
    pub support_ss2022: bool,
}

/// One audit-log row, stored JSON-encoded in the per-user list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ip: String,
    pub user_id: u64,
    pub email: String,
    pub timestamp: i64,
    pub datetime: String,
    pub user_agent: String,
}

/// Row of the active-users projection.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveUser {
    pub user_id: String,
    pub last_activity: String,
    pub request_count: usize,
}
