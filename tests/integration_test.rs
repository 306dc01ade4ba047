//! Integration tests for the subscription gateway.
//!
//! These exercise the full admission → audit → selection → render pipeline
//! against real store state, without going over the network.

use http::HeaderMap;
use std::sync::Arc;
use sublink_gateway::admission::AdmissionGate;
use sublink_gateway::audit::AuditLog;
use sublink_gateway::config::{Config, SubscriptionConfig};
use sublink_gateway::error::Error;
use sublink_gateway::render::RendererRegistry;
use sublink_gateway::selector::SS_2022_CIPHER;
use sublink_gateway::server::Server;
use sublink_gateway::servers::{StaticGeoResolver, YamlServerStore};
use sublink_gateway::store::Store;
use sublink_gateway::subscription::{SubscribeQuery, SubscriptionAssembler};
use sublink_gateway::types::{AuditEntry, Server as Node, ServerKind, User};
use sublink_gateway::users::YamlUserStore;
use sublink_gateway::utils::{current_timestamp, format_datetime};
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("gateway.db").to_str().unwrap().to_string();
    let users_file = tmp.path().join("users.yaml").to_str().unwrap().to_string();
    let servers_file = tmp.path().join("servers.yaml").to_str().unwrap().to_string();

    serde_yaml::from_str(&format!(
        r#"
server:
  listen_addr: "127.0.0.1:0"

admission:
  max_failed_attempts: 20
  failed_attempt_ttl_secs: 3600
  blacklist_ttl_secs: 604800
  user_rate_limit: 10
  ip_rate_limit: 30
  rate_window_secs: 60

subscription:
  show_info_banner: false
  show_protocol_prefix: false

storage:
  path: "{db_path}"

data:
  users_file: "{users_file}"
  servers_file: "{servers_file}"

monitoring:
  prometheus:
    enabled: true
    path: "/metrics"
"#
    ))
    .unwrap()
}

fn write_snapshots(tmp: &TempDir) {
    std::fs::write(
        tmp.path().join("users.yaml"),
        r#"
- id: 1
  email: alice@example.com
  token: token-alice
  transfer_enable: 107374182400
  upload: 5368709120
  download: 5368709120
"#,
    )
    .unwrap();

    std::fs::write(
        tmp.path().join("servers.yaml"),
        r#"
- id: 1
  type: vmess
  name: "Tokyo 01"
  host: tokyo1.example.com
  port: 443
- id: 2
  type: hysteria
  version: 2
  name: "HK Hy2"
  host: hk.example.com
  port: 443
- id: 3
  type: trojan
  name: "Osaka 01"
  host: osaka1.example.com
  port: 443
- id: 4
  type: vless
  name: "SG 01"
  host: sg1.example.com
  port: 443
"#,
    )
    .unwrap();
}

fn pipeline_user() -> User {
    User {
        id: 1,
        email: "alice@example.com".to_string(),
        token: "token-alice".to_string(),
        upload: 5 << 30,
        download: 5 << 30,
        transfer_enable: 100 << 30,
        expired_at: None,
        banned: false,
    }
}

fn node(id: u64, kind: ServerKind, name: &str) -> Node {
    Node {
        id,
        kind,
        version: None,
        cipher: None,
        name: name.to_string(),
        host: format!("node{}.example.com", id),
        port: 443,
        tags: Vec::new(),
        excludes: Vec::new(),
        ips: Vec::new(),
    }
}

#[test]
fn test_config_loads_all_sections() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    assert_eq!(config.admission.max_failed_attempts, 20);
    assert_eq!(config.admission.user_rate_limit, 10);
    assert_eq!(config.admission.ip_rate_limit, 30);
    assert!(!config.subscription.show_info_banner);
    assert!(config.monitoring.prometheus.enabled);
    assert!(config.validate().is_ok());
}

#[test]
fn test_server_initialization_from_snapshots() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    write_snapshots(&tmp);

    let server = Server::new(config);
    assert!(server.is_ok(), "Server should initialize from snapshot files");
}

#[test]
fn test_end_to_end_subscribe_pipeline() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::new(tmp.path().join("e2e.db")).unwrap());
    let users = Arc::new(YamlUserStore::from_users(vec![pipeline_user()]));

    let gate = AdmissionGate::new(store.clone(), users.clone(), Default::default());
    let audit = AuditLog::new(store.clone());

    let mut hy2 = node(2, ServerKind::Hysteria, "HK Hy2");
    hy2.version = Some(2);
    let mut ss = node(5, ServerKind::Shadowsocks, "SS 2022");
    ss.cipher = Some(SS_2022_CIPHER.to_string());
    let backing = vec![
        node(1, ServerKind::Vmess, "Tokyo 01"),
        hy2,
        node(3, ServerKind::Trojan, "Osaka 01"),
        node(4, ServerKind::Vless, "SG 01"),
        ss,
        node(6, ServerKind::Vmess, "Tokyo 02"),
    ];
    let assembler = SubscriptionAssembler::new(
        users,
        Arc::new(YamlServerStore::from_servers(backing)),
        Arc::new(StaticGeoResolver::empty()),
        Arc::new(RendererRegistry::new()),
        SubscriptionConfig::default(),
    );

    // Admission with a valid token
    let headers = HeaderMap::new();
    let user = gate
        .authorize("198.51.100.10", Some("token-alice"), true, &headers)
        .unwrap();
    assert_eq!(user.id, 1);

    // Audit write and read-back
    let ts = current_timestamp();
    assert!(audit.record(&AuditEntry {
        ip: "198.51.100.10".to_string(),
        user_id: user.id,
        email: user.email.clone(),
        timestamp: ts,
        datetime: format_datetime(ts),
        user_agent: "v2rayng/1.8.0".to_string(),
    }));
    assert_eq!(audit.recent_requests(user.id).unwrap().len(), 1);

    // v2rayng 1.8.0 is below the 1.9.5 HY2 minimum, and only vmess/trojan
    // are requested: the renderer must see exactly the vmess/trojan subset
    // in original order
    let query = SubscribeQuery {
        types: Some("vmess|trojan".to_string()),
        ..Default::default()
    };
    let rendered = assembler
        .assemble(&user, &query, "198.51.100.10", "v2rayng/1.8.0")
        .unwrap()
        .unwrap();
    assert_eq!(rendered.renderer, "general");

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    let body = String::from_utf8(BASE64.decode(rendered.body).unwrap()).unwrap();
    let names: Vec<&str> = body.lines().map(|l| l.split_once('#').unwrap().1).collect();
    assert_eq!(names, vec!["Tokyo 01", "Osaka 01", "Tokyo 02"]);
}

#[test]
fn test_rejections_map_to_http_statuses() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::new(tmp.path().join("status.db")).unwrap());
    let users = Arc::new(YamlUserStore::from_users(vec![pipeline_user()]));
    let gate = AdmissionGate::new(store, users, Default::default());
    let headers = HeaderMap::new();

    let err = gate
        .authorize("203.0.113.1", None, false, &headers)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidToken(_)));
    assert_eq!(err.status(), http::StatusCode::FORBIDDEN);

    for _ in 0..10 {
        let _ = gate.authorize("203.0.113.2", Some("token-alice"), true, &headers);
    }
    let err = gate
        .authorize("203.0.113.2", Some("token-alice"), true, &headers)
        .unwrap_err();
    assert!(matches!(err, Error::RateLimitedUser(_)));
    assert_eq!(err.status(), http::StatusCode::TOO_MANY_REQUESTS);
}

#[test]
fn test_blacklist_survives_store_reopen() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("persist.db");
    let users = Arc::new(YamlUserStore::from_users(vec![pipeline_user()]));
    let headers = HeaderMap::new();

    {
        let store = Arc::new(Store::new(&db_path).unwrap());
        let gate = AdmissionGate::new(store.clone(), users.clone(), Default::default());
        for _ in 0..21 {
            let _ = gate.authorize("203.0.113.9", Some("bad"), false, &headers);
        }
        store.flush().unwrap();
    }

    // Markers live in sled; a restarted gateway still refuses the IP
    let store = Arc::new(Store::new(&db_path).unwrap());
    let gate = AdmissionGate::new(store, users, Default::default());
    let err = gate
        .authorize("203.0.113.9", Some("token-alice"), false, &headers)
        .unwrap_err();
    assert!(matches!(err, Error::Blocked(_)));
}
