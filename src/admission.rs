use crate::config::AdmissionConfig;
use crate::error::{Error, Result};
use crate::store::KvStore;
use crate::types::User;
use crate::users::UserStore;
use crate::utils::{current_timestamp, format_datetime};
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn blacklist_key(ip: &str) -> String {
    format!("ip_blacklist_{}", ip)
}

fn failed_key(ip: &str) -> String {
    format!("failed_token_attempts_{}", ip)
}

fn user_window_key(user_id: u64) -> String {
    format!("subscribe_limit_{}", user_id)
}

fn ip_window_key(ip: &str) -> String {
    format!("subscribe_ip_limit_{}", ip)
}

/// Stateful admission control in front of the client endpoints: blacklist,
/// failed-attempt tracking, and per-user/per-IP fixed-window rate limiting,
/// all backed by the shared expiring store.
pub struct AdmissionGate {
    store: Arc<dyn KvStore>,
    users: Arc<dyn UserStore>,
    limits: AdmissionConfig,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn KvStore>, users: Arc<dyn UserStore>, limits: AdmissionConfig) -> Self {
        Self {
            store,
            users,
            limits,
        }
    }

    /// Admit or reject one request. Steps, in order: blacklist check,
    /// failed-attempt threshold (blacklisting the IP on breach), token
    /// presence, token lookup, counter clear on success, and - for the
    /// subscribe endpoint only - the two independent fixed-window rate
    /// limits.
    ///
    /// Blacklist and rate-limit checks fail closed: a store error surfaces
    /// instead of admitting the request.
    pub fn authorize(
        &self,
        ip: &str,
        token: Option<&str>,
        subscribe_endpoint: bool,
        headers: &HeaderMap,
    ) -> Result<User> {
        if self.store.has_marker(&blacklist_key(ip))? {
            return Err(Error::Blocked(
                "This IP has been blocked due to too many invalid attempts".to_string(),
            ));
        }

        let failed = failed_key(ip);
        if self
            .store
            .counter(&failed)
            .is_some_and(|n| n >= self.limits.max_failed_attempts)
        {
            warn!(ip, "failed-attempt threshold reached, blacklisting");
            self.store.put_marker(
                &blacklist_key(ip),
                header_snapshot(headers),
                Duration::from_secs(self.limits.blacklist_ttl_secs),
            )?;
            self.store.remove_counter(&failed);
            return Err(Error::Blocked(
                "Too many invalid token attempts, IP blocked".to_string(),
            ));
        }

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            self.record_failed_attempt(&failed);
            return Err(Error::InvalidToken("token is null".to_string()));
        };

        let Some(user) = self.users.find_by_token(token) else {
            self.record_failed_attempt(&failed);
            return Err(Error::InvalidToken("token is error".to_string()));
        };

        self.store.remove_counter(&failed);

        if subscribe_endpoint {
            self.check_window(
                &user_window_key(user.id),
                self.limits.user_rate_limit,
                || Error::RateLimitedUser("Too many requests for this user".to_string()),
            )?;
            self.check_window(&ip_window_key(ip), self.limits.ip_rate_limit, || {
                Error::RateLimitedIp("Too many requests from this IP".to_string())
            })?;
        }

        Ok(user)
    }

    fn record_failed_attempt(&self, key: &str) {
        let ttl = Duration::from_secs(self.limits.failed_attempt_ttl_secs);
        if self.store.counter(key).is_some() {
            let n = self.store.increment(key, ttl);
            info!(key, attempts = n, "invalid token attempt");
        } else {
            self.store.set_counter(key, 1, ttl);
        }
    }

    /// Fixed window: the counter's TTL is set once, when the window opens,
    /// and increments never refresh it. A burst at the boundary can admit
    /// up to twice the nominal limit across two adjacent windows; that
    /// approximation is accepted.
    fn check_window(
        &self,
        key: &str,
        max: u64,
        reject: impl FnOnce() -> Error,
    ) -> Result<()> {
        let window = Duration::from_secs(self.limits.rate_window_secs);
        match self.store.counter(key) {
            Some(n) if n >= max => Err(reject()),
            Some(_) => {
                self.store.increment(key, window);
                Ok(())
            }
            None => {
                self.store.set_counter(key, 1, window);
                Ok(())
            }
        }
    }
}

fn header_snapshot(headers: &HeaderMap) -> serde_json::Value {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };

    serde_json::json!({
        "user_agent": header("user-agent"),
        "referer": header("referer"),
        "accept": header("accept"),
        "accept_language": header("accept-language"),
        "accept_encoding": header("accept-encoding"),
        "blocked_at": format_datetime(current_timestamp()),
    })
}

/// Original client IP, first non-empty source wins: explicit `ip` request
/// parameter, Cloudflare's `CF-Connecting-IP`, the first (leftmost) entry
/// of `X-Forwarded-For`, then the transport peer address.
pub fn resolve_client_ip(
    ip_param: Option<&str>,
    headers: &HeaderMap,
    peer_addr: SocketAddr,
) -> String {
    if let Some(ip) = ip_param.filter(|s| !s.is_empty()) {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get("cf-connecting-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }

    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    peer_addr.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::users::{UserStore, YamlUserStore};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn test_user(id: u64, token: &str) -> User {
        User {
            id,
            email: format!("user{}@example.com", id),
            token: token.to_string(),
            upload: 0,
            download: 0,
            transfer_enable: 100 << 30,
            expired_at: None,
            banned: false,
        }
    }

    fn test_gate(limits: AdmissionConfig) -> (TempDir, AdmissionGate) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::new(tmp.path().join("gate.db")).unwrap());
        let users: Arc<dyn UserStore> = Arc::new(YamlUserStore::from_users(vec![
            test_user(1, "valid-token"),
            test_user(2, "other-token"),
        ]));
        (tmp, AdmissionGate::new(store, users, limits))
    }

    fn limits() -> AdmissionConfig {
        AdmissionConfig::default()
    }

    #[test]
    fn test_valid_token_admitted() {
        let (_tmp, gate) = test_gate(limits());
        let user = gate
            .authorize("1.2.3.4", Some("valid-token"), false, &HeaderMap::new())
            .unwrap();
        assert_eq!(user.id, 1);
    }

    #[test]
    fn test_missing_and_unknown_tokens_rejected() {
        let (_tmp, gate) = test_gate(limits());
        let headers = HeaderMap::new();

        assert!(matches!(
            gate.authorize("1.2.3.4", None, false, &headers),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            gate.authorize("1.2.3.4", Some(""), false, &headers),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            gate.authorize("1.2.3.4", Some("nope"), false, &headers),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn test_threshold_blacklists_ip_but_not_others() {
        let (_tmp, gate) = test_gate(limits());
        let headers = HeaderMap::new();

        for _ in 0..20 {
            assert!(matches!(
                gate.authorize("9.9.9.9", Some("bad"), false, &headers),
                Err(Error::InvalidToken(_))
            ));
        }

        // 21st attempt trips the threshold and records the blacklist entry
        assert!(matches!(
            gate.authorize("9.9.9.9", Some("bad"), false, &headers),
            Err(Error::Blocked(_))
        ));

        // Blacklist is now consulted before anything else, valid token or not
        assert!(matches!(
            gate.authorize("9.9.9.9", Some("valid-token"), false, &headers),
            Err(Error::Blocked(_))
        ));

        // A different IP is unaffected
        assert!(gate
            .authorize("8.8.8.8", Some("valid-token"), false, &headers)
            .is_ok());
    }

    #[test]
    fn test_success_clears_failure_counter() {
        let (_tmp, gate) = test_gate(limits());
        let headers = HeaderMap::new();

        for _ in 0..19 {
            let _ = gate.authorize("5.5.5.5", Some("bad"), false, &headers);
        }
        assert!(gate
            .authorize("5.5.5.5", Some("valid-token"), false, &headers)
            .is_ok());

        // Counter was cleared, so 20 more failures are needed again
        for _ in 0..20 {
            assert!(matches!(
                gate.authorize("5.5.5.5", Some("bad"), false, &headers),
                Err(Error::InvalidToken(_))
            ));
        }
        assert!(matches!(
            gate.authorize("5.5.5.5", Some("bad"), false, &headers),
            Err(Error::Blocked(_))
        ));
    }

    #[test]
    fn test_user_rate_limit_fixed_window() {
        let (_tmp, gate) = test_gate(limits());
        let headers = HeaderMap::new();

        // Spread over distinct IPs so only the per-user window applies
        for i in 0..10 {
            let ip = format!("10.0.0.{}", i + 1);
            assert!(
                gate.authorize(&ip, Some("valid-token"), true, &headers).is_ok(),
                "request {} should be admitted",
                i + 1
            );
        }

        assert!(matches!(
            gate.authorize("10.0.0.99", Some("valid-token"), true, &headers),
            Err(Error::RateLimitedUser(_))
        ));

        // Another user is unaffected
        assert!(gate
            .authorize("10.0.0.99", Some("other-token"), true, &headers)
            .is_ok());
    }

    #[test]
    fn test_ip_rate_limit_independent_of_user() {
        let mut limits = limits();
        limits.ip_rate_limit = 5;
        let (_tmp, gate) = test_gate(limits);
        let headers = HeaderMap::new();

        // Alternate users from one IP; the per-IP window fills while
        // neither user window does
        for i in 0..5 {
            let token = if i % 2 == 0 { "valid-token" } else { "other-token" };
            assert!(
                gate.authorize("7.7.7.7", Some(token), true, &headers).is_ok(),
                "request {} should be admitted",
                i + 1
            );
        }

        assert!(matches!(
            gate.authorize("7.7.7.7", Some("valid-token"), true, &headers),
            Err(Error::RateLimitedIp(_))
        ));

        // The same user from a fresh IP is still fine
        assert!(gate
            .authorize("7.7.7.8", Some("valid-token"), true, &headers)
            .is_ok());
    }

    #[test]
    fn test_next_window_admits_again() {
        let mut limits = limits();
        limits.rate_window_secs = 1;
        limits.user_rate_limit = 2;
        let (_tmp, gate) = test_gate(limits);
        let headers = HeaderMap::new();

        assert!(gate.authorize("1.1.1.1", Some("valid-token"), true, &headers).is_ok());
        assert!(gate.authorize("1.1.1.2", Some("valid-token"), true, &headers).is_ok());
        assert!(matches!(
            gate.authorize("1.1.1.3", Some("valid-token"), true, &headers),
            Err(Error::RateLimitedUser(_))
        ));

        std::thread::sleep(Duration::from_millis(1100));

        // Window expired by TTL; note this is a fixed window, so a boundary
        // burst can admit up to 2x the nominal limit across the edge
        assert!(gate.authorize("1.1.1.4", Some("valid-token"), true, &headers).is_ok());
    }

    #[test]
    fn test_resolve_client_ip_precedence() {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 51000);

        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "198.51.100.4".parse().unwrap());
        headers.insert("x-forwarded-for", "192.0.2.1, 10.0.0.1".parse().unwrap());

        assert_eq!(
            resolve_client_ip(Some("1.2.3.4"), &headers, peer),
            "1.2.3.4"
        );
        assert_eq!(resolve_client_ip(None, &headers, peer), "198.51.100.4");

        headers.remove("cf-connecting-ip");
        assert_eq!(resolve_client_ip(None, &headers, peer), "192.0.2.1");

        headers.remove("x-forwarded-for");
        assert_eq!(resolve_client_ip(None, &headers, peer), "203.0.113.7");

        // Empty override falls through
        assert_eq!(resolve_client_ip(Some(""), &headers, peer), "203.0.113.7");
    }
}
