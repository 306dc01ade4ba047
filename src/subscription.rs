use crate::capability;
use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::render::{Rendered, RendererRegistry};
use crate::selector::{self, parse_bool_like, parse_keywords, resolve_types};
use crate::servers::{GeoResolver, ServerStore};
use crate::types::{Capability, FilterSpec, Server, ServerKind, User};
use crate::users::UserStore;
use crate::utils::{format_date, traffic_convert};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Query parameters of the subscribe endpoint, as received.
#[derive(Debug, Default, Clone)]
pub struct SubscribeQuery {
    pub token: Option<String>,
    pub types: Option<String>,
    pub ss2022: Option<String>,
    pub filter: Option<String>,
    pub flag: Option<String>,
    pub ip: Option<String>,
    pub inbound: Option<String>,
    pub user_id: Option<String>,
}

/// Everything the pipeline resolved for one admitted request. Built once;
/// nothing downstream mutates it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: User,
    pub ip: String,
    pub flag: String,
    pub capability: Capability,
    pub spec: FilterSpec,
}

/// Orchestrates capability detection, candidate fetch, selection, banner
/// injection and renderer dispatch for one admitted request.
pub struct SubscriptionAssembler {
    users: Arc<dyn UserStore>,
    servers: Arc<dyn ServerStore>,
    geo: Arc<dyn GeoResolver>,
    registry: Arc<RendererRegistry>,
    options: SubscriptionConfig,
}

impl SubscriptionAssembler {
    pub fn new(
        users: Arc<dyn UserStore>,
        servers: Arc<dyn ServerStore>,
        geo: Arc<dyn GeoResolver>,
        registry: Arc<RendererRegistry>,
        options: SubscriptionConfig,
    ) -> Self {
        Self {
            users,
            servers,
            geo,
            registry,
            options,
        }
    }

    /// Assemble the subscription response. Returns None for an unavailable
    /// (expired or banned) account: the endpoint yields an empty body
    /// rather than an error status.
    pub fn assemble(
        &self,
        user: &User,
        query: &SubscribeQuery,
        ip: &str,
        user_agent: &str,
    ) -> Result<Option<Rendered>> {
        if !self.users.is_available(user) {
            debug!(user_id = user.id, "account unavailable, empty response");
            return Ok(None);
        }

        let context = self.build_context(user, query, ip, user_agent);

        let mut servers = self.servers.available_servers_for(user);
        remap_inbound_hosts(&mut servers, query.inbound.as_deref());

        let candidate_count = servers.len();
        let mut selected = selector::select(servers, &context.spec);
        debug!(
            user_id = user.id,
            candidates = candidate_count,
            selected = selected.len(),
            "server selection done"
        );

        if self.options.show_info_banner {
            self.inject_info_banners(&mut selected, user);
        }
        if self.options.show_protocol_prefix {
            add_protocol_prefix(&mut selected);
        }

        self.registry
            .dispatch(&context.flag, user, &selected)
            .map(Some)
    }

    /// Resolve the typed per-request context: lowercased flag, detected
    /// capability, and the immutable filter spec.
    pub fn build_context(
        &self,
        user: &User,
        query: &SubscribeQuery,
        ip: &str,
        user_agent: &str,
    ) -> RequestContext {
        let flag = query
            .flag
            .as_deref()
            .unwrap_or(user_agent)
            .to_lowercase();
        let capability = capability::detect(&flag);

        let region = ip
            .parse::<Ipv4Addr>()
            .ok()
            .and_then(|v4| self.geo.region_for(v4));

        let spec = FilterSpec {
            types: resolve_types(query.types.as_deref()),
            keywords: parse_keywords(query.filter.as_deref()),
            region,
            supports_hy2: capability.supports_hy2,
            support_ss2022: parse_bool_like(query.ss2022.as_deref()),
        };

        RequestContext {
            user: user.clone(),
            ip: ip.to_string(),
            flag,
            capability,
            spec,
        }
    }

    /// Prepend the informational pseudo-servers: remaining traffic, days to
    /// reset (when a cycle applies), and plan expiry. Each clones the
    /// current head so clients accept them as regular entries; nothing is
    /// emitted when no real server survived filtering.
    fn inject_info_banners(&self, servers: &mut Vec<Server>, user: &User) {
        if servers.is_empty() {
            return;
        }

        let expiry = user
            .expired_at
            .map(format_date)
            .unwrap_or_else(|| "长期有效".to_string());
        let mut banner = servers[0].clone();
        banner.name = format!("套餐到期：{}", expiry);
        servers.insert(0, banner);

        if let Some(days) = self.users.reset_cycle_days(user) {
            let mut banner = servers[0].clone();
            banner.name = format!("距离下次重置剩余：{} 天", days);
            servers.insert(0, banner);
        }

        let remaining = user
            .transfer_enable
            .saturating_sub(user.traffic_used());
        let mut banner = servers[0].clone();
        banner.name = format!("剩余流量：{}", traffic_convert(remaining));
        servers.insert(0, banner);
    }
}

/// Swap each server's displayed host for its Nth alternate address when a
/// 1-based `inbound` index is supplied and in range for that server.
fn remap_inbound_hosts(servers: &mut [Server], inbound: Option<&str>) {
    let Some(index) = inbound.and_then(|raw| raw.parse::<usize>().ok()).filter(|i| *i > 0)
    else {
        return;
    };

    for server in servers.iter_mut() {
        if server.ips.len() >= index {
            server.host = server.ips[index - 1].clone();
        }
    }
}

fn add_protocol_prefix(servers: &mut [Server]) {
    for server in servers.iter_mut() {
        let prefix = match server.kind {
            ServerKind::Hysteria => match server.version {
                Some(2) => "[Hy2]",
                _ => "[Hy]",
            },
            ServerKind::Vless => "[vless]",
            ServerKind::Shadowsocks => "[ss]",
            ServerKind::Vmess => "[vmess]",
            ServerKind::Trojan => "[trojan]",
        };
        server.name = format!("{}{}", prefix, server.name);
    }
}
