use crate::types::{FilterSpec, Server, ServerKind};

/// Type tokens a request may ask for, in canonical order. `hysteria2` is a
/// filter token only; v2 servers still carry kind `hysteria`.
pub const ALLOWED_TYPES: [&str; 6] = [
    "vmess",
    "vless",
    "trojan",
    "hysteria",
    "shadowsocks",
    "hysteria2",
];

pub const SS_2022_CIPHER: &str = "2022-blake3-aes-256-gcm";

/// Longest raw keyword-filter string we accept. Anything longer drops the
/// whole filter rather than truncating it.
pub const MAX_FILTER_LEN: usize = 20;

/// Region marker that switches on exclusion-rule matching.
const CHINA_MARKER: &str = "中国";

/// Split a pipe/comma-separated list, normalizing full-width separators.
pub fn normalize_list(raw: &str) -> Vec<String> {
    raw.replace(['｜', '，', ','], "|")
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exclusion rules additionally split on spaces.
fn normalize_exclude_rule(raw: &str) -> Vec<String> {
    raw.replace(['｜', '，', ',', ' '], "|")
        .split('|')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve the `types` request parameter: `all` (or absent) means the full
/// fixed set; otherwise the requested tokens intersected with the fixed
/// set, in the fixed set's order.
pub fn resolve_types(raw: Option<&str>) -> Vec<String> {
    let raw = raw.unwrap_or("all");
    if raw == "all" {
        return ALLOWED_TYPES.iter().map(|t| t.to_string()).collect();
    }

    let requested = normalize_list(raw);
    ALLOWED_TYPES
        .iter()
        .filter(|t| requested.iter().any(|r| r == *t))
        .map(|t| t.to_string())
        .collect()
}

/// `"true"` and `"1"` are the only truthy spellings.
pub fn parse_bool_like(raw: Option<&str>) -> bool {
    matches!(raw, Some("true") | Some("1"))
}

/// Keyword filters, or None when absent, over the length cap, or empty
/// after separator normalization.
pub fn parse_keywords(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    if raw.is_empty() || raw.chars().count() > MAX_FILTER_LEN {
        return None;
    }
    Some(normalize_list(raw)).filter(|keywords| !keywords.is_empty())
}

/// Order-preserving subsequence of `servers` passing every rule in `spec`.
pub fn select(servers: Vec<Server>, spec: &FilterSpec) -> Vec<Server> {
    servers
        .into_iter()
        .filter(|server| !rejected(server, spec))
        .collect()
}

fn rejected(server: &Server, spec: &FilterSpec) -> bool {
    if !spec.types.iter().any(|t| t == server.kind.as_str()) {
        return true;
    }

    if server.kind == ServerKind::Hysteria && server.version == Some(2) {
        let hy2_allowed = spec.types.iter().any(|t| t == "hysteria2");
        if !hy2_allowed || !spec.supports_hy2 {
            return true;
        }
    }

    if server.kind == ServerKind::Shadowsocks {
        let is_ss2022 = server.cipher.as_deref() == Some(SS_2022_CIPHER);
        // Strict equality: both over- and under-matching are rejected
        if spec.support_ss2022 != is_ss2022 {
            return true;
        }
    }

    if let Some(keywords) = &spec.keywords {
        let name_lower = server.name.to_lowercase();
        let matched = keywords.iter().any(|keyword| {
            name_lower.contains(&keyword.to_lowercase()) || server.tags.iter().any(|t| t == keyword)
        });
        if !matched {
            return true;
        }
    }

    if let Some(region) = &spec.region {
        if region.contains(CHINA_MARKER) {
            let region_lower = region.to_lowercase();
            for rule in &server.excludes {
                for needle in normalize_exclude_rule(rule) {
                    if region_lower.contains(&needle.to_lowercase()) {
                        return true;
                    }
                }
            }
        }
    }

    false
}
