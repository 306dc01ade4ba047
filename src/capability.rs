use crate::types::Capability;
use regex::Regex;
use std::sync::LazyLock;

/// Minimum client version that ships working Hysteria2 support. Names are
/// matched case-insensitively as substrings of the client flag.
const HY2_MIN_CLIENT_VERSIONS: &[(&str, &str)] = &[
    ("NekoBox", "1.2.7"),
    ("sing-box", "1.5.0"),
    ("stash", "2.5.0"),
    ("Shadowrocket", "1993"),
    ("ClashMetaForAndroid", "2.9.0"),
    ("Nekoray", "3.24"),
    ("verge", "1.3.8"),
    ("ClashX Meta", "1.3.5"),
    ("Hiddify", "0.1.0"),
    ("loon", "637"),
    ("v2rayng", "1.9.5"),
    ("v2rayN", "6.31"),
    ("surge", "2398"),
];

// First "/v1.2.3"-style occurrence; clients conventionally send
// "name/version" user agents.
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/v?(\d+(?:\.\d+){0,2})").expect("version regex"));

// A comparable version starts with digits, optionally dotted.
static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+){0,2}").expect("numeric regex"));

/// Parse the client flag (explicit parameter or user-agent) into a
/// capability report.
///
/// A flag without an extractable version is assumed to support HY2: the
/// permissive fallback deliberately admits unrecognized clients.
pub fn detect(flag: &str) -> Capability {
    let version = VERSION_RE
        .captures(flag)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let supports_hy2 = match &version {
        None => true,
        Some(version) => {
            let flag_lower = flag.to_lowercase();
            HY2_MIN_CLIENT_VERSIONS.iter().any(|(client, minimum)| {
                flag_lower.contains(&client.to_lowercase())
                    && version_at_least(version, minimum)
            })
        }
    };

    Capability {
        version,
        supports_hy2,
    }
}

/// Dotted numeric comparison: segments left to right, missing trailing
/// segments read as 0. Malformed input on either side compares as
/// unsupported.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    if !NUMERIC_RE.is_match(version) || !NUMERIC_RE.is_match(minimum) {
        return false;
    }

    let a: Vec<u64> = version.split('.').map(leading_number).collect();
    let b: Vec<u64> = minimum.split('.').map(leading_number).collect();

    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        if left != right {
            return left > right;
        }
    }

    true
}

fn leading_number(segment: &str) -> u64 {
    let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_at_least_basics() {
        assert!(version_at_least("1.5.0", "1.5.0"));
        assert!(version_at_least("1.5.1", "1.5.0"));
        assert!(version_at_least("2", "1.9.9"));
        assert!(!version_at_least("1.4.9", "1.5.0"));
        assert!(!version_at_least("1.4", "1.5.0"));
    }

    #[test]
    fn test_version_missing_segments_read_as_zero() {
        assert!(version_at_least("1.5", "1.5.0"));
        assert!(version_at_least("1.5.0", "1.5"));
        assert!(!version_at_least("1", "1.0.1"));
    }

    #[test]
    fn test_version_reflexive() {
        for v in ["1", "1.2", "1.2.3", "1993", "0.1.0"] {
            assert!(version_at_least(v, v), "{} >= {} should hold", v, v);
        }
    }

    #[test]
    fn test_malformed_version_fails_closed() {
        assert!(!version_at_least("abc", "1.0.0"));
        assert!(!version_at_least("1.0.0", "abc"));
        assert!(!version_at_least(".5", "0.1"));
    }

    #[test]
    fn test_detect_extracts_version() {
        let cap = detect("sing-box/1.8.0");
        assert_eq!(cap.version.as_deref(), Some("1.8.0"));
        assert!(cap.supports_hy2);

        let cap = detect("NekoBox/v1.2.7");
        assert_eq!(cap.version.as_deref(), Some("1.2.7"));
        assert!(cap.supports_hy2);
    }

    #[test]
    fn test_detect_below_minimum() {
        let cap = detect("sing-box/1.4.9");
        assert!(!cap.supports_hy2);

        let cap = detect("v2rayng/1.9.4");
        assert!(!cap.supports_hy2);
    }

    #[test]
    fn test_detect_unknown_client_with_version() {
        // Version present but no known client name matches
        let cap = detect("some-new-client/9.9.9");
        assert_eq!(cap.version.as_deref(), Some("9.9.9"));
        assert!(!cap.supports_hy2);
    }

    #[test]
    fn test_detect_no_version_is_permissive() {
        let cap = detect("curl");
        assert_eq!(cap.version, None);
        assert!(cap.supports_hy2);

        let cap = detect("");
        assert!(cap.supports_hy2);
    }

    #[test]
    fn test_detect_case_insensitive_client_match() {
        let cap = detect("shadowrocket/2000");
        assert_eq!(cap.version.as_deref(), Some("2000"));
        assert!(cap.supports_hy2);

        let cap = detect("SHADOWROCKET/1500");
        assert!(!cap.supports_hy2);
    }
}
