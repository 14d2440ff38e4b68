//! Hostname canonicalization shared by the `Store`'s known-hosts table (spec.md §4.4/§6): every
//! hostname used as a known-hosts key is canonicalized once, here, before it ever reaches a
//! store implementation.

/// Strip a trailing `:port`, then unbracket an IPv6 literal if present.
///
/// `host:22` -> `host`; `[::1]:22` -> `::1`; `example.com` is returned unchanged.
pub fn canonicalize_hostname(host: &str) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
        return rest.to_string();
    }
    match host.rsplit_once(':') {
        Some((hostname, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            hostname.to_string()
        }
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_from_plain_hostname() {
        assert_eq!(canonicalize_hostname("example.com:22"), "example.com");
    }

    #[test]
    fn unbrackets_ipv6_with_port() {
        assert_eq!(canonicalize_hostname("[::1]:22"), "::1");
    }

    #[test]
    fn unbrackets_ipv6_without_port() {
        assert_eq!(canonicalize_hostname("[::1]"), "::1");
    }

    #[test]
    fn leaves_plain_hostname_alone() {
        assert_eq!(canonicalize_hostname("example.com"), "example.com");
    }
}
