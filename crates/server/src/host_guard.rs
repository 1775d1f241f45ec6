//! SSRF protection: refuses any SSH target that resolves to a private,
//! loopback, link-local, broadcast, or cloud-metadata address, and
//! defeats numeric-form obfuscation and DNS rebinding.
//!
//! The only address this crate ever dials is the one this module
//! returns — callers must never re-resolve the original hostname (I6,
//! P5). Resolution uses two independent methods (the OS resolver and a
//! dedicated `hickory-resolver` client) so a rebinding attacker who
//! controls only one of them is caught by the disjoint-results check.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use ipnetwork::{Ipv4Network, Ipv6Network};

const CLOUD_METADATA_HOSTS: &[&str] = &[
    "metadata.google.internal",
    "metadata.azure.com",
    "169.254.169.254",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostGuardError {
    #[error("target is a private or reserved address literal")]
    PrivateLiteral,
    #[error("target hostname is on the blocked-name list")]
    BlockedName,
    #[error("target hostname embeds a private address")]
    EmbeddedPrivate,
    #[error("DNS resolution failed via every method")]
    ResolutionFailed,
    #[error("target resolved to a private or reserved address")]
    ResolvedToPrivate,
}

/// Resolves and validates a user-supplied SSH target hostname.
pub struct HostGuard {
    resolver: TokioAsyncResolver,
}

impl HostGuard {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Run the full algorithm and return the single address the caller
    /// must dial, or a typed rejection.
    pub async fn check(&self, host: &str) -> Result<IpAddr, HostGuardError> {
        let lower = host.to_ascii_lowercase();
        let lower = lower.trim_end_matches('.');

        // 1. Literal denylist by shape.
        if is_blocked_name(lower) {
            return Err(HostGuardError::BlockedName);
        }

        // 2. Numeric normalization, re-run denylist + range check on the
        //    canonical form.
        match classify_numeric(lower) {
            NumericForm::Canonical(addr) => {
                if is_blocked_name(&addr.to_string()) || is_private_ipv4(addr) {
                    return Err(HostGuardError::PrivateLiteral);
                }
                return Ok(IpAddr::V4(addr));
            }
            NumericForm::Invalid => return Err(HostGuardError::PrivateLiteral),
            NumericForm::NotNumeric => {}
        }

        // 3. Canonical range check, for inputs that are themselves a
        //    plain IP literal (not hidden behind numeric obfuscation).
        if let Ok(literal) = lower.parse::<IpAddr>() {
            if is_private_addr(literal) {
                return Err(HostGuardError::PrivateLiteral);
            }
        }

        // 4. Embedded-IP scan.
        if contains_embedded_private_ip(lower) {
            return Err(HostGuardError::EmbeddedPrivate);
        }

        // 5. Multi-method resolution.
        let (os_addrs, direct_addrs) = self.resolve_multi_method(lower).await?;

        if os_addrs.is_empty() {
            return Err(HostGuardError::ResolutionFailed);
        }

        if !os_addrs.is_empty()
            && !direct_addrs.is_empty()
            && os_addrs.iter().all(|a| !direct_addrs.contains(a))
        {
            tracing::warn!(
                host = lower,
                os = ?os_addrs,
                direct = ?direct_addrs,
                "DNS rebinding suspicion: OS resolver and direct lookups share no address"
            );
            // Reference policy: log and continue.
        }

        // 6. Post-resolution filter.
        for addr in os_addrs.iter().chain(direct_addrs.iter()) {
            if is_private_addr(*addr) {
                return Err(HostGuardError::ResolvedToPrivate);
            }
        }

        // 7. Output: the first OS-resolver address, never the hostname.
        Ok(os_addrs[0])
    }

    async fn resolve_multi_method(
        &self,
        host: &str,
    ) -> Result<(Vec<IpAddr>, Vec<IpAddr>), HostGuardError> {
        let os_addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map(|iter| iter.map(|sa| sa.ip()).collect())
            .unwrap_or_default();

        let mut direct_addrs = Vec::new();
        if let Ok(v4) = self.resolver.ipv4_lookup(host).await {
            direct_addrs.extend(v4.iter().map(|a| IpAddr::V4(a.0)));
        }
        if let Ok(v6) = self.resolver.ipv6_lookup(host).await {
            direct_addrs.extend(v6.iter().map(|a| IpAddr::V6(a.0)));
        }

        Ok((os_addrs, direct_addrs))
    }
}

impl Default for HostGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn is_blocked_name(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    for suffix in [".local", ".internal", ".private"] {
        if host.ends_with(suffix) {
            return true;
        }
    }
    if host.starts_with("fd") || host.starts_with("fc") {
        return true;
    }
    CLOUD_METADATA_HOSTS.contains(&host)
}

fn contains_embedded_private_ip(host: &str) -> bool {
    let parts: Vec<&str> = host.split(|c: char| !c.is_ascii_digit() && c != '.').collect();
    for candidate in parts {
        if let Ok(addr) = candidate.parse::<Ipv4Addr>() {
            if is_private_ipv4(addr) {
                return true;
            }
        }
    }
    false
}

enum NumericForm {
    NotNumeric,
    Canonical(Ipv4Addr),
    Invalid,
}

fn classify_numeric(host: &str) -> NumericForm {
    // Whole-host hex form: 0x7f000001
    if let Some(hex) = host.strip_prefix("0x") {
        if !host.contains('.') {
            return match u32::from_str_radix(hex, 16) {
                Ok(n) => NumericForm::Canonical(Ipv4Addr::from(n)),
                Err(_) => NumericForm::Invalid,
            };
        }
    }

    // Whole-host pure decimal integer: 2130706433
    if !host.is_empty() && !host.contains('.') && host.chars().all(|c| c.is_ascii_digit()) {
        return match host.parse::<u64>() {
            Ok(n) if n <= u32::MAX as u64 => NumericForm::Canonical(Ipv4Addr::from(n as u32)),
            _ => NumericForm::Invalid,
        };
    }

    // Dotted form with an octet carrying a "0x" prefix or a leading zero.
    if host.contains('.') {
        let parts: Vec<&str> = host.split('.').collect();
        let has_special_octet = parts.iter().any(|p| {
            p.starts_with("0x") || (p.len() > 1 && p.starts_with('0') && p.chars().all(|c| c.is_ascii_digit()))
        });
        if has_special_octet {
            if parts.len() != 4 {
                return NumericForm::Invalid;
            }
            let mut octets = [0u8; 4];
            for (i, part) in parts.iter().enumerate() {
                match parse_octet(part) {
                    Ok(v) => octets[i] = v,
                    Err(()) => return NumericForm::Invalid,
                }
            }
            return NumericForm::Canonical(Ipv4Addr::from(octets));
        }
    }

    NumericForm::NotNumeric
}

fn parse_octet(s: &str) -> Result<u8, ()> {
    if let Some(hex) = s.strip_prefix("0x") {
        u8::from_str_radix(hex, 16).map_err(|_| ())
    } else if s.len() > 1 && s.starts_with('0') {
        u8::from_str_radix(s, 8).map_err(|_| ())
    } else {
        s.parse::<u8>().map_err(|_| ())
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    const RANGES: &[&str] = &[
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
    ];
    if ip == Ipv4Addr::UNSPECIFIED || ip == Ipv4Addr::BROADCAST {
        return true;
    }
    RANGES.iter().any(|cidr| {
        cidr.parse::<Ipv4Network>()
            .map(|net| net.contains(ip))
            .unwrap_or(false)
    })
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::LOCALHOST || ip == Ipv6Addr::UNSPECIFIED {
        return true;
    }
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(mapped);
    }
    const RANGES: &[&str] = &["fe80::/10", "fc00::/7"];
    RANGES.iter().any(|cidr| {
        cidr.parse::<Ipv6Network>()
            .map(|net| net.contains(ip))
            .unwrap_or(false)
    })
}

fn is_private_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}
