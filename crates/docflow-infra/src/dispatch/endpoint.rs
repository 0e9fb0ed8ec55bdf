//! Outbound URL checks for processing endpoints.
//!
//! A job carries a signed link to tenant data, so it must never be posted to
//! an internal host unless the deployment opts in.

use std::net::{IpAddr, Ipv6Addr};
use thiserror::Error;
use tokio::net::lookup_host;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("Endpoint URL must use http or https")]
    Scheme,

    #[error("Invalid endpoint URL: {0}")]
    Malformed(String),

    #[error("Endpoint URL has no host")]
    MissingHost,

    #[error("Endpoint host '{0}' is internal")]
    InternalHost(String),

    #[error("Endpoint address {0} is private")]
    PrivateAddress(IpAddr),

    #[error("Endpoint host '{host}' could not be resolved: {reason}")]
    Unresolvable { host: String, reason: String },
}

/// Check a processing endpoint before posting a job to it.
///
/// Only the scheme and URL shape are checked when `allow_private` is set.
/// Otherwise literal private addresses, internal hostnames and hostnames
/// resolving to private addresses are rejected.
pub async fn validate_endpoint(url: &str, allow_private: bool) -> Result<reqwest::Url, EndpointError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| EndpointError::Malformed(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(EndpointError::Scheme);
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or(EndpointError::MissingHost)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();

    if allow_private {
        return Ok(parsed);
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(EndpointError::PrivateAddress(ip));
        }
        return Ok(parsed);
    }

    if is_internal_hostname(&host) {
        return Err(EndpointError::InternalHost(host));
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = lookup_host((host.as_str(), port)).await.map_err(|e| {
        tracing::warn!(host = %host, error = %e, "DNS resolution failed for endpoint check");
        EndpointError::Unresolvable {
            host: host.clone(),
            reason: e.to_string(),
        }
    })?;

    for addr in addrs {
        if is_private_ip(&addr.ip()) {
            return Err(EndpointError::PrivateAddress(addr.ip()));
        }
    }

    Ok(parsed)
}

fn is_internal_hostname(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
        || host.ends_with(".corp")
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 10
                || a == 127
                || a == 0
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
                || (a == 100 && (64..=127).contains(&b))
                || (224..=239).contains(&a)
        }
        IpAddr::V6(v6) => {
            // ::ffff:a.b.c.d is checked as the IPv4 address it maps.
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_ipv6_link_local(v6)
                || is_ipv6_unique_local(v6)
        }
    }
}

fn is_ipv6_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

fn is_ipv6_unique_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        for url in ["ftp://engine.example.com/", "file:///etc/passwd", "javascript:alert(1)"] {
            assert_eq!(validate_endpoint(url, false).await, Err(EndpointError::Scheme));
        }
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(matches!(
            validate_endpoint("not a url", false).await,
            Err(EndpointError::Malformed(_))
        ));
        assert!(validate_endpoint("", false).await.is_err());
    }

    #[tokio::test]
    async fn rejects_private_literals() {
        for url in [
            "http://127.0.0.1:3000/jobs",
            "http://10.1.2.3/",
            "http://172.20.0.5/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://[::ffff:10.0.0.1]/",
            "http://[fd00::1]/",
        ] {
            assert!(
                matches!(
                    validate_endpoint(url, false).await,
                    Err(EndpointError::PrivateAddress(_))
                ),
                "{} should be rejected",
                url
            );
        }
    }

    #[tokio::test]
    async fn rejects_internal_hostnames() {
        for url in [
            "http://localhost/",
            "https://engine.internal/jobs",
            "http://nas.local/",
            "http://build.corp/",
        ] {
            assert!(matches!(
                validate_endpoint(url, false).await,
                Err(EndpointError::InternalHost(_))
            ));
        }
    }

    #[tokio::test]
    async fn accepts_public_literal() {
        assert!(validate_endpoint("https://8.8.8.8/jobs", false).await.is_ok());
    }

    #[tokio::test]
    async fn private_allowed_when_opted_in() {
        let url = validate_endpoint("http://127.0.0.1:8081/jobs", true).await.unwrap();
        assert_eq!(url.port(), Some(8081));
        // The scheme check still applies.
        assert_eq!(
            validate_endpoint("ftp://127.0.0.1/", true).await,
            Err(EndpointError::Scheme)
        );
    }
}
