use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a source URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a loopback, private or link-local address.
    #[error("Private address not allowed: {0} (set allow_private_hosts to permit)")]
    PrivateHost(String),
}

/// Validates a configured source URL.
///
/// Only `http` and `https` URLs with a host are accepted. Unless
/// `allow_private` is set, `localhost` and loopback, private (RFC 1918),
/// link-local and unique-local addresses are rejected as well.
///
/// # Examples
///
/// ```
/// use skimd::util::validate_source_url;
///
/// let url = validate_source_url("https://example.com/feed.xml", false).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_source_url("file:///etc/passwd", true).is_err());
/// assert!(validate_source_url("http://192.168.1.1/feed", false).is_err());
/// assert!(validate_source_url("http://192.168.1.1/feed", true).is_ok());
/// ```
pub fn validate_source_url(url_str: &str, allow_private: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if allow_private {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::PrivateHost(host.to_owned()));
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateHost(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_source_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_source_url("http://news.example.org", false).is_ok());
        assert!(validate_source_url("https://example.com:8443/feed.xml", false).is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_source_url("ftp://example.com", true),
            Err(UrlValidationError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(validate_source_url("file:///etc/passwd", true).is_err());
    }

    #[test]
    fn test_unparseable() {
        assert!(matches!(
            validate_source_url("not a url", true),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_private_hosts_rejected_by_default() {
        for url in [
            "http://localhost/feed",
            "http://127.0.0.1/feed",
            "http://10.0.0.1:3000/feed",
            "http://172.16.0.1/feed",
            "http://169.254.1.1/feed",
            "http://0.0.0.0/feed",
            "http://[::1]/feed",
            "http://[fe80::1]/feed",
        ] {
            assert!(
                matches!(validate_source_url(url, false), Err(UrlValidationError::PrivateHost(_))),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_private_hosts_allowed_when_opted_in() {
        assert!(validate_source_url("http://localhost:8080/feed", true).is_ok());
        assert!(validate_source_url("http://[::1]/feed", true).is_ok());
    }
}
