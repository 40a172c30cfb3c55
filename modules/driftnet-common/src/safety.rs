use std::net::IpAddr;

use url::{Host, Url};

use crate::error::{DriftnetError, Result};

/// The SSRF gate. One implementation is the single source of truth for
/// add-time, update-time, and fetch-time (per-redirect-hop) validation,
/// so tests can swap it wholesale.
pub trait UrlGuard: Send + Sync {
    fn check(&self, url: &Url) -> Result<()>;
}

/// Default guard: http/https only, public hosts only.
pub struct PublicHttpGuard;

impl UrlGuard for PublicHttpGuard {
    fn check(&self, url: &Url) -> Result<()> {
        check_public_http_url(url)
    }
}

/// Guard that accepts any URL. For tests and trusted closed networks.
pub struct AllowAllGuard;

impl UrlGuard for AllowAllGuard {
    fn check(&self, _url: &Url) -> Result<()> {
        Ok(())
    }
}

/// Reject URLs that could reach internal infrastructure: non-http(s)
/// schemes, loopback, private and link-local ranges, and the cloud
/// metadata endpoints. Pure function of the parsed URL, no DNS.
pub fn check_public_http_url(url: &Url) -> Result<()> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(DriftnetError::InvalidInput(format!(
            "scheme '{scheme}' is not allowed"
        )));
    }

    match url.host() {
        None => Err(DriftnetError::InvalidInput("URL has no host".into())),
        Some(Host::Domain(domain)) => check_domain(domain),
        Some(Host::Ipv4(ip)) => check_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => check_ip(IpAddr::V6(ip)),
    }
}

fn check_domain(domain: &str) -> Result<()> {
    let lower = domain.trim_end_matches('.').to_ascii_lowercase();
    if lower == "localhost"
        || lower == "metadata.google.internal"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(DriftnetError::InvalidInput(format!(
            "host '{domain}' resolves inside the private perimeter"
        )));
    }
    Ok(())
}

fn check_ip(ip: IpAddr) -> Result<()> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return check_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    };

    if blocked {
        return Err(DriftnetError::InvalidInput(format!(
            "address {ip} is not publicly routable"
        )));
    }
    Ok(())
}

/// Validate a document source path. Rejects traversal in both the raw and
/// percent-decoded forms, and embedded NULs.
pub fn check_document_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(DriftnetError::InvalidInput("empty document path".into()));
    }

    let decoded = percent_decode(path);
    for candidate in [path, decoded.as_str()] {
        if candidate.contains('\0') {
            return Err(DriftnetError::InvalidInput(
                "document path contains a NUL byte".into(),
            ));
        }
        let has_traversal = candidate
            .split(['/', '\\'])
            .any(|component| component == "..");
        if has_traversal {
            return Err(DriftnetError::InvalidInput(format!(
                "document path '{path}' traverses outside its root"
            )));
        }
    }
    Ok(())
}

/// Minimal %XX decoder. Invalid escapes pass through untouched so the raw
/// form still gets inspected.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(raw: &str) -> Result<()> {
        check_public_http_url(&Url::parse(raw).unwrap())
    }

    #[test]
    fn public_hosts_pass() {
        assert!(check("https://example.com").is_ok());
        assert!(check("http://93.184.216.34/page").is_ok());
    }

    #[test]
    fn cloud_metadata_blocked() {
        assert!(check("http://169.254.169.254/latest/meta-data/").is_err());
        assert!(check("http://metadata.google.internal/computeMetadata/v1/").is_err());
    }

    #[test]
    fn loopback_and_private_blocked() {
        assert!(check("http://127.0.0.1:8080/").is_err());
        assert!(check("http://localhost/admin").is_err());
        assert!(check("http://10.0.0.5/").is_err());
        assert!(check("http://172.16.3.9/").is_err());
        assert!(check("http://192.168.1.1/").is_err());
        assert!(check("http://100.64.0.1/").is_err());
        assert!(check("http://[::1]/").is_err());
        assert!(check("http://[fd00::1]/").is_err());
        assert!(check("http://[::ffff:127.0.0.1]/").is_err());
    }

    #[test]
    fn non_http_schemes_blocked() {
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(check_public_http_url(&url).is_err());
        let url = Url::parse("ftp://example.com/x").unwrap();
        assert!(check_public_http_url(&url).is_err());
    }

    #[test]
    fn internal_suffixes_blocked() {
        assert!(check("http://db.internal/").is_err());
        assert!(check("http://printer.local/").is_err());
    }

    #[test]
    fn document_traversal_blocked() {
        assert!(check_document_path("../etc/passwd").is_err());
        assert!(check_document_path("docs/../../secret.txt").is_err());
        assert!(check_document_path("docs/%2e%2e/secret.txt").is_err());
        assert!(check_document_path("docs\\..\\secret.txt").is_err());
        assert!(check_document_path("").is_err());
    }

    #[test]
    fn plain_document_paths_pass() {
        assert!(check_document_path("reports/q3.pdf").is_ok());
        assert!(check_document_path("/data/docs/notes.txt").is_ok());
        assert!(check_document_path("weird..name.txt").is_ok());
    }
}
