//! Access-control list: decides whether a request's literal destination should bypass
//! the relay (direct, plaintext) or go through it encrypted.
//!
//! Grounded in the teacher's `forbidden_ip`/ACL handling, generalized to a bypass table
//! the way the real project's ACL files work: an IPv4 (and CIDR) table plus a domain
//! suffix table. IPv6 lookups are deliberately not performed, per the spec.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;

#[derive(Debug, thiserror::Error)]
pub enum AclError {
    #[error("failed to read ACL file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("invalid ACL entry on line {0}: {1}")]
    InvalidEntry(usize, String),
}

/// A loaded bypass table. Construction is the only fallible step; lookups are pure and
/// infallible.
#[derive(Debug, Default, Clone)]
pub struct Acl {
    ipv4_nets: Vec<Ipv4Net>,
    domains: Vec<String>,
}

impl Acl {
    pub fn load(path: impl AsRef<Path>) -> Result<Acl, AclError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| AclError::Read(path.to_owned(), e))?;
        Acl::parse(&text)
    }

    /// One entry per line; blank lines and `#`-comments are skipped. An entry is either
    /// an IPv4 literal/CIDR (`1.2.3.0/24`) or a domain suffix (`example.com`, matching
    /// `example.com` and any subdomain of it).
    pub fn parse(text: &str) -> Result<Acl, AclError> {
        let mut acl = Acl::default();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }

            if let Ok(net) = line.parse::<Ipv4Net>() {
                acl.ipv4_nets.push(net);
            } else if let Ok(ip) = line.parse::<Ipv4Addr>() {
                acl.ipv4_nets.push(Ipv4Net::new(ip, 32).expect("/32 is always a valid prefix length"));
            } else if is_plausible_domain(line) {
                acl.domains.push(line.to_lowercase());
            } else {
                return Err(AclError::InvalidEntry(lineno + 1, line.to_owned()));
            }
        }

        Ok(acl)
    }

    pub fn bypass_ipv4(&self, ip: Ipv4Addr) -> bool {
        self.ipv4_nets.iter().any(|net| net.contains(&ip))
    }

    /// Matches `domain` against every configured suffix: `example.com` bypasses both
    /// `example.com` and `www.example.com`.
    pub fn bypass_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.domains.iter().any(|suffix| domain == *suffix || domain.ends_with(&format!(".{suffix}")))
    }
}

fn is_plausible_domain(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypasses_exact_domain_match() {
        let acl = Acl::parse("example.com\n").unwrap();
        assert!(acl.bypass_domain("example.com"));
        assert!(acl.bypass_domain("EXAMPLE.COM"));
    }

    #[test]
    fn bypasses_subdomain_of_configured_suffix() {
        let acl = Acl::parse("example.com\n").unwrap();
        assert!(acl.bypass_domain("www.example.com"));
        assert!(!acl.bypass_domain("notexample.com"));
        assert!(!acl.bypass_domain("example.org"));
    }

    #[test]
    fn bypasses_ipv4_literal_and_cidr() {
        let acl = Acl::parse("10.0.0.1\n192.168.0.0/16\n").unwrap();
        assert!(acl.bypass_ipv4("10.0.0.1".parse().unwrap()));
        assert!(!acl.bypass_ipv4("10.0.0.2".parse().unwrap()));
        assert!(acl.bypass_ipv4("192.168.5.5".parse().unwrap()));
    }

    #[test]
    fn ignores_comments_and_section_headers() {
        let acl = Acl::parse("# comment\n[bypass_list]\nexample.com\n").unwrap();
        assert!(acl.bypass_domain("example.com"));
    }

    #[test]
    fn rejects_garbage_entry() {
        let err = Acl::parse("not a valid entry!!\n").unwrap_err();
        assert!(matches!(err, AclError::InvalidEntry(1, _)));
    }
}
