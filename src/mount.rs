//! URL patterns and the mount table.
//!
//! A client carries an ordered list of mounts: URL patterns, each bound to
//! a transport. Before dispatch the client selects the first matching
//! mount, falling back to the default transport. Proxies are attached this
//! way: each proxy is a transport mounted on the pattern it intercepts.

use url::Url;

use crate::error::Error;

/// A pattern matching URLs on scheme and host.
///
/// Forms: `"http://"` (every plain-HTTP URL), `"all://"` (everything),
/// `"all://example.com"`, `"https://*.example.com"` (subdomains only),
/// `"all://example.com:8080"` (port-qualified).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Pattern {
    scheme: Option<String>,
    host: HostPattern,
    port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum HostPattern {
    Any,
    Exact(String),
    /// `*.example.com`: any subdomain, not the bare domain.
    Suffix(String),
}

impl Pattern {
    pub(crate) fn parse(pattern: &str) -> crate::Result<Pattern> {
        let (scheme, rest) = pattern
            .split_once("://")
            .ok_or_else(|| Error::builder(format!("invalid mount pattern: {pattern:?}")))?;

        let scheme = match scheme {
            "all" | "" => None,
            "http" | "https" => Some(scheme.to_owned()),
            other => {
                return Err(Error::builder(format!(
                    "unsupported scheme in mount pattern: {other:?}"
                )))
            }
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::builder(format!("invalid port in pattern: {pattern:?}")))?;
                (host, Some(port))
            }
            _ => (rest, None),
        };

        let host = if host.is_empty() || host == "*" {
            HostPattern::Any
        } else if let Some(suffix) = host.strip_prefix("*.") {
            HostPattern::Suffix(format!(".{suffix}"))
        } else {
            HostPattern::Exact(host.to_ascii_lowercase())
        };

        Ok(Pattern { scheme, host, port })
    }

    pub(crate) fn matches(&self, url: &Url) -> bool {
        if let Some(scheme) = &self.scheme {
            if url.scheme() != scheme {
                return false;
            }
        }
        if let Some(port) = self.port {
            if url.port_or_known_default() != Some(port) {
                return false;
            }
        }
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        };
        match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(exact) => &host == exact,
            HostPattern::Suffix(suffix) => host.ends_with(suffix.as_str()),
        }
    }

    /// Sort key, most specific first: port-qualified patterns beat
    /// unqualified ones, longer hostnames beat shorter, and a concrete
    /// scheme beats `all`.
    pub(crate) fn priority(&self) -> (u8, usize, usize) {
        let port = u8::from(self.port.is_some());
        let host = match &self.host {
            HostPattern::Any => 0,
            HostPattern::Exact(host) => host.len(),
            HostPattern::Suffix(suffix) => suffix.len(),
        };
        let scheme = self.scheme.as_ref().map_or(0, String::len);
        (port, host, scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn scheme_only_patterns() {
        let p = Pattern::parse("http://").unwrap();
        assert!(p.matches(&url("http://example.com/")));
        assert!(!p.matches(&url("https://example.com/")));

        let all = Pattern::parse("all://").unwrap();
        assert!(all.matches(&url("http://example.com/")));
        assert!(all.matches(&url("https://example.com/")));
    }

    #[test]
    fn host_patterns() {
        let exact = Pattern::parse("all://example.com").unwrap();
        assert!(exact.matches(&url("http://example.com/")));
        assert!(exact.matches(&url("http://EXAMPLE.com/")));
        assert!(!exact.matches(&url("http://www.example.com/")));

        let wild = Pattern::parse("all://*.example.com").unwrap();
        assert!(wild.matches(&url("http://www.example.com/")));
        assert!(!wild.matches(&url("http://example.com/")));
        assert!(!wild.matches(&url("http://example.org/")));
    }

    #[test]
    fn port_patterns() {
        let p = Pattern::parse("all://example.com:8080").unwrap();
        assert!(p.matches(&url("http://example.com:8080/")));
        assert!(!p.matches(&url("http://example.com/")));

        // Default ports count as qualified.
        let p = Pattern::parse("http://example.com:80").unwrap();
        assert!(p.matches(&url("http://example.com/")));
    }

    #[test]
    fn priority_ordering() {
        let port = Pattern::parse("all://example.com:8080").unwrap();
        let host = Pattern::parse("all://subdomain.example.com").unwrap();
        let short = Pattern::parse("all://example.com").unwrap();
        let scheme = Pattern::parse("https://").unwrap();
        let any = Pattern::parse("all://").unwrap();

        let mut patterns = vec![&any, &scheme, &short, &host, &port];
        patterns.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        assert_eq!(patterns, vec![&port, &host, &short, &scheme, &any]);
    }

    #[test]
    fn invalid_patterns() {
        assert!(Pattern::parse("example.com").is_err());
        assert!(Pattern::parse("ftp://example.com").is_err());
        assert!(Pattern::parse("all://example.com:notaport").is_err());
    }
}
