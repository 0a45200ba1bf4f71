use std::fmt;

/// Grouping key for an upstream: scheme+host+port, or a symbolic variable kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpstreamKey {
    Address {
        scheme: String,
        host: String,
        port: u16,
    },
    Symbolic(String),
}

impl UpstreamKey {
    /// Normalize a `proxy_pass` target. Paths, queries and trailing slashes never
    /// affect the key.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with('$') {
            let end = raw.find('/').unwrap_or(raw.len());
            return UpstreamKey::Symbolic(raw[..end].to_string());
        }
        let Some((scheme, rest)) = raw.split_once("://") else {
            return UpstreamKey::Symbolic(raw.to_string());
        };
        let scheme = scheme.to_ascii_lowercase();
        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        if authority.contains('$') || authority.is_empty() {
            return UpstreamKey::Symbolic(format!("{scheme}://{authority}"));
        }
        let (host, port) = split_host_port(authority);
        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(port) => port,
                Err(_) => return UpstreamKey::Symbolic(format!("{scheme}://{authority}")),
            },
            None => match default_port(&scheme) {
                Some(port) => port,
                None => return UpstreamKey::Symbolic(format!("{scheme}://{authority}")),
            },
        };
        UpstreamKey::Address {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, UpstreamKey::Symbolic(_))
    }
}

impl fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamKey::Address { scheme, host, port } => write!(f, "{scheme}://{host}:{port}"),
            UpstreamKey::Symbolic(literal) => f.write_str(literal),
        }
    }
}

fn split_host_port(authority: &str) -> (&str, Option<&str>) {
    // strip userinfo
    let authority = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':');
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "grpc" => Some(80),
        "grpcs" => Some(443),
        _ => None,
    }
}

/// Number of non-empty path segments, ignoring regex anchors.
pub fn path_depth(route: &str) -> usize {
    route
        .trim_start_matches('^')
        .trim_end_matches('$')
        .split('/')
        .filter(|seg| !seg.is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_keys_ignore_path_and_default_port() {
        assert_eq!(
            UpstreamKey::normalize("http://svc:3000/app/").to_string(),
            "http://svc:3000"
        );
        assert_eq!(
            UpstreamKey::normalize("http://SVC:3000").to_string(),
            "http://svc:3000"
        );
        assert_eq!(UpstreamKey::normalize("http://svc").to_string(), "http://svc:80");
        assert_eq!(
            UpstreamKey::normalize("https://svc/").to_string(),
            "https://svc:443"
        );
        assert_eq!(
            UpstreamKey::normalize("http://[::1]:8080/x").to_string(),
            "http://::1:8080"
        );
    }

    #[test]
    fn variables_are_symbolic_literals() {
        let key = UpstreamKey::normalize("$app_upstream/api/");
        assert_eq!(key, UpstreamKey::Symbolic("$app_upstream".into()));
        assert!(key.is_symbolic());
        assert_eq!(
            UpstreamKey::normalize("http://$backend:3000/").to_string(),
            "http://$backend:3000"
        );
        assert!(UpstreamKey::normalize("unix:/tmp/app.sock").is_symbolic());
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/app/"), 1);
        assert_eq!(path_depth("/app"), 1);
        assert_eq!(path_depth("/app/api/v1/"), 3);
        assert_eq!(path_depth("^/app/(.*)$"), 2);
    }
}
