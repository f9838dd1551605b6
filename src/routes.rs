use crate::error::ConfigError;
use base64::engine::general_purpose;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Protocol spoken by one backend listener.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ProtocolKind {
    Vless,
    Vmess,
    Trojan,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Vless => "vless",
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Trojan => "trojan",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(ProtocolKind::Vless),
            "vmess" => Ok(ProtocolKind::Vmess),
            "trojan" => Ok(ProtocolKind::Trojan),
            other => Err(format!("unknown protocol kind {other:?}")),
        }
    }
}

/// Route as written on the command line: `kind:path:port`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteSpec {
    pub kind: ProtocolKind,
    pub path: String,
    pub backend_port: u16,
}

impl FromStr for RouteSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let kind = parts.next().unwrap_or("").parse::<ProtocolKind>()?;
        let path = parts.next().unwrap_or("").to_string();
        let port = parts
            .next()
            .ok_or_else(|| format!("route {s:?} is missing a port, expected kind:path:port"))?
            .parse::<u16>()
            .map_err(|e| format!("route {s:?} has an invalid port: {e}"))?;
        Ok(Self {
            kind,
            path,
            backend_port: port,
        })
    }
}

/// One inbound path bound to one loopback backend listener.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteEntry {
    pub path: String,
    pub backend_port: u16,
    pub kind: ProtocolKind,
    pub client_id: String,
}

impl RouteEntry {
    pub fn backend_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.backend_port))
    }

    /// `path` matches itself and anything below it on a `/` boundary.
    fn matches(&self, request_path: &str) -> bool {
        if self.path == "/" {
            return true;
        }
        match request_path.strip_prefix(self.path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Immutable path → backend mapping shared by every component.
#[derive(Clone, Debug)]
pub struct RouteTable {
    // Longest path first so the first match is the most specific one.
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Result<Self, ConfigError> {
        let mut paths = HashSet::new();
        let mut ports = HashSet::new();

        for entry in &entries {
            if !entry.path.starts_with('/') {
                return Err(ConfigError::InvalidRoute(
                    entry.path.clone(),
                    "path must start with '/'".to_string(),
                ));
            }
            if entry.path.len() > 1 && entry.path.ends_with('/') {
                return Err(ConfigError::InvalidRoute(
                    entry.path.clone(),
                    "path must not end with '/'".to_string(),
                ));
            }
            if entry.backend_port == 0 {
                return Err(ConfigError::InvalidRoute(
                    entry.path.clone(),
                    "backend port must be 1-65535".to_string(),
                ));
            }
            if entry.client_id.is_empty() {
                return Err(ConfigError::InvalidRoute(
                    entry.path.clone(),
                    "client id is empty".to_string(),
                ));
            }
            if !paths.insert(entry.path.as_str()) {
                return Err(ConfigError::DuplicatePath(entry.path.clone()));
            }
            if !ports.insert(entry.backend_port) {
                return Err(ConfigError::DuplicatePort(entry.backend_port));
            }
        }

        let mut entries = entries;
        entries.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));
        Ok(Self { entries })
    }

    /// Build a table from CLI route specs that all share one credential.
    pub fn from_specs(specs: &[RouteSpec], client_id: &str) -> Result<Self, ConfigError> {
        let entries = specs
            .iter()
            .map(|spec| RouteEntry {
                path: spec.path.clone(),
                backend_port: spec.backend_port,
                kind: spec.kind,
                client_id: client_id.to_string(),
            })
            .collect();
        Self::new(entries)
    }

    /// Most specific route for a request path (query string excluded).
    pub fn lookup(&self, request_path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.matches(request_path))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn backend_addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(RouteEntry::backend_addr).collect()
    }

    /// Client connection URIs for every route, as `(kind, uri)` pairs.
    pub fn share_links(&self, target: &ShareTarget) -> Vec<(ProtocolKind, String)> {
        let mut links: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.kind, share_link(entry, target)))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        links
    }
}

/// Public endpoint a client dials to reach the router.
#[derive(Clone, Debug)]
pub struct ShareTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub node_name: String,
}

#[derive(serde::Serialize)]
struct VmessLink<'a> {
    v: &'static str,
    ps: &'a str,
    add: &'a str,
    port: String,
    id: &'a str,
    aid: &'static str,
    scy: &'static str,
    net: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    host: &'a str,
    path: &'a str,
    tls: &'static str,
    sni: &'a str,
}

fn share_link(entry: &RouteEntry, target: &ShareTarget) -> String {
    let security = if target.tls { "tls" } else { "none" };
    let name = utf8_percent_encode(&target.node_name, LINK_COMPONENT);
    let path = utf8_percent_encode(&entry.path, LINK_COMPONENT);
    let host = &target.host;
    match entry.kind {
        ProtocolKind::Vless => format!(
            "vless://{}@{}:{}?encryption=none&security={}&sni={}&type=ws&host={}&path={}#{}",
            entry.client_id, host, target.port, security, host, host, path, name
        ),
        ProtocolKind::Trojan => format!(
            "trojan://{}@{}:{}?security={}&sni={}&type=ws&host={}&path={}#{}",
            utf8_percent_encode(&entry.client_id, LINK_COMPONENT),
            host,
            target.port,
            security,
            host,
            host,
            path,
            name
        ),
        ProtocolKind::Vmess => {
            let link = VmessLink {
                v: "2",
                ps: &target.node_name,
                add: host,
                port: target.port.to_string(),
                id: &entry.client_id,
                aid: "0",
                scy: "auto",
                net: "ws",
                kind: "none",
                host,
                path: &entry.path,
                tls: if target.tls { "tls" } else { "" },
                sni: host,
            };
            // Serializing a struct of strings cannot fail.
            let json = serde_json::to_string(&link).unwrap_or_default();
            format!("vmess://{}", general_purpose::STANDARD.encode(json))
        }
    }
}

/// Everything outside the RFC 3986 unreserved set.
const LINK_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, port: u16, kind: ProtocolKind) -> RouteEntry {
        RouteEntry {
            path: path.to_string(),
            backend_port: port,
            kind,
            client_id: "abc".to_string(),
        }
    }

    #[test]
    fn longest_prefix_wins_regardless_of_order() {
        let table = RouteTable::new(vec![
            entry("/v", 10000, ProtocolKind::Vmess),
            entry("/vless", 10001, ProtocolKind::Vless),
        ])
        .unwrap();

        assert_eq!(table.lookup("/vless").unwrap().backend_port, 10001);
        assert_eq!(table.lookup("/vless/deep").unwrap().backend_port, 10001);
        assert_eq!(table.lookup("/v").unwrap().backend_port, 10000);
        assert_eq!(table.lookup("/v/x").unwrap().backend_port, 10000);
        // "/vx" is not below "/v" on a segment boundary
        assert!(table.lookup("/vx").is_none());
        assert!(table.lookup("/other").is_none());
    }

    #[test]
    fn root_route_catches_everything_else() {
        let table = RouteTable::new(vec![
            entry("/", 10000, ProtocolKind::Vless),
            entry("/ws", 10001, ProtocolKind::Vmess),
        ])
        .unwrap();
        assert_eq!(table.lookup("/ws").unwrap().backend_port, 10001);
        assert_eq!(table.lookup("/anything").unwrap().backend_port, 10000);
    }

    #[test]
    fn rejects_duplicate_paths_and_ports() {
        let dup_path = RouteTable::new(vec![
            entry("/a", 10000, ProtocolKind::Vless),
            entry("/a", 10001, ProtocolKind::Vmess),
        ]);
        assert!(matches!(dup_path, Err(ConfigError::DuplicatePath(p)) if p == "/a"));

        let dup_port = RouteTable::new(vec![
            entry("/a", 10000, ProtocolKind::Vless),
            entry("/b", 10000, ProtocolKind::Vmess),
        ]);
        assert!(matches!(dup_port, Err(ConfigError::DuplicatePort(10000))));
    }

    #[test]
    fn rejects_relative_paths_and_zero_ports() {
        assert!(RouteTable::new(vec![entry("up", 10000, ProtocolKind::Vless)]).is_err());
        assert!(RouteTable::new(vec![entry("/up/", 10000, ProtocolKind::Vless)]).is_err());
        assert!(RouteTable::new(vec![entry("/up", 0, ProtocolKind::Vless)]).is_err());
    }

    #[test]
    fn parses_route_specs() {
        let spec: RouteSpec = "vless:/up:10000".parse().unwrap();
        assert_eq!(
            spec,
            RouteSpec {
                kind: ProtocolKind::Vless,
                path: "/up".to_string(),
                backend_port: 10000,
            }
        );
        assert!("ssh:/up:10000".parse::<RouteSpec>().is_err());
        assert!("vless:/up".parse::<RouteSpec>().is_err());
        assert!("vless:/up:99999".parse::<RouteSpec>().is_err());
    }

    #[test]
    fn share_links_cover_every_route() {
        let table = RouteTable::new(vec![
            entry("/vless", 10000, ProtocolKind::Vless),
            entry("/vmess", 10001, ProtocolKind::Vmess),
        ])
        .unwrap();
        let target = ShareTarget {
            host: "example.org".to_string(),
            port: 443,
            tls: true,
            node_name: "node 1".to_string(),
        };

        let links = table.share_links(&target);
        assert_eq!(links.len(), 2);
        assert_eq!(
            links[0].1,
            "vless://abc@example.org:443?encryption=none&security=tls&sni=example.org&type=ws&host=example.org&path=%2Fvless#node%201"
        );

        let encoded = links[1].1.strip_prefix("vmess://").unwrap();
        let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(json["path"], "/vmess");
        assert_eq!(json["port"], "443");
        assert_eq!(json["tls"], "tls");
    }

    #[test]
    fn trojan_link_escapes_reserved_characters() {
        let mut trojan = entry("/tj/a b", 10002, ProtocolKind::Trojan);
        trojan.client_id = "p@ss:w~rd".to_string();
        let table = RouteTable::new(vec![trojan]).unwrap();
        let target = ShareTarget {
            host: "example.org".to_string(),
            port: 8080,
            tls: false,
            node_name: "edge-1.eu_west".to_string(),
        };

        let links = table.share_links(&target);
        assert_eq!(
            links[0].1,
            "trojan://p%40ss%3Aw~rd@example.org:8080?security=none&sni=example.org&type=ws&host=example.org&path=%2Ftj%2Fa%20b#edge-1.eu_west"
        );
    }
}
