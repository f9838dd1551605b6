//! Backend configuration synthesis.
//!
//! The output is a pure function of the route table: serde serializes struct
//! fields in declaration order and the table itself is kept sorted, so equal
//! inputs always produce byte-identical files.

use crate::routes::{ProtocolKind, RouteEntry, RouteTable};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct BackendConfig<'a> {
    log: LogSection<'a>,
    inbounds: Vec<Inbound<'a>>,
    outbounds: Vec<Outbound>,
}

#[derive(Serialize)]
struct LogSection<'a> {
    loglevel: &'a str,
}

#[derive(Serialize)]
struct Inbound<'a> {
    tag: String,
    listen: &'static str,
    port: u16,
    protocol: &'static str,
    settings: InboundSettings<'a>,
    #[serde(rename = "streamSettings")]
    stream_settings: StreamSettings<'a>,
}

#[derive(Serialize)]
struct InboundSettings<'a> {
    clients: Vec<Client<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decryption: Option<&'static str>,
}

#[derive(Serialize)]
struct Client<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
}

#[derive(Serialize)]
struct StreamSettings<'a> {
    network: &'static str,
    security: &'static str,
    #[serde(rename = "wsSettings")]
    ws_settings: WsSettings<'a>,
}

#[derive(Serialize)]
struct WsSettings<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct Outbound {
    tag: &'static str,
    protocol: &'static str,
}

fn inbound(entry: &RouteEntry) -> Inbound<'_> {
    let id = entry.client_id.as_str();
    let (client, decryption) = match entry.kind {
        ProtocolKind::Vless => (
            Client {
                id: Some(id),
                password: None,
                alter_id: None,
            },
            Some("none"),
        ),
        ProtocolKind::Vmess => (
            Client {
                id: Some(id),
                password: None,
                alter_id: Some(0),
            },
            None,
        ),
        ProtocolKind::Trojan => (
            Client {
                id: None,
                password: Some(id),
                alter_id: None,
            },
            None,
        ),
    };

    Inbound {
        tag: format!("{}-{}", entry.kind, entry.backend_port),
        listen: "127.0.0.1",
        port: entry.backend_port,
        protocol: entry.kind.as_str(),
        settings: InboundSettings {
            clients: vec![client],
            decryption,
        },
        stream_settings: StreamSettings {
            network: "ws",
            security: "none",
            ws_settings: WsSettings { path: &entry.path },
        },
    }
}

/// Render the backend's declarative configuration for `routes`.
pub fn synthesize(routes: &RouteTable, log_level: &str) -> Vec<u8> {
    let config = BackendConfig {
        log: LogSection { loglevel: log_level },
        inbounds: routes.entries().iter().map(inbound).collect(),
        outbounds: vec![
            Outbound {
                tag: "direct",
                protocol: "freedom",
            },
            Outbound {
                tag: "block",
                protocol: "blackhole",
            },
        ],
    };

    let mut bytes = serde_json::to_vec_pretty(&config).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

/// Replace `path` with `bytes` in one rename, readable only by the owner.
pub fn write_config(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options.open(&tmp)?;
    f.write_all(bytes)?;
    f.flush()?;
    drop(f);
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RouteEntry {
                path: "/vmess".to_string(),
                backend_port: 10001,
                kind: ProtocolKind::Vmess,
                client_id: "abc".to_string(),
            },
            RouteEntry {
                path: "/up".to_string(),
                backend_port: 10000,
                kind: ProtocolKind::Vless,
                client_id: "abc".to_string(),
            },
            RouteEntry {
                path: "/tr".to_string(),
                backend_port: 10002,
                kind: ProtocolKind::Trojan,
                client_id: "secret".to_string(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn synthesize_is_deterministic() {
        let first = synthesize(&table(), "warning");
        let second = synthesize(&table(), "warning");
        assert_eq!(first, second);
    }

    #[test]
    fn one_loopback_inbound_per_route() {
        let bytes = synthesize(&table(), "warning");
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let inbounds = json["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 3);

        for inbound in inbounds {
            assert_eq!(inbound["listen"], "127.0.0.1");
            assert_eq!(inbound["streamSettings"]["network"], "ws");
        }

        let vless = inbounds.iter().find(|i| i["protocol"] == "vless").unwrap();
        assert_eq!(vless["port"], 10000);
        assert_eq!(vless["settings"]["clients"][0]["id"], "abc");
        assert_eq!(vless["settings"]["decryption"], "none");
        assert_eq!(vless["streamSettings"]["wsSettings"]["path"], "/up");

        let vmess = inbounds.iter().find(|i| i["protocol"] == "vmess").unwrap();
        assert_eq!(vmess["settings"]["clients"][0]["alterId"], 0);
        assert!(vmess["settings"].get("decryption").is_none());

        let trojan = inbounds.iter().find(|i| i["protocol"] == "trojan").unwrap();
        assert_eq!(trojan["settings"]["clients"][0]["password"], "secret");
        assert!(trojan["settings"]["clients"][0].get("id").is_none());
    }

    #[test]
    fn write_config_overwrites_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        write_config(&path, b"a much longer first version\n").unwrap();
        write_config(&path, b"short\n").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"short\n");
        assert!(!path.with_extension("tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
