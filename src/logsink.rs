//! Forwarding of backend output.
//!
//! Bytes are passed to the process-wide sink exactly as the child wrote
//! them. Pattern scanning runs on a separate line buffer so it never
//! delays or alters what gets forwarded.

use crate::error::ConfigError;
use regex::Regex;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;
const MAX_LINE: usize = 64 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Typed notifications derived from backend output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendEvent {
    PatternMatched { name: String, value: String },
}

/// Destination for raw child output: our own stdout/stderr plus an
/// optional append-only file.
#[derive(Debug, Default)]
pub struct LogSink {
    file: Option<Mutex<File>>,
}

impl LogSink {
    pub fn console() -> Self {
        Self { file: None }
    }

    pub async fn with_file(path: &Path) -> std::io::Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(path).await?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub async fn write(&self, stream: OutputStream, bytes: &[u8]) {
        let res = match stream {
            OutputStream::Stdout => {
                let mut out = tokio::io::stdout();
                match out.write_all(bytes).await {
                    Ok(()) => out.flush().await,
                    Err(e) => Err(e),
                }
            }
            OutputStream::Stderr => {
                let mut err = tokio::io::stderr();
                match err.write_all(bytes).await {
                    Ok(()) => err.flush().await,
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = res {
            debug!("Console write failed: {}", e);
        }

        if let Some(file) = &self.file {
            let mut file = file.lock().await;
            let res = match file.write_all(bytes).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!("Backend log file write failed: {}", e);
            }
        }
    }
}

/// `name=regex`; the value reported is the first capture group if the
/// pattern has one, the whole match otherwise.
#[derive(Clone, Debug)]
pub struct WatchPattern {
    pub name: String,
    regex: Regex,
}

impl FromStr for WatchPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, pattern) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidWatch(s.to_string(), "expected name=regex".into()))?;
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidWatch(s.to_string(), "empty name".into()));
        }
        let regex = Regex::new(pattern)
            .map_err(|e| ConfigError::InvalidWatch(s.to_string(), e.to_string()))?;
        Ok(Self {
            name: name.trim().to_string(),
            regex,
        })
    }
}

impl WatchPattern {
    fn extract(&self, line: &str) -> Option<String> {
        let caps = self.regex.captures(line)?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
    }
}

/// Scans complete lines for patterns of interest.
#[derive(Clone, Debug, Default)]
pub struct LogWatcher {
    patterns: Vec<WatchPattern>,
}

impl LogWatcher {
    pub fn new(patterns: Vec<WatchPattern>) -> Self {
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn scan(&self, line: &str) -> Vec<BackendEvent> {
        self.patterns
            .iter()
            .filter_map(|p| {
                p.extract(line).map(|value| BackendEvent::PatternMatched {
                    name: p.name.clone(),
                    value,
                })
            })
            .collect()
    }
}

/// Pump one child stream into the sink until EOF.
pub async fn forward_output<R>(
    mut reader: R,
    stream: OutputStream,
    sink: Arc<LogSink>,
    watcher: Arc<LogWatcher>,
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut line = Vec::new();
    let scanning = !watcher.is_empty() && events.is_some();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Backend {:?} read error: {}", stream, e);
                break;
            }
        };

        sink.write(stream, &buf[..n]).await;

        if !scanning {
            continue;
        }
        for &byte in &buf[..n] {
            if byte == b'\n' {
                emit_matches(&watcher, &line, events.as_ref());
                line.clear();
            } else if line.len() < MAX_LINE {
                line.push(byte);
            }
        }
    }

    if scanning && !line.is_empty() {
        emit_matches(&watcher, &line, events.as_ref());
    }
}

fn emit_matches(
    watcher: &LogWatcher,
    line: &[u8],
    events: Option<&mpsc::UnboundedSender<BackendEvent>>,
) {
    let Some(events) = events else { return };
    let text = String::from_utf8_lossy(line);
    for event in watcher.scan(text.trim_end_matches('\r')) {
        // Receiver gone means nobody is listening any more.
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_pattern_prefers_capture_group() {
        let pattern: WatchPattern = r"tunnel=(https://[a-z0-9-]+\.trycloudflare\.com)"
            .parse()
            .unwrap();
        let watcher = LogWatcher::new(vec![pattern]);

        let events = watcher.scan("INF |  https://quiet-fog-12.trycloudflare.com  |");
        assert_eq!(
            events,
            vec![BackendEvent::PatternMatched {
                name: "tunnel".into(),
                value: "https://quiet-fog-12.trycloudflare.com".into(),
            }]
        );
        assert!(watcher.scan("nothing here").is_empty());
    }

    #[test]
    fn rejects_bad_watch_specs() {
        assert!("no-equals".parse::<WatchPattern>().is_err());
        assert!("=abc".parse::<WatchPattern>().is_err());
        assert!("name=(unclosed".parse::<WatchPattern>().is_err());
    }

    #[tokio::test]
    async fn forwards_bytes_and_emits_events_across_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("backend.log");
        let sink = Arc::new(LogSink::with_file(&log_path).await.unwrap());
        let watcher = Arc::new(LogWatcher::new(vec!["ready=listening on (\\S+)"
            .parse()
            .unwrap()]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut writer, reader) = tokio::io::duplex(16);
        let pump = tokio::spawn(forward_output(
            reader,
            OutputStream::Stdout,
            sink.clone(),
            watcher,
            Some(tx),
        ));

        let payload = b"boot\nlistening on 127.0.0.1:10000\nno newline at end";
        writer.write_all(payload).await.unwrap();
        drop(writer);
        pump.await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            BackendEvent::PatternMatched {
                name: "ready".into(),
                value: "127.0.0.1:10000".into(),
            }
        );

        drop(sink);
        let logged = tokio::fs::read(&log_path).await.unwrap();
        assert_eq!(logged, payload);
    }
}
