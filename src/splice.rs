use crate::traffic::TrafficCounters;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const SPLICE_BUF: usize = 16 * 1024;

/// Bytes moved in each direction by one tunnel.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SpliceStats {
    pub from_client: u64,
    pub from_backend: u64,
}

/// Copy bytes both ways until either side closes, errors, or the tunnel
/// stays silent for `idle` (when set). Both sides are shut down on exit.
pub async fn splice<C, B>(
    tunnel_id: usize,
    mut client: C,
    mut backend: B,
    idle: Option<Duration>,
    counters: Option<&TrafficCounters>,
) -> io::Result<SpliceStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = SpliceStats::default();
    let mut client_buf = vec![0u8; SPLICE_BUF];
    let mut backend_buf = vec![0u8; SPLICE_BUF];

    // A disabled idle timeout is modelled as a timer that never fires.
    let window = idle.unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
    let idle_timer = tokio::time::sleep(window);
    tokio::pin!(idle_timer);
    let mut error: Option<io::Error> = None;

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = backend.write_all(&client_buf[..n]).await {
                            debug!("Tunnel #{} backend write error: {}", tunnel_id, e);
                            error = Some(e);
                            break;
                        }
                        stats.from_client += n as u64;
                        if let Some(c) = counters {
                            c.add_rx(n as u64);
                        }
                        idle_timer.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                    Err(e) => {
                        debug!("Tunnel #{} client read error: {}", tunnel_id, e);
                        error = Some(e);
                        break;
                    }
                }
            }
            res = backend.read(&mut backend_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client.write_all(&backend_buf[..n]).await {
                            debug!("Tunnel #{} client write error: {}", tunnel_id, e);
                            error = Some(e);
                            break;
                        }
                        stats.from_backend += n as u64;
                        if let Some(c) = counters {
                            c.add_tx(n as u64);
                        }
                        idle_timer.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                    Err(e) => {
                        debug!("Tunnel #{} backend read error: {}", tunnel_id, e);
                        error = Some(e);
                        break;
                    }
                }
            }
            _ = &mut idle_timer => {
                warn!("Tunnel #{} idle timeout after {:?}, closing", tunnel_id, window);
                break;
            }
        }
    }

    if let Err(e) = backend.shutdown().await {
        if !is_expected_close(&e) {
            debug!("Tunnel #{} backend shutdown error: {}", tunnel_id, e);
        }
    }
    if let Err(e) = client.shutdown().await {
        if !is_expected_close(&e) {
            debug!("Tunnel #{} client shutdown error: {}", tunnel_id, e);
        }
    }

    // Only log stats for very large transfers to reduce noise
    if stats.from_client + stats.from_backend > 10_485_760 {
        info!(
            "Tunnel #{} completed large transfer: {}↑ {}↓ bytes",
            tunnel_id, stats.from_client, stats.from_backend
        );
    }

    match error {
        Some(e) if !is_expected_close(&e) => Err(e),
        _ => Ok(stats),
    }
}

fn is_expected_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
