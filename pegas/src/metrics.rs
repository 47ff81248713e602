//! Metrics prober: periodically dials each configured server for real
//! and times the connect and a `generate_204` HTTP round trip. Spec
//! §4.6.
//!
//! Ground: no corpus file implements an active latency probe; the dial
//! path reuses `outbound::dial` (the same one real sessions use, per
//! spec §4.6: "open outbound as if for a real session") and the
//! deadline/backoff shape follows teacher `proxy.rs`'s `tokio::time::timeout`
//! use around its connect-result channel.

use std::time::{Duration, Instant};

use pegas_shared::{StatDelta, StatKind, STAT_UNHEALTHY};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::codec::Destination;
use crate::outbound;
use crate::server::ServerManager;

const PROBE_HOST: &str = "www.google.com";
const PROBE_PATH: &str = "/generate_204";
const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Probes every configured server once, pushing `ConnectDelay` and
/// `G204Delay` deltas through `stat_tx`. Called on the helper loop's
/// probe timer (default every 60s, spec §4.6).
pub async fn probe_all(servers: &ServerManager, stat_tx: &(impl Fn(StatDelta) + Sync)) {
    for idx in 0..servers.len() {
        let Some(server) = servers.descriptor(idx).cloned() else { continue };
        let (connect_delay, g204_delay) = probe_one(&server).await;
        stat_tx(StatDelta {
            server_idx: idx,
            kind: StatKind::ConnectDelay,
            value: connect_delay,
        });
        stat_tx(StatDelta {
            server_idx: idx,
            kind: StatKind::G204Delay,
            value: g204_delay,
        });
    }
}

async fn probe_one(server: &pegas_shared::ServerDescriptor) -> (u32, u32) {
    let dest = Destination::Domain(PROBE_HOST.to_string(), 80);
    let started = Instant::now();

    let dial = tokio::time::timeout(PROBE_DEADLINE, outbound::dial(server, &dest));
    let mut stream = match dial.await {
        Ok(Ok(stream)) => stream,
        _ => return (STAT_UNHEALTHY, STAT_UNHEALTHY),
    };
    let connect_delay = started.elapsed().as_millis().min(u32::MAX as u128) as u32;

    let request = format!("GET {PROBE_PATH} HTTP/1.0\r\nHost: {PROBE_HOST}\r\n\r\n");
    let g204_started = Instant::now();
    let result = tokio::time::timeout(PROBE_DEADLINE, async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;
        await_204(&mut stream).await
    })
    .await;

    match result {
        Ok(Ok(())) => {
            let g204_delay = g204_started.elapsed().as_millis().min(u32::MAX as u128) as u32;
            (connect_delay, g204_delay)
        }
        _ => (connect_delay, STAT_UNHEALTHY),
    }
}

/// Reads just enough of the response to see the status line, returning
/// `Ok(())` iff it is an HTTP/1.x 204.
async fn await_204(stream: &mut outbound::BoxedStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n") || buf.len() > 256 {
            break;
        }
    }
    let line = String::from_utf8_lossy(&buf);
    if line.starts_with("HTTP/1.0 204") || line.starts_with("HTTP/1.1 204") {
        Ok(())
    } else {
        Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "not a 204 response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn await_204_accepts_matching_status_line() {
        let (mut client, server) = duplex(256);
        client.write_all(b"HTTP/1.1 204 No Content\r\n").await.unwrap();
        drop(client);
        let mut boxed: outbound::BoxedStream = Box::pin(server);
        await_204(&mut boxed).await.unwrap();
    }

    #[tokio::test]
    async fn await_204_rejects_other_status() {
        let (mut client, server) = duplex(256);
        client.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
        drop(client);
        let mut boxed: outbound::BoxedStream = Box::pin(server);
        assert!(await_204(&mut boxed).await.is_err());
    }
}
