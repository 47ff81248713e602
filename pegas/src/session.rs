//! Per-connection session: negotiates SOCKS5 inbound, dials the active
//! outbound transport, then relays bytes bidirectionally. Spec §4.3.
//!
//! Ground: teacher `proxy.rs`'s `handle_socks_connection` for the overall
//! shape (negotiate → reply → relay → log); the decoupled reader/writer
//! pair bridged by a channel follows that same file's `data_tx`/`data_rx`
//! bounded-channel relay, generalized from a C2 hop to a direct two-task
//! byte pump against the outbound [`crate::outbound::BoxedStream`], with
//! an explicit high/low watermark gate added per spec §4.3 in place of
//! the teacher's fixed channel depth.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pegas_shared::{StatDelta, StatKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::codec::socks5;
use crate::error::SessionError;
use crate::outbound;
use crate::server::ServerManager;

/// Per-direction buffered-bytes ceiling; the reading half suspends once
/// its queued-but-unwritten bytes reach this (spec §4.3).
const HIGH_WATERMARK: usize = 256 * 1024;
/// Reading resumes once buffered bytes drop to this (spec §4.3).
const LOW_WATERMARK: usize = 128 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Runs one accepted SOCKS5 connection to completion. `stat_tx` reports
/// the `ConnCount` delta on a successful CONNECT; the caller supplies it
/// bound to this worker's MPSC producer handle. `idle_timeout` closes the
/// session if neither direction sees any I/O for that long (spec §5).
pub async fn run(
    mut inbound: TcpStream,
    servers: Arc<ServerManager>,
    stat_tx: impl Fn(StatDelta),
    idle_timeout: Duration,
) -> Result<(), SessionError> {
    socks5::negotiate_auth(&mut inbound).await?;
    let dest = match socks5::read_connect_request(&mut inbound).await {
        Ok(dest) => dest,
        Err(e) => {
            let e = SessionError::from(e);
            let _ = socks5::write_reply(&mut inbound, e.socks5_reply_code()).await;
            return Err(e);
        }
    };

    let (server, server_idx) = {
        let idx = servers.active_index();
        let server = servers
            .descriptor(idx)
            .cloned()
            .ok_or(crate::error::OutboundDialError::NoServer)?;
        (server, idx)
    };

    let outbound_stream = match outbound::dial(&server, &dest).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = socks5::write_reply(&mut inbound, e.socks5_reply_code()).await;
            return Err(e);
        }
    };

    socks5::write_reply(&mut inbound, socks5::REP_SUCCESS).await?;
    stat_tx(StatDelta {
        server_idx,
        kind: StatKind::ConnCount,
        value: 1,
    });

    relay(inbound, outbound_stream, idle_timeout).await
}

/// Pumps bytes in both directions until both halves have reached EOF, or
/// [`watchdog`] fires because neither direction has moved a byte in
/// `idle_timeout` (spec §5: "idle sessions without any I/O for 120 s are
/// closed").
async fn relay(
    inbound: TcpStream,
    mut outbound: outbound::BoxedStream,
    idle_timeout: Duration,
) -> Result<(), SessionError> {
    let (in_r, in_w) = inbound.into_split();
    let (out_r, out_w) = tokio::io::split(&mut outbound);
    let last_activity = Arc::new(AtomicU64::new(crate::logging::now_ms()));

    let relay_fut = async {
        let (up_res, down_res) = tokio::join!(
            pump(in_r, out_w, last_activity.clone()),
            pump(out_r, in_w, last_activity.clone())
        );
        up_res?;
        down_res?;
        Ok::<(), SessionError>(())
    };

    tokio::select! {
        res = relay_fut => res,
        _ = watchdog(last_activity, idle_timeout) => Err(SessionError::Timeout),
    }
}

/// Resolves once `idle_timeout` has passed since the last byte moved in
/// either direction, per the `last_activity` timestamp both [`pump`] calls
/// update.
async fn watchdog(last_activity: Arc<AtomicU64>, idle_timeout: Duration) {
    let idle_ms = idle_timeout.as_millis() as u64;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let elapsed = crate::logging::now_ms().saturating_sub(last_activity.load(Ordering::Relaxed));
        if elapsed >= idle_ms {
            return;
        }
    }
}

/// One direction of the relay, split into a reader half and a writer
/// half joined by a bounded-capacity channel whose backpressure
/// implements the watermark invariant: the reader suspends (the channel
/// send future doesn't resolve) once [`HIGH_WATERMARK`] bytes are
/// in flight, and resumes once the writer has drained enough to fall
/// back to [`LOW_WATERMARK`].
async fn pump<R, W>(mut reader: R, mut writer: W, last_activity: Arc<AtomicU64>) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let outstanding = Arc::new(AtomicUsize::new(0));
    let resume = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader_outstanding = outstanding.clone();
    let reader_resume = resume.clone();
    let reader_activity = last_activity.clone();
    let read_side = async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            loop {
                // Enable the waiter before re-checking `outstanding`: a bare
                // `notified().await` after the check can miss a `notify_waiters()` that
                // lands in between (it wakes only already-registered waiters), parking
                // the reader until the idle watchdog fires instead of resuming at the
                // low watermark.
                let notified = reader_resume.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if reader_outstanding.load(Ordering::Acquire) < HIGH_WATERMARK {
                    break;
                }
                notified.await;
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                drop(tx);
                return Ok::<(), SessionError>(());
            }
            reader_activity.store(crate::logging::now_ms(), Ordering::Relaxed);
            reader_outstanding.fetch_add(n, Ordering::AcqRel);
            if tx.send(buf[..n].to_vec()).is_err() {
                return Ok(());
            }
        }
    };

    let write_side = async move {
        while let Some(chunk) = rx.recv().await {
            let len = chunk.len();
            writer.write_all(&chunk).await?;
            last_activity.store(crate::logging::now_ms(), Ordering::Relaxed);
            let prev = outstanding.fetch_sub(len, Ordering::AcqRel);
            if prev >= HIGH_WATERMARK && prev - len <= LOW_WATERMARK {
                resume.notify_waiters();
            }
        }
        writer.flush().await?;
        let _ = writer.shutdown().await;
        Ok::<(), SessionError>(())
    };

    let (r, w) = tokio::join!(read_side, write_side);
    r?;
    w?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pump_relays_until_eof() {
        let (mut client, server) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);

        let payload = vec![0x7Au8; 200_000];
        let payload_clone = payload.clone();
        let last_activity = Arc::new(AtomicU64::new(crate::logging::now_ms()));
        let task = tokio::spawn(async move { pump(reader, writer, last_activity).await });

        client.write_all(&payload_clone).await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_times_out() {
        let (client, server) = duplex(4096);
        let (in_r, in_w) = tokio::io::split(server);
        let outbound_side = client;
        let (out_r, out_w) = tokio::io::split(outbound_side);

        let last_activity = Arc::new(AtomicU64::new(crate::logging::now_ms()));
        let watchdog_task = watchdog(last_activity.clone(), Duration::from_secs(5));

        let relay_fut = async {
            let (a, b) = tokio::join!(
                pump(in_r, out_w, last_activity.clone()),
                pump(out_r, in_w, last_activity)
            );
            a?;
            b?;
            Ok::<(), SessionError>(())
        };

        let result = tokio::select! {
            res = relay_fut => res,
            _ = watchdog_task => Err(SessionError::Timeout),
        };
        assert!(matches!(result, Err(SessionError::Timeout)));
    }
}
