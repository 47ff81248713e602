//! Poll-based WebSocket binary-frame wrapper used by `trojan_ws` and
//! `v2ray_ws` so that the rest of the outbound/session stack can keep
//! treating the transport as a plain `AsyncRead + AsyncWrite` (spec §4.2:
//! "after 101, all trojan bytes are WebSocket binary frames").
//!
//! Ground: the framing constants and per-direction masking rule follow
//! `codec::websocket`; the state-machine shape (accumulate raw bytes,
//! decode a frame at a time, one outgoing frame per write) follows
//! `pegas::codec::vmess::VmessStream`'s `ReadState`/`WriteState` split,
//! applied here instead of `9abe6fe0_jitlabs-sg-mihomo-rust__src-transport-websocket.rs.rs`'s
//! `WebSocketStream`, whose `poll_read`/`poll_write` pass bytes through
//! unframed and only its explicit `read_frame`/`write_frame` methods do
//! real framing — that shortcut doesn't fit a session that proxies raw
//! bytes through a uniform `BoxedStream`, so this wrapper does the framing
//! inside the poll methods themselves.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::codec::websocket::{self, Opcode};

enum WriteState {
    Ready,
    Writing { data: Vec<u8>, written: usize },
}

/// Wraps `inner` with client-side WebSocket binary framing. Ping frames are
/// answered with a pong carrying the same payload; a close frame surfaces
/// as EOF (spec §4.1: "close → transition session to CLOSING").
pub struct WsStream<S> {
    inner: S,
    raw: Vec<u8>,
    payload: Vec<u8>,
    payload_pos: usize,
    eof: bool,
    write_state: WriteState,
    pending_pong: WriteState,
}

impl<S> WsStream<S> {
    pub fn new(inner: S) -> Self {
        WsStream {
            inner,
            raw: Vec::new(),
            payload: Vec::new(),
            payload_pos: 0,
            eof: false,
            write_state: WriteState::Ready,
            pending_pong: WriteState::Ready,
        }
    }

    fn queue_pong(&mut self, payload: Vec<u8>) {
        // Best-effort: if a pong is already in flight, drop the new one
        // rather than queueing unboundedly; pings are rare control traffic
        // and a dropped pong just means the peer's liveness probe is
        // answered by the next one instead.
        if matches!(self.pending_pong, WriteState::Ready) {
            let framed = frame_bytes(Opcode::Pong, &payload);
            self.pending_pong = WriteState::Writing { data: framed, written: 0 };
        }
    }
}

fn frame_bytes(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    // Re-derives the header write_frame in codec::websocket produces, since
    // that helper is async (writes straight to an AsyncWrite); here we need
    // the framed bytes as a value to drive through poll_write ourselves.
    let len = payload.len();
    let first_byte = 0x80 | (opcode as u8);
    let mut header = Vec::with_capacity(14);
    header.push(first_byte);
    if len < 126 {
        header.push(0x80 | (len as u8));
    } else if len < 65536 {
        header.push(0x80 | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(0x80 | 127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    let mut mask_key = [0u8; 4];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut mask_key);
    header.extend_from_slice(&mask_key);
    let mut masked = payload.to_vec();
    for (i, b) in masked.iter_mut().enumerate() {
        *b ^= mask_key[i % 4];
    }
    header.extend_from_slice(&masked);
    header
}

/// Drains `state` into `inner`, returning `Ready(Ok(()))` once fully
/// written (or immediately if nothing is queued).
fn drive_write<S: AsyncWrite + Unpin>(
    inner: Pin<&mut S>,
    cx: &mut Context<'_>,
    state: &mut WriteState,
) -> Poll<std::io::Result<()>> {
    let mut inner = inner;
    loop {
        match state {
            WriteState::Ready => return Poll::Ready(Ok(())),
            WriteState::Writing { data, written } => {
                while *written < data.len() {
                    match inner.as_mut().poll_write(cx, &data[*written..])? {
                        Poll::Ready(0) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::WriteZero,
                                "failed to write websocket frame",
                            )))
                        }
                        Poll::Ready(n) => *written += n,
                        Poll::Pending => return Poll::Pending,
                    }
                }
                *state = WriteState::Ready;
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        // Opportunistically flush any pending pong; a pending write
        // doesn't block delivering already-decoded payload to the caller.
        let _ = drive_write(Pin::new(&mut this.inner), cx, &mut this.pending_pong);

        loop {
            if this.payload_pos < this.payload.len() {
                let n = (this.payload.len() - this.payload_pos).min(out.remaining());
                out.put_slice(&this.payload[this.payload_pos..this.payload_pos + n]);
                this.payload_pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(())); // repeated EOF reads
            }

            if let Some(meta) = websocket::parse_head(&this.raw) {
                let total = meta.header_len + meta.payload_len as usize;
                if this.raw.len() >= total {
                    let (opcode, payload) = websocket::decode_frame(&this.raw, &meta);
                    this.raw.drain(0..total);
                    match opcode {
                        Opcode::Binary | Opcode::Text | Opcode::Continuation => {
                            this.payload = payload;
                            this.payload_pos = 0;
                            continue;
                        }
                        Opcode::Ping => {
                            this.queue_pong(payload);
                            let _ = drive_write(Pin::new(&mut this.inner), cx, &mut this.pending_pong);
                            continue;
                        }
                        Opcode::Pong => continue,
                        Opcode::Close => {
                            this.eof = true;
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
            }

            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf)? {
                Poll::Ready(()) => {
                    let n = tmp_buf.filled().len();
                    if n == 0 {
                        this.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    this.raw.extend_from_slice(tmp_buf.filled());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &this.write_state {
                WriteState::Ready => {
                    let framed = frame_bytes(Opcode::Binary, buf);
                    this.write_state = WriteState::Writing { data: framed, written: 0 };
                    return Poll::Ready(Ok(buf.len()));
                }
                WriteState::Writing { .. } => {
                    match drive_write(Pin::new(&mut this.inner), cx, &mut this.write_state) {
                        Poll::Ready(Ok(())) => continue,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match drive_write(Pin::new(&mut this.inner), cx, &mut this.write_state) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match drive_write(Pin::new(&mut this.inner), cx, &mut this.write_state) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_binary_payload() {
        let (a, b) = duplex(8192);
        let mut client = WsStream::new(a);
        let mut server_raw = b;

        let payload = b"hello over websocket".to_vec();
        let payload_clone = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload_clone).await.unwrap();
            client.flush().await.unwrap();
        });

        let (opcode, got) = crate::codec::websocket::read_frame(&mut server_raw).await.unwrap();
        writer.await.unwrap();
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn decodes_server_frame_into_read() {
        let (a, b) = duplex(8192);
        let mut client = WsStream::new(a);
        let mut server_raw = b;

        let payload = b"from upstream".to_vec();
        let payload_clone = payload.clone();
        let writer = tokio::spawn(async move {
            crate::codec::websocket::write_frame(&mut server_raw, Opcode::Binary, &payload_clone)
                .await
                .unwrap();
        });

        let mut got = vec![0u8; payload.len()];
        client.read_exact(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn ping_gets_auto_ponged() {
        let (a, b) = duplex(8192);
        let mut client = WsStream::new(a);
        let mut server_raw = b;

        let ping_payload = b"are you there".to_vec();
        let ping_clone = ping_payload.clone();
        tokio::spawn(async move {
            crate::codec::websocket::write_frame(&mut server_raw, Opcode::Ping, &ping_clone)
                .await
                .unwrap();
            let (opcode, got) = crate::codec::websocket::read_frame(&mut server_raw)
                .await
                .unwrap();
            assert_eq!(opcode, Opcode::Pong);
            assert_eq!(got, ping_clone);

            let data = b"after ping".to_vec();
            crate::codec::websocket::write_frame(&mut server_raw, Opcode::Binary, &data)
                .await
                .unwrap();
        });

        let mut got = vec![0u8; b"after ping".len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"after ping");
    }
}
