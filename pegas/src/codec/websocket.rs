//! WebSocket client-side codec (RFC 6455 subset). Spec §4.1.
//!
//! Ground: teacher `websocket.rs` — same `Opcode` enum, same
//! SHA1+base64 accept-key computation and `WS_GUID`, same frame
//! header-parsing shape — but turned around from server-accept to
//! client-request, since here the proxy is the one dialing an upstream
//! WebSocket endpoint (`pgs_ws_req` / `pgs_ws_upgrade_check` in
//! `original_source/src/pgs_codec.h`), not the one accepting connections.

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, WsUpgradeError};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => Opcode::Binary,
        }
    }
}

/// Frame metadata as spec §3 defines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload_len: u64,
    pub header_len: usize,
}

/// Parses a frame header out of `buf` without consuming it. Returns
/// `None` if `buf` doesn't yet hold a full header (spec §4.1: "Returns
/// false if the buffer is shorter than `header_len + payload_len`" — here
/// split into header-only parsing so the session can decide how much more
/// to read).
pub fn parse_head(buf: &[u8]) -> Option<FrameMeta> {
    if buf.len() < 2 {
        return None;
    }
    let fin = (buf[0] & 0x80) != 0;
    let opcode = buf[0] & 0x0F;
    let masked = (buf[1] & 0x80) != 0;
    let len7 = buf[1] & 0x7F;

    let (payload_len, mut header_len) = match len7 {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(b), 10)
        }
        n => (n as u64, 2),
    };

    if masked {
        header_len += 4;
    }
    if buf.len() < header_len {
        return None;
    }

    Some(FrameMeta {
        fin,
        opcode,
        masked,
        payload_len,
        header_len,
    })
}

/// Maximum single-frame payload accepted; larger frames are a `CodecError`.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Extracts and unmasks the payload of a complete frame already sitting in
/// `buf` (caller has checked `buf.len() >= meta.header_len + meta.payload_len`
/// via [`parse_head`]). Used by the poll-based [`crate::outbound::ws_stream`]
/// wrapper, which accumulates raw bytes itself rather than reading through
/// an `AsyncRead` with `read_exact` (spec §4.1: "Returns false if the buffer
/// is shorter than `header_len + payload_len`").
pub fn decode_frame(buf: &[u8], meta: &FrameMeta) -> (Opcode, Vec<u8>) {
    let mut payload = buf[meta.header_len..meta.header_len + meta.payload_len as usize].to_vec();
    if meta.masked {
        let mask_start = meta.header_len - 4;
        let mask = [buf[mask_start], buf[mask_start + 1], buf[mask_start + 2], buf[mask_start + 3]];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    (Opcode::from(meta.opcode), payload)
}

/// Writes a frame. Per spec §3 invariant, client→server frames are always
/// masked with a fresh key; `write_frame` is used exclusively on the
/// outbound (client) leg, so it always masks.
pub async fn write_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
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
    rand::thread_rng().fill_bytes(&mut mask_key);
    header.extend_from_slice(&mask_key);

    let mut masked_payload = payload.to_vec();
    for (i, byte) in masked_payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }

    writer.write_all(&header).await?;
    writer.write_all(&masked_payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame from the server. Per spec §3 invariant, server→client
/// frames are never masked; a masked frame from the server is treated as
/// a codec error since it would never appear from a spec-compliant peer
/// and this codec only unmasks on the direction that can legally carry a
/// mask.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Opcode, Vec<u8>), CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let opcode = Opcode::from(header[0]);
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as u64;

    if len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        len = u64::from_be_bytes(ext);
    }

    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// Builds a client upgrade request (`pgs_ws_req`): literal
/// `Sec-WebSocket-Version: 13`, a fresh base64 nonce key, the configured
/// `Host` and path.
pub fn build_upgrade_request(host: &str, path: &str) -> (Vec<u8>, String) {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = base64::engine::general_purpose::STANDARD.encode(nonce);

    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    (request.into_bytes(), key)
}

fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(result)
}

/// Reads the HTTP response head (up to and including the terminating
/// blank line) from `reader`, bounded to avoid unbounded memory growth
/// from a misbehaving or malicious peer.
async fn read_http_head<R>(reader: &mut R) -> Result<String, WsUpgradeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 8192 {
            return Err(WsUpgradeError::NotSwitchingProtocols);
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Sends the upgrade request and validates the response (`pgs_ws_req` +
/// `pgs_ws_upgrade_check`): status line must begin `HTTP/1.1 101` and an
/// `Upgrade: websocket` header (case-insensitive) must be present. The
/// expected `Sec-WebSocket-Accept` is additionally verified against the
/// key we sent.
pub async fn upgrade<S>(stream: &mut S, host: &str, path: &str) -> Result<(), WsUpgradeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, key) = build_upgrade_request(host, path);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let response = read_http_head(stream).await?;
    let lower = response.to_lowercase();

    let starts_101 = response.starts_with("HTTP/1.1 101");
    let has_upgrade = lower.contains("upgrade: websocket");
    if !starts_101 || !has_upgrade {
        return Err(WsUpgradeError::NotSwitchingProtocols);
    }

    let expected_accept = compute_accept_key(&key);
    let has_accept = response
        .lines()
        .any(|line| line.to_lowercase().starts_with("sec-websocket-accept:") && line.contains(&expected_accept));
    if !has_accept {
        return Err(WsUpgradeError::MissingAccept);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn parse_head_roundtrips_across_lengths() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload = vec![0u8; len];
            let mut buf = Vec::new();
            let first = 0x80 | (Opcode::Binary as u8);
            buf.push(first);
            if len < 126 {
                buf.push(len as u8);
            } else if len < 65536 {
                buf.push(126);
                buf.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                buf.push(127);
                buf.extend_from_slice(&(len as u64).to_be_bytes());
            }
            buf.extend_from_slice(&payload);
            let meta = parse_head(&buf).expect("parses");
            assert_eq!(meta.payload_len, len as u64);
            assert!(meta.fin);
            assert_eq!(meta.opcode, Opcode::Binary as u8);
            assert!(!meta.masked);
        }
    }

    #[test]
    fn decode_frame_matches_read_frame() {
        let mut buf = Vec::new();
        buf.push(0x80 | (Opcode::Binary as u8));
        buf.push(0x80 | 5);
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        buf.extend_from_slice(&mask);
        let payload = b"hello";
        let mut masked = payload.to_vec();
        for (i, b) in masked.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        buf.extend_from_slice(&masked);

        let meta = parse_head(&buf).unwrap();
        let (opcode, decoded) = decode_frame(&buf, &meta);
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn masked_write_is_unmasked_on_read() {
        let (mut a, mut b) = duplex(4096);
        let payload = b"hello world".to_vec();
        write_frame(&mut a, Opcode::Binary, &payload).await.unwrap();
        let (opcode, got) = read_frame(&mut b).await.unwrap();
        assert_eq!(opcode, Opcode::Binary);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn upgrade_accepts_valid_101() {
        let (mut client, mut server) = duplex(4096);
        let task = tokio::spawn(async move { upgrade(&mut client, "example.com", "/ray").await });

        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);
        let key_line = request
            .lines()
            .find(|l| l.to_lowercase().starts_with("sec-websocket-key:"))
            .unwrap();
        let key = key_line.split(':').nth(1).unwrap().trim();
        let accept = compute_accept_key(key);

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        server.write_all(response.as_bytes()).await.unwrap();

        task.await.unwrap().unwrap();
    }
}
