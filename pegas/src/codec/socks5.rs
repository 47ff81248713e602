//! SOCKS5 inbound codec (RFC 1928 no-auth subset, CONNECT-only). Spec §4.1.
//!
//! Ground: teacher `proxy.rs`'s `handle_socks_connection` (constants,
//! address-parsing per ATYP, reply byte layout) and
//! `9ae27fb4_shaneutt-ztunnel__src-proxy-socks5.rs.rs`'s `handle()` for the
//! read-exact-then-validate shape of a from-scratch SOCKS5 server (that
//! file stops short of domain support; ours adds it per spec §4.1).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::InboundProtocolError;

use super::Destination;

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Reads and replies to the method-selection message: `0x05 NMETHODS
/// METHODS*` → `0x05 0x00`. Errors if no-auth isn't offered.
pub async fn negotiate_auth<S>(stream: &mut S) -> Result<(), InboundProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|_| InboundProtocolError::Truncated)?;

    if head[0] != VERSION {
        return Err(InboundProtocolError::BadVersion(head[0]));
    }

    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|_| InboundProtocolError::Truncated)?;

    if !methods.contains(&AUTH_NONE) {
        let _ = stream.write_all(&[VERSION, 0xFF]).await;
        return Err(InboundProtocolError::NoAcceptableAuth);
    }

    stream
        .write_all(&[VERSION, AUTH_NONE])
        .await
        .map_err(|_| InboundProtocolError::Truncated)?;
    Ok(())
}

/// Reads the CONNECT request `0x05 CMD 0x00 ATYP DST.ADDR DST.PORT`.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<Destination, InboundProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|_| InboundProtocolError::Truncated)?;

    if head[0] != VERSION {
        return Err(InboundProtocolError::BadVersion(head[0]));
    }
    if head[1] != CMD_CONNECT {
        return Err(InboundProtocolError::UnsupportedCommand(head[1]));
    }
    // head[2] is RSV, ignored.
    let atyp = head[3];

    let dest = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream
                .read_exact(&mut addr)
                .await
                .map_err(|_| InboundProtocolError::Truncated)?;
            let port = read_port(stream).await?;
            Destination::Ipv4(addr, port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|_| InboundProtocolError::Truncated)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream
                .read_exact(&mut domain)
                .await
                .map_err(|_| InboundProtocolError::Truncated)?;
            let port = read_port(stream).await?;
            Destination::Domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream
                .read_exact(&mut addr)
                .await
                .map_err(|_| InboundProtocolError::Truncated)?;
            let port = read_port(stream).await?;
            Destination::Ipv6(addr, port)
        }
        other => return Err(InboundProtocolError::UnsupportedAtyp(other)),
    };

    Ok(dest)
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16, InboundProtocolError> {
    let mut port = [0u8; 2];
    stream
        .read_exact(&mut port)
        .await
        .map_err(|_| InboundProtocolError::Truncated)?;
    Ok(u16::from_be_bytes(port))
}

/// Writes a CONNECT reply. On success, the bound address is always
/// reported as `0.0.0.0:0` (spec §4.1), matching how most SOCKS5 clients
/// ignore the bound-address field for CONNECT.
pub async fn write_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, // 0.0.0.0
        0, 0, // port 0
    ];
    stream.write_all(&reply).await?;
    stream.flush().await
}

/// Encodes a destination in SOCKS5 address wire format, used verbatim as
/// the address portion of the Trojan/VMess outbound headers (spec §4.1,
/// §4.2: "SOCKS5-formatted dest").
pub fn encode_dest(dest: &Destination) -> Vec<u8> {
    let mut out = Vec::new();
    match dest {
        Destination::Ipv4(addr, port) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(addr);
            out.extend_from_slice(&port.to_be_bytes());
        }
        Destination::Domain(domain, port) => {
            out.push(ATYP_DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Destination::Ipv6(addr, port) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(addr);
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn negotiates_no_auth() {
        let (mut client, mut server) = duplex(128);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        negotiate_auth(&mut server).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn rejects_bad_version() {
        let (mut client, mut server) = duplex(128);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = negotiate_auth(&mut server).await.unwrap_err();
        assert!(matches!(err, InboundProtocolError::BadVersion(0x04)));
    }

    #[tokio::test]
    async fn domain_length_255_roundtrips() {
        let domain = "a".repeat(255);
        let (mut client, mut server) = duplex(512);
        let mut req = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, 255u8];
        req.extend_from_slice(domain.as_bytes());
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let dest = read_connect_request(&mut server).await.unwrap();
        match dest {
            Destination::Domain(d, port) => {
                assert_eq!(d.len(), 255);
                assert_eq!(port, 80);
            }
            _ => panic!("expected domain"),
        }
        let encoded = encode_dest(&dest);
        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1], 255);
    }

    #[tokio::test]
    async fn ipv6_roundtrips() {
        let (mut client, mut server) = duplex(128);
        let mut req = vec![0x05, 0x01, 0x00, ATYP_IPV6];
        req.extend_from_slice(&[0u8; 15]);
        req.push(1);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let dest = read_connect_request(&mut server).await.unwrap();
        assert!(matches!(dest, Destination::Ipv6(_, 443)));
    }
}
