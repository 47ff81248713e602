//! `trojan_ws`: TCP → TLS → WebSocket → Trojan bytes inside WS binary
//! frames (spec §4.2). Ground: `outbound::tcp_connect`/`tls_connect`,
//! `codec::websocket::upgrade` for the handshake, `ws_stream::WsStream`
//! for the framed body, `codec::trojan::build_header` for the payload
//! written as the first frame.

use pegas_shared::ServerDescriptor;
use tokio::io::AsyncWriteExt;

use crate::codec::{trojan, websocket, Destination};
use crate::error::SessionError;

use super::ws_stream::WsStream;
use super::{boxed, tcp_connect, tls_connect, BoxedStream};

pub async fn connect(server: &ServerDescriptor, dest: &Destination) -> Result<BoxedStream, SessionError> {
    let tcp = tcp_connect(server).await?;
    let sni = server.sni.as_deref().unwrap_or(&server.address);
    let mut tls = tls_connect(tcp, sni, server.tls_insecure).await?;

    let path = server.ws_path.as_deref().unwrap_or("/");
    websocket::upgrade(&mut tls, sni, path).await?;

    let mut ws = WsStream::new(tls);
    let header = trojan::build_header(&server.password_or_uuid, dest);
    ws.write_all(&header).await?;

    Ok(boxed(ws))
}
