//! `v2ray_ws`: TCP → TLS → WebSocket, carrying VMess AEAD framing inside
//! WS binary frames (spec §4.2). Ground: `outbound::tls_connect`,
//! `codec::websocket::upgrade`, `ws_stream::WsStream`, `codec::vmess`.

use std::time::{SystemTime, UNIX_EPOCH};

use pegas_shared::ServerDescriptor;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::codec::vmess::{self, Security, VmessStream};
use crate::codec::{websocket, Destination};
use crate::error::SessionError;

use super::ws_stream::WsStream;
use super::{boxed, tcp_connect, tls_connect, BoxedStream};

const VMESS_OPTION: u8 = 0x05;
const VMESS_SECURITY: Security = Security::Aes128Gcm;

pub async fn connect(server: &ServerDescriptor, dest: &Destination) -> Result<BoxedStream, SessionError> {
    let tcp = tcp_connect(server).await?;
    let sni = server.sni.as_deref().unwrap_or(&server.address);
    let mut tls = tls_connect(tcp, sni, server.tls_insecure).await?;

    let path = server.ws_path.as_deref().unwrap_or("/");
    websocket::upgrade(&mut tls, sni, path).await?;
    let mut ws = WsStream::new(tls);

    let uuid = Uuid::parse_str(&server.password_or_uuid).map_err(|_| {
        SessionError::Dial(crate::error::OutboundDialError::InvalidUuid(
            server.password_or_uuid.clone(),
        ))
    })?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs();

    let req = vmess::build_request(&uuid, dest, VMESS_SECURITY, VMESS_OPTION, timestamp);
    ws.write_all(&req.encrypted_header).await?;

    let (response_key, response_iv) = vmess::response_key_iv(&req.request_key, &req.request_iv);
    let stream = VmessStream::new(
        ws,
        VMESS_SECURITY,
        req.request_key,
        req.request_iv,
        response_key,
        response_iv,
    );

    Ok(boxed(stream))
}
