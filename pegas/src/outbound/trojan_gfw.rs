//! `trojan_gfw`: TCP → TLS → raw Trojan bytes (spec §4.2, no WebSocket
//! framing). Ground: `outbound::tcp_connect`/`tls_connect` for transport
//! setup, `codec::trojan::build_header` for the protocol handshake.

use pegas_shared::ServerDescriptor;
use tokio::io::AsyncWriteExt;

use crate::codec::{trojan, Destination};
use crate::error::SessionError;

use super::{boxed, tcp_connect, tls_connect, BoxedStream};

pub async fn connect(server: &ServerDescriptor, dest: &Destination) -> Result<BoxedStream, SessionError> {
    let tcp = tcp_connect(server).await?;
    let sni = server.sni.as_deref().unwrap_or(&server.address);
    let mut tls = tls_connect(tcp, sni, server.tls_insecure).await?;

    let header = trojan::build_header(&server.password_or_uuid, dest);
    tls.write_all(&header).await?;

    Ok(boxed(tls))
}
