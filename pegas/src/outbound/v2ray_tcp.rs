//! `v2ray_tcp`: plain TCP carrying VMess AEAD framing directly, no TLS
//! (spec §4.2). Ground: `outbound::tcp_connect`, `codec::vmess` for the
//! request header and chunked stream.

use std::time::{SystemTime, UNIX_EPOCH};

use pegas_shared::ServerDescriptor;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::codec::vmess::{self, Security, VmessStream};
use crate::codec::Destination;
use crate::error::SessionError;

use super::{boxed, tcp_connect, BoxedStream};

/// Option byte used for every dialed VMess request (spec §4.1: "standard
/// format + chunk length masking + global padding"). Spec §8 flags this as
/// hard-coded rather than config-driven; see DESIGN.md.
const VMESS_OPTION: u8 = 0x05;
const VMESS_SECURITY: Security = Security::Aes128Gcm;

pub async fn connect(server: &ServerDescriptor, dest: &Destination) -> Result<BoxedStream, SessionError> {
    let mut tcp = tcp_connect(server).await?;

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
    tcp.write_all(&req.encrypted_header).await?;

    let (response_key, response_iv) = vmess::response_key_iv(&req.request_key, &req.request_iv);
    let stream = VmessStream::new(
        tcp,
        VMESS_SECURITY,
        req.request_key,
        req.request_iv,
        response_key,
        response_iv,
    );

    Ok(boxed(stream))
}
