//! Error taxonomy. See spec §7.
//!
//! Ground: teacher `crypto.rs`'s `CryptoError` / `settings.rs`'s
//! `SettingsError` — derive-based `Display` via `thiserror`, `#[from]`
//! conversions for `io::Error` at the leaves.

use thiserror::Error;

use crate::codec::socks5::{REP_ATYP_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE};

/// Fatal at startup; process exits non-zero (spec §6: exit 255).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (checked {0})")]
    NotFound(String),
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Fatal at startup (spec §6: exit 1).
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure socket: {0}")]
    Configure(#[source] std::io::Error),
}

/// Malformed SOCKS5 from the inbound client (spec §4.1 / §7).
#[derive(Debug, Error)]
pub enum InboundProtocolError {
    #[error("unsupported SOCKS version {0:#x}")]
    BadVersion(u8),
    #[error("no acceptable auth method offered")]
    NoAcceptableAuth,
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#x}")]
    UnsupportedAtyp(u8),
    #[error("connection closed before request complete")]
    Truncated,
}

impl InboundProtocolError {
    /// SOCKS5 reply code to send back before closing, per spec §4.1.
    pub fn reply_code(&self) -> u8 {
        match self {
            InboundProtocolError::UnsupportedCommand(_) => REP_COMMAND_NOT_SUPPORTED,
            InboundProtocolError::UnsupportedAtyp(_) => REP_ATYP_NOT_SUPPORTED,
            _ => REP_GENERAL_FAILURE,
        }
    }
}

/// Per-session outbound failures (spec §7): close inbound with SOCKS5
/// general-failure (0x01) if still pre-reply, else just close.
#[derive(Debug, Error)]
pub enum OutboundDialError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no server configured")]
    NoServer,
    #[error("server's password_or_uuid is not a valid UUID: {0}")]
    InvalidUuid(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
    #[error("invalid server name {0}")]
    InvalidServerName(String),
}

#[derive(Debug, Error)]
pub enum WsUpgradeError {
    #[error("WebSocket upgrade request failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("server did not reply with HTTP/1.1 101")]
    NotSwitchingProtocols,
    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,
}

/// Bad WS frame / AEAD tag mismatch (spec §7): closes both sides immediately.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(u64),
    #[error("AEAD authentication failed")]
    AeadAuthFailed,
    #[error("malformed VMess response header")]
    BadVmessHeader,
    #[error("malformed trojan header")]
    BadTrojanHeader,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-session errors a worker surfaces while driving a session; see
/// spec §4.3 / §7. Grouped so `session.rs` can propagate one `?`-able type.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Inbound(#[from] InboundProtocolError),
    #[error(transparent)]
    Dial(#[from] OutboundDialError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    WsUpgrade(#[from] WsUpgradeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("idle timeout")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True while the SOCKS5 success/failure reply has not yet been sent,
    /// i.e. the error still needs a SOCKS5 reply rather than a bare close.
    pub fn needs_socks5_reply(&self) -> bool {
        matches!(
            self,
            SessionError::Inbound(_) | SessionError::Dial(_) | SessionError::Tls(_) | SessionError::WsUpgrade(_)
        )
    }

    /// SOCKS5 reply code for errors that occur before the CONNECT reply.
    pub fn socks5_reply_code(&self) -> u8 {
        match self {
            SessionError::Inbound(e) => e.reply_code(),
            SessionError::Dial(OutboundDialError::Connect { .. }) => REP_GENERAL_FAILURE,
            SessionError::Dial(OutboundDialError::NoServer) => REP_GENERAL_FAILURE,
            _ => REP_GENERAL_FAILURE,
        }
    }

    /// Severity a worker should log this error at. Malformed-client
    /// traffic is routine noise (debug); everything else involves an
    /// upstream or codec failure worth a warning.
    pub fn log_level(&self) -> pegas_shared::LogLevel {
        match self {
            SessionError::Inbound(_) => pegas_shared::LogLevel::Debug,
            SessionError::Timeout => pegas_shared::LogLevel::Info,
            _ => pegas_shared::LogLevel::Warn,
        }
    }
}
