//! Types shared between the proxy binary's modules: server descriptors,
//! the lock-free MPSC ring buffer, and the control-plane wire format.

pub mod mpsc;

use serde::{Deserialize, Serialize};

/// Outbound transport variant selected per server. See spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    TrojanWs,
    TrojanGfw,
    V2rayTcp,
    V2rayWs,
}

/// Immutable-after-load description of one configured upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub address: String,
    pub port: u16,
    pub server_type: ServerType,
    #[serde(default)]
    pub sni: Option<String>,
    pub password_or_uuid: String,
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub tls_insecure: bool,
}

/// Mutable per-server stats, owned by the server manager and written
/// solely by the helper thread draining the stat queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub connect_delay_ms: u32,
    pub g204_delay_ms: u32,
    pub last_checked_ms: u64,
    pub conn_count: u32,
}

/// Sentinel recorded for an unreachable/unhealthy server probe.
pub const STAT_UNHEALTHY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    /// Numeric severity; lower is more severe. Used to gate MPSC pushes
    /// against the configured `log_level`.
    pub fn severity(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
        }
    }
}

/// One record pushed onto the log MPSC queue by any worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub text: String,
    pub at_ms: u64,
}

/// Kind of stat delta carried on the stat MPSC queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    ConnectDelay,
    G204Delay,
    ConnCount,
}

/// One record pushed onto the stat MPSC queue by any worker or the
/// metrics prober.
#[derive(Debug, Clone, Copy)]
pub struct StatDelta {
    pub server_idx: usize,
    pub kind: StatKind,
    pub value: u32,
}

/// Tagged union actually carried on the MPSC queues (spec §3 "MPSC message").
#[derive(Debug, Clone)]
pub enum MpscMessage {
    Log(LogRecord),
    Stat(StatDelta),
}

/// Control-plane request, one line of JSON per spec §4.7 / §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    ListServers,
    GetActive,
    SetActive { index: usize },
    TailLogs,
}

/// Control-plane response, one line of JSON per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ControlServerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogRecord>>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        ControlResponse {
            code: 0,
            message: None,
            servers: None,
            active: None,
            logs: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse {
            code: 1,
            message: Some(message.into()),
            servers: None,
            active: None,
            logs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlServerInfo {
    pub index: usize,
    pub address: String,
    pub port: u16,
    pub server_type: ServerType,
    pub connect_delay_ms: u32,
    pub g204_delay_ms: u32,
    pub conn_count: u32,
    pub active: bool,
}
