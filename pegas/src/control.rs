//! Control plane: newline-delimited JSON over a persistent TCP or
//! Unix-domain-socket connection. Spec §4.7.
//!
//! Ground: teacher `handler.rs`'s `CommandRouter` (one `dispatch` match
//! over a tagged request enum, replying with a tagged response) adapted
//! from the teacher's length-prefixed binary frames to the spec's
//! line-delimited JSON, and from a multi-client shell RAT surface to the
//! four read-only/administrative commands spec.md §4.7 lists.

use std::time::Duration;

use pegas_shared::{ControlRequest, ControlResponse, ControlServerInfo};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::logging::SharedLogStore;
use crate::server::SharedServerManager;

/// Per-request deadline (spec §6: "control-plane requests carry a 5 s
/// deadline").
const CONTROL_DEADLINE: Duration = Duration::from_secs(5);
/// Line length past which a request is rejected rather than buffered
/// without bound.
const MAX_LINE: usize = 64 * 1024;

/// Accepts connections on `control_port` until the listener errors.
/// Called from the helper thread's `LocalSet`.
pub async fn serve_tcp(port: u16, servers: SharedServerManager, logs: SharedLogStore) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let servers = servers.clone();
        let logs = logs.clone();
        tokio::task::spawn_local(async move {
            handle_connection(stream, servers, logs).await;
        });
    }
}

/// Accepts connections on a Unix-domain socket at `path`, used when
/// `control_port` is 0 and `control_file` is set (spec §6).
#[cfg(unix)]
pub async fn serve_uds(path: &str, servers: SharedServerManager, logs: SharedLogStore) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    loop {
        let (stream, _) = listener.accept().await?;
        let servers = servers.clone();
        let logs = logs.clone();
        tokio::task::spawn_local(async move {
            handle_connection(stream, servers, logs).await;
        });
    }
}

/// Drives one control connection: reads lines of JSON, dispatches each,
/// writes back a JSON response line, until EOF or a malformed line.
async fn handle_connection<S>(stream: S, servers: SharedServerManager, logs: SharedLogStore)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let next_line = tokio::time::timeout(CONTROL_DEADLINE, lines.next_line()).await;
        let line = match next_line {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return,
            Ok(Err(_)) | Err(_) => return,
        };
        if line.len() > MAX_LINE {
            let _ = write_response(&mut writer, &ControlResponse::error("request line too long")).await;
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => dispatch(request, &servers, &logs),
            Err(e) => ControlResponse::error(format!("malformed request: {e}")),
        };

        if write_response(&mut writer, &response).await.is_err() {
            return;
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ControlResponse) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response).unwrap_or_else(|_| b"{\"code\":1}".to_vec());
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Executes one request against the live server manager / log store.
fn dispatch(request: ControlRequest, servers: &SharedServerManager, logs: &SharedLogStore) -> ControlResponse {
    match request {
        ControlRequest::ListServers => {
            let active = servers.active_index();
            let infos = servers
                .descriptors()
                .iter()
                .enumerate()
                .map(|(index, descriptor)| {
                    let stats = servers.stats(index).unwrap_or_default();
                    ControlServerInfo {
                        index,
                        address: descriptor.address.clone(),
                        port: descriptor.port,
                        server_type: descriptor.server_type,
                        connect_delay_ms: stats.connect_delay_ms,
                        g204_delay_ms: stats.g204_delay_ms,
                        conn_count: stats.conn_count,
                        active: index == active,
                    }
                })
                .collect();
            ControlResponse {
                servers: Some(infos),
                ..ControlResponse::ok()
            }
        }
        ControlRequest::GetActive => ControlResponse {
            active: Some(servers.active_index()),
            ..ControlResponse::ok()
        },
        ControlRequest::SetActive { index } => {
            if servers.set_active(index) {
                ControlResponse::ok()
            } else {
                ControlResponse::error(format!("server index {index} out of range"))
            }
        }
        ControlRequest::TailLogs => ControlResponse {
            logs: Some(logs.tail(200)),
            ..ControlResponse::ok()
        },
    }
}
