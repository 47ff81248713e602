//! Reactor worker: one OS thread, one single-threaded tokio runtime, one
//! `LocalSet`. Spec §4.4 / SPEC_FULL §5.
//!
//! Ground: teacher `main.rs`'s `tokio::runtime::Runtime::new()` +
//! `runtime.spawn(...)` startup shape, narrowed from the teacher's single
//! shared multi-threaded runtime to W independent current-thread runtimes
//! so that "a session is only ever touched by its owning worker" (spec.md
//! §3) is a property of the runtime, not just a convention; the
//! `SO_REUSEPORT` listener setup follows `other_examples`' `socket2`
//! idiom (`Socket::new` + `set_reuse_address`/`set_reuse_port` before
//! `bind`), generalized from UDP multicast to a shared TCP accept queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pegas_shared::mpsc::Mpsc;
use pegas_shared::{LogRecord, StatDelta};
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

use crate::server::SharedServerManager;
use crate::session;

/// How often the accept loop re-checks the shutdown flag while idle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Binds a `SO_REUSEPORT` listening socket at `addr`. Every worker calls
/// this independently against the same address/port; the kernel
/// load-balances accepted connections across them (spec §4.4: "owns the
/// shared listening socket").
fn bind_reuseport(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Performs one test bind-then-drop at `addr` so a misconfigured address
/// fails fast in `main` before any worker thread is spawned (spec §6:
/// listener bind failure is fatal at startup, exit code 1).
pub fn validate_bind(addr: SocketAddr) -> std::io::Result<()> {
    bind_reuseport(addr).map(drop)
}

/// Spawns one reactor worker OS thread. The thread builds its own
/// current-thread tokio runtime, binds its own `SO_REUSEPORT` listener,
/// and accepts connections onto a `LocalSet` for the runtime's lifetime.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    id: usize,
    addr: SocketAddr,
    servers: SharedServerManager,
    idle_timeout: Duration,
    log_tx: Arc<Mpsc<LogRecord>>,
    stat_tx: Arc<Mpsc<StatDelta>>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("pegas-worker-{id}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, run(id, addr, servers, idle_timeout, log_tx, stat_tx, shutdown));
        })
        .expect("failed to spawn worker thread")
}

async fn run(
    id: usize,
    addr: SocketAddr,
    servers: SharedServerManager,
    idle_timeout: Duration,
    log_tx: Arc<Mpsc<LogRecord>>,
    stat_tx: Arc<Mpsc<StatDelta>>,
    shutdown: Arc<AtomicBool>,
) {
    let listener = match bind_reuseport(addr) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = log_tx.push(crate::logging::record(
                pegas_shared::LogLevel::Error,
                format!("worker {id}: failed to bind {addr}: {e}"),
            ));
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = tokio::time::sleep(SHUTDOWN_POLL) => continue,
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                let _ = log_tx.push(crate::logging::record(
                    pegas_shared::LogLevel::Warn,
                    format!("worker {id}: accept failed: {e}"),
                ));
                continue;
            }
        };

        let servers = servers.clone();
        let log_tx = log_tx.clone();
        let stat_tx = stat_tx.clone();

        tokio::task::spawn_local(async move {
            let stat_sink = {
                let stat_tx = stat_tx.clone();
                move |delta: StatDelta| {
                    let _ = stat_tx.push(delta);
                }
            };

            if let Err(e) = session::run(socket, servers, stat_sink, idle_timeout).await {
                let _ = log_tx.push(crate::logging::record(
                    e.log_level(),
                    format!("session from {peer}: {e}"),
                ));
            }
        });
    }
}
