//! `proxy` binary entry point: CLI parsing, config load, process-wide
//! logging init, and the reactor-worker-pool / helper-thread startup and
//! shutdown sequence. Spec §5 / §6.
//!
//! Ground: teacher `main.rs`'s `fn main()` (build a tokio runtime, stand
//! up shared `Arc` state, spawn background tasks, hand control to an
//! event loop) reshaped from Tauri's single-runtime GUI shell into the
//! spec's W-worker-plus-helper-thread process, and
//! `original_source/src/pegas.c`'s CLI surface (`-c`, `-t`), exit codes
//! (255 config error, 1 listener failure, 0 clean shutdown), and the
//! literal `signal(SIGPIPE, SIG_IGN)` at startup.

mod codec;
mod config;
mod control;
mod error;
mod helper;
mod logging;
mod metrics;
mod outbound;
mod server;
mod session;
mod worker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pegas_shared::mpsc::Mpsc;
use pegas_shared::{LogRecord, StatDelta};

use crate::logging::LogStore;
use crate::server::ServerManager;

/// Parsed command-line flags. Spec §6: `-c <path>` selects a config
/// file (default: the XDG candidate chain); `-t <n>` overrides the
/// worker thread count. No `clap` here, matching the teacher's
/// preference for hand parsing a two-flag surface this small.
struct Args {
    config_path: Option<PathBuf>,
    worker_threads: Option<usize>,
}

fn parse_args() -> Result<Args, String> {
    let mut config_path = None;
    let mut worker_threads = None;
    let mut iter = std::env::args().skip(1);

    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "-c" => {
                let value = iter.next().ok_or_else(|| "-c requires a path argument".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "-t" => {
                let value = iter.next().ok_or_else(|| "-t requires a thread count argument".to_string())?;
                let n: usize = value.parse().map_err(|_| format!("-t: invalid thread count {value:?}"))?;
                worker_threads = Some(n);
            }
            other => return Err(format!("unrecognized argument {other:?}")),
        }
    }

    Ok(Args { config_path, worker_threads })
}

/// Ignores `SIGPIPE` so a write to a peer that has already reset the
/// connection surfaces as an `EPIPE` `io::Error` instead of killing the
/// process. Ground: `original_source/src/pegas.c`'s `signal(SIGPIPE,
/// SIG_IGN)` at process startup.
#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("pegas: {e}");
            return ExitCode::from(255);
        }
    };

    let config = match config::load(args.config_path.as_deref(), args.worker_threads) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pegas: failed to load config: {e}");
            return ExitCode::from(255);
        }
    };

    ignore_sigpipe();
    logging::init_tracing(&config.log_level, config.log_isatty());

    let local_addr: SocketAddr = match format!("{}:{}", config.local_address, config.local_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("invalid local_address/local_port: {e}");
            return ExitCode::from(255);
        }
    };

    if let Err(e) = worker::validate_bind(local_addr) {
        tracing::error!("failed to bind {local_addr}: {e}");
        return ExitCode::from(1);
    }

    let servers = Arc::new(ServerManager::new(config.servers.clone()));
    let logs: logging::SharedLogStore = Arc::new(LogStore::new());
    let log_queue: Arc<Mpsc<LogRecord>> = Arc::new(Mpsc::new(64));
    let stat_queue: Arc<Mpsc<StatDelta>> = Arc::new(Mpsc::new(64));
    let shutdown = Arc::new(AtomicBool::new(false));
    let idle_timeout = Duration::from_secs(config.timeout);

    tracing::info!(
        "pegas starting: {} worker(s), listening on {local_addr}, {} server(s) configured",
        config.worker_threads,
        servers.len(),
    );

    let mut handles = Vec::with_capacity(config.worker_threads + 1);
    for id in 0..config.worker_threads {
        handles.push(worker::spawn(
            id,
            local_addr,
            servers.clone(),
            idle_timeout,
            log_queue.clone(),
            stat_queue.clone(),
            shutdown.clone(),
        ));
    }
    handles.push(helper::spawn(
        config.clone(),
        servers.clone(),
        logs.clone(),
        log_queue.clone(),
        stat_queue.clone(),
        shutdown.clone(),
    ));

    let main_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build main-thread runtime");
    main_runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    tracing::info!("shutdown signal received, stopping workers");
    shutdown.store(true, Ordering::Release);
    for handle in handles {
        let _ = handle.join();
    }

    ExitCode::SUCCESS
}
