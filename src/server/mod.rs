//! Unix-socket front door (C9): newline-delimited JSON over `AF_UNIX`, one
//! request per connection, served by a bounded worker pool.

pub mod handler;
pub mod protocol;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

use crate::error::{EmbedError, Result};
use crate::scheduler::Priority;

use handler::AppState;
use protocol::{processing_heartbeat, Request, Response};

// Tokio's `UnixListener` binds with the platform's default listen backlog,
// which on Linux already exceeds the required minimum of 32.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
const SOCKET_MODE: u32 = 0o660;

/// Removes a stale socket inode, binds at `path` under a restrictive umask,
/// then widens permissions to owner+group immediately after bind.
fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| EmbedError::SocketBind {
            path: path.display().to_string(),
            source,
        })?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| EmbedError::SocketBind {
            path: path.display().to_string(),
            source,
        })?;
    }

    // SAFETY: umask is a process-global syscall with no preconditions; we
    // restore the previous mask immediately after bind.
    let previous_umask = unsafe { libc::umask(0o117) };
    let bind_result = UnixListener::bind(path);
    unsafe { libc::umask(previous_umask) };

    let listener = bind_result.map_err(|source| EmbedError::SocketBind {
        path: path.display().to_string(),
        source,
    })?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(|source| {
        EmbedError::SocketBind {
            path: path.display().to_string(),
            source,
        }
    })?;

    Ok(listener)
}

/// Closes any inherited file descriptor above the three standard streams.
/// Must run before any other resource (cache files, DB pool, socket) opens
/// its own descriptors, or those would be closed too.
pub fn close_inherited_fds() {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if fd > 2 {
            // SAFETY: fds above stdin/stdout/stderr inherited across exec
            // are not referenced by anything we have constructed yet.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Installs the process-wide ignore for `SIGPIPE` so a write to a peer that
/// has already closed its half of the socket surfaces as an `EPIPE` I/O
/// error instead of terminating the process.
pub fn ignore_sigpipe() {
    // SAFETY: SIG_IGN is a valid, static signal disposition; this call has
    // no preconditions beyond running before any thread depends on the
    // default SIGPIPE behaviour, which holds this early in startup.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Runs the accept loop until SIGTERM/SIGINT, then drains in-flight workers
/// before returning. Removing the socket file and PID file is the caller's
/// responsibility once this returns.
pub async fn run(state: Arc<AppState>, socket_path: &Path, max_workers: usize) -> Result<()> {
    let listener = bind(socket_path)?;

    prewarm(&state);

    let semaphore = Arc::new(Semaphore::new(max_workers));
    let shutting_down = Arc::new(AtomicBool::new(false));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if shutting_down.load(Ordering::Relaxed) {
                    continue;
                }
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        // Worker pool saturated; let the connection queue in
                        // the kernel's listen backlog instead of spawning
                        // unboundedly.
                        semaphore.clone().acquire_owned().await.map_err(|e| {
                            EmbedError::Other(format!("semaphore closed: {e}"))
                        })?
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = serve_connection(&state, stream).await {
                        tracing::debug!(error = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, draining");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, draining");
                break;
            }
        }
    }

    shutting_down.store(true, Ordering::Relaxed);
    // Wait for every in-flight worker's guard to be released; queued
    // connections that never acquired a permit are simply dropped when the
    // listener and this function return.
    let _ = semaphore.acquire_many(max_workers as u32).await;

    Ok(())
}

/// If lazy loading has deferred the encoder, issues a one-shot low-priority
/// encode in the background so the first real client doesn't pay the cold
/// load cost. Errors are logged, not propagated: a failed pre-warm still
/// lets the server accept connections and retry on the next real request.
fn prewarm(state: &Arc<AppState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        state.scheduler.acquire(Priority::Low).await;
        if let Err(e) = state.lifecycle.get_or_load().await {
            tracing::warn!(error = %e, "pre-warm encoder load failed, will retry lazily");
        }
    });
}

async fn serve_connection(state: &AppState, stream: UnixStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let line = tokio::time::timeout(CONNECTION_TIMEOUT, lines.next_line()).await;
    let line = match line {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()), // read timeout: close silently, no counter increments.
    };

    let request = match Request::parse(&line) {
        Ok(r) => r,
        Err(e) => {
            return write_response(
                &mut write_half,
                &Response::Error {
                    error: format!("malformed request: {e}"),
                    request_id: None,
                },
            )
            .await;
        }
    };

    let heartbeat = processing_heartbeat(request.request_id().map(str::to_string));
    write_response(&mut write_half, &heartbeat).await?;

    let response = handler::handle(state, request).await;
    write_response(&mut write_half, &response).await
}

async fn write_response<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> std::io::Result<()> {
    let mut body = serde_json::to_vec(response).unwrap_or_else(|_| b"{\"error\":\"response serialization failed\"}".to_vec());
    body.push(b'\n');
    let result = tokio::time::timeout(CONNECTION_TIMEOUT, writer.write_all(&body)).await;
    match result {
        Ok(inner) => inner,
        Err(_) => Ok(()), // write timeout: treat like any other disconnected peer.
    }
}
