//! Unix Socket Command Server
//!
//! Exposes the engine commands to local clients as newline-delimited JSON.
//!
//! # Security Features
//! - **Socket permissions**: owner-only mode with symlink attack prevention
//! - **Connection limits**: maximum concurrent connections enforced
//! - **Timeouts**: read/write timeouts prevent resource exhaustion
//! - **Message limits**: maximum message size prevents memory exhaustion
//! - **Input validation**: request shape is checked before the engine sees it

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use vc_core::{load_config, Result, VortecError};
use vc_protocol::{Request, RequestEnvelope, Response, ResponseData, ResponseEnvelope};

use crate::fan_control::EngineHandle;

// ============================================================================
// Security Constants
// ============================================================================

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 16;

/// Maximum message size in bytes
const MAX_MESSAGE_SIZE: usize = vc_protocol::MAX_MESSAGE_SIZE;

/// Read timeout per message
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout per message
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket permissions (owner read/write only)
const SOCKET_MODE: u32 = 0o600;

/// Everything a connection handler needs
#[derive(Clone)]
struct ServerContext {
    engine: EngineHandle,
    config_path: Arc<PathBuf>,
    connections: Arc<AtomicUsize>,
}

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        if out.len() + take_len > max_len {
            let consume_len = max_len.saturating_sub(out.len()).min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

/// Remove a stale socket file, refusing anything that is not a socket
pub fn prepare_socket_path(path: &Path) -> Result<()> {
    let metadata = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if metadata.file_type().is_symlink() {
        return Err(VortecError::config(format!(
            "socket path {:?} is a symlink - refusing for security",
            path
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(VortecError::config(format!(
                "socket path {:?} exists and is not a socket",
                path
            )));
        }
    }

    std::fs::remove_file(path)?;
    debug!("Removed existing socket file");
    Ok(())
}

/// Serve commands until `shutdown` becomes true
pub async fn run_server(
    socket_path: &Path,
    engine: EngineHandle,
    config_path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    prepare_socket_path(socket_path)?;

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!("Listening on {:?} (mode {:o})", socket_path, SOCKET_MODE);
    info!("Security: max_conn={}, max_msg={}", MAX_CONNECTIONS, MAX_MESSAGE_SIZE);

    let ctx = ServerContext {
        engine,
        config_path: Arc::new(config_path),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let mut total_connections: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ctx.connections.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ctx.connections.fetch_add(1, Ordering::SeqCst);
                        total_connections += 1;
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_client(stream, &ctx).await;
                            ctx.connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = std::fs::remove_file(socket_path) {
        debug!("Could not remove socket: {}", e);
    }
    info!("Server stopped (handled {} total connections)", total_connections);
    Ok(())
}

async fn handle_client(stream: UnixStream, ctx: &ServerContext) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(
            READ_TIMEOUT,
            read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE),
        )
        .await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    "Client disconnected: requests={}, duration={:?}",
                    request_count,
                    connection_start.elapsed()
                );
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("Request #{}: {} bytes", request_count, n);

                let response = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(text, ctx).await,
                    Err(e) => {
                        debug!("Non-UTF8 request: {}", e);
                        ResponseEnvelope::new(0, Response::error("invalid_request", "Invalid request encoding"))
                    }
                };

                if send_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!("Message too large (>{} bytes)", MAX_MESSAGE_SIZE);
                    let response = ResponseEnvelope::new(0, Response::error("invalid_request", "Message too large"));
                    let _ = send_response(&mut writer, &response).await;
                } else {
                    error!("Read error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!("Read timeout after {} requests", request_count);
                break;
            }
        }
    }
}

async fn send_response(writer: &mut OwnedWriteHalf, response: &ResponseEnvelope) -> std::result::Result<(), ()> {
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","kind":"generic","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

fn error_response(e: &VortecError) -> Response {
    Response::error(e.kind(), e.to_string())
}

fn ok_or_error<T>(result: Result<T>, to_data: impl FnOnce(T) -> ResponseData) -> Response {
    match result {
        Ok(v) => Response::Ok(to_data(v)),
        Err(e) => error_response(&e),
    }
}

async fn process_request(line: &str, ctx: &ServerContext) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!("Invalid JSON request: {}", e);
            return ResponseEnvelope::new(0, Response::error("invalid_request", "Invalid request format"));
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;

    if let Err(e) = request.validate() {
        warn!("Request validation failed: {}", e);
        return ResponseEnvelope::new(request_id, Response::error("invalid_request", e));
    }

    debug!("Processing {} (id={})", request.type_name(), request_id);

    let engine = &ctx.engine;
    let response = match request {
        Request::Ping => Response::Ok(ResponseData::string("pong".into())),

        Request::Version => Response::Ok(ResponseData::string(env!("CARGO_PKG_VERSION").into())),

        Request::GetState => ok_or_error(engine.state().await, ResponseData::state),

        Request::GetFan { fan } => ok_or_error(engine.get_fan(&fan).await, ResponseData::fan),

        // Write operations get extra logging
        Request::SetMode { fan, mode } => {
            info!("AUDIT: SetMode fan={} mode={:?}", fan, mode);
            ok_or_error(engine.set_mode(&fan, mode).await, |_| ResponseData::none())
        }

        Request::SetManualSpeed { fan, percent } => {
            info!("AUDIT: SetManualSpeed fan={} percent={}", fan, percent);
            ok_or_error(engine.set_manual_speed(&fan, percent).await, |_| ResponseData::none())
        }

        Request::SetThresholds { fan, thresholds } => {
            info!("AUDIT: SetThresholds fan={} rungs={}", fan, thresholds.len());
            ok_or_error(engine.set_thresholds(&fan, thresholds).await, |_| ResponseData::none())
        }

        Request::ReloadConfig => {
            info!("AUDIT: ReloadConfig from {:?}", ctx.config_path);
            // file I/O stays off the runtime threads
            let path = Arc::clone(&ctx.config_path);
            let loaded = match tokio::task::spawn_blocking(move || load_config(&path)).await {
                Ok(loaded) => loaded,
                Err(e) => Err(VortecError::generic(format!("config load task failed: {}", e))),
            };
            let result = match loaded {
                Ok(config) => engine.reload(config).await,
                Err(e) => Err(e),
            };
            ok_or_error(result, |_| ResponseData::none())
        }
    };

    if let Response::Error { kind, message } = &response {
        debug!("Request {} failed: {} ({})", request_id, message, kind);
    }

    ResponseEnvelope::new(request_id, response)
}
