use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};

use super::modbus_server::{Request, ServerState};
use crate::modbus::frame::split_packet;
use crate::utils::error::ModbusError;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Removes the connection from the registry however its task ends.
struct ConnectionGuard {
    state: Arc<ServerState>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.unregister_connection(self.id);
    }
}

/// Accept connections until shutdown, then wait for the connection tasks to
/// finish and abort whatever is left after the shutdown timeout.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let limit = state.max_connections;
                    if limit > 0 && state.connection_count() >= limit {
                        warn!("Connection limit ({}) reached, refusing {}", limit, peer_addr);
                        continue;
                    }

                    let id = state.register_connection(peer_addr);
                    info!("🔗 Client {} connected (connection {})", peer_addr, id);

                    let guard = ConnectionGuard { state: Arc::clone(&state), id };
                    connections.spawn(serve_connection(stream, peer_addr, guard, shutdown.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    debug!("Listener released, waiting for {} connection(s)", connections.len());

    let drain = async {
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Connection task panicked: {}", e);
                }
            }
        }
    };
    if timeout(state.shutdown_timeout, drain).await.is_err() {
        warn!("Connections still open after {:?}, aborting them", state.shutdown_timeout);
        connections.shutdown().await;
    }
}

/// Per-connection loop: read, answer every complete ADU received so far,
/// repeat. An ADU split across reads is kept until the rest arrives or the
/// fragment timeout expires. Ends on EOF, transport error or server shutdown.
async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    guard: ConnectionGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let state = Arc::clone(&guard.state);
    let mut pending = BytesMut::with_capacity(state.read_buffer_size);

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        pending.reserve(state.read_buffer_size);
        let waiting = !pending.is_empty();

        let read = tokio::select! {
            read = stream.read_buf(&mut pending) => Some(read),
            _ = sleep(state.fragment_timeout), if waiting => None,
            _ = shutdown.changed() => break,
        };

        let len = match read {
            None => {
                warn!(
                    "Dropping incomplete frame from {}: {}",
                    peer_addr,
                    hex::encode(&pending)
                );
                pending.clear();
                continue;
            }
            Some(Ok(0)) => {
                info!("🔌 Client {} disconnected", peer_addr);
                break;
            }
            Some(Ok(len)) => len,
            Some(Err(e)) => {
                warn!("Read error from {}: {}", peer_addr, e);
                break;
            }
        };

        debug!(
            "📥 {} bytes from {}: {}",
            len,
            peer_addr,
            hex::encode(&pending[pending.len() - len..])
        );

        let answered = respond(&mut stream, &pending, peer_addr, &state).await;
        match answered {
            Ok(consumed) => pending.advance(consumed),
            Err(e) => {
                warn!("Closing connection to {}: {}", peer_addr, e);
                break;
            }
        }
    }

    debug!("Connection {} to {} closed", guard.id, peer_addr);
}

/// Answer each complete ADU in `received` in order and return how many
/// bytes were used up. Malformed frames are dropped without a reply; only
/// write failures end the connection.
async fn respond(
    stream: &mut TcpStream,
    received: &[u8],
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<usize, ModbusError> {
    let split = split_packet(received);
    if !split.discarded.is_empty() {
        warn!(
            "Discarding {} unframed bytes from {}: {}",
            split.discarded.len(),
            peer_addr,
            hex::encode(split.discarded)
        );
    }

    for adu in &split.adus {
        let request = match Request::decode(peer_addr, adu) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping frame from {}: {}", peer_addr, e);
                continue;
            }
        };

        let response = state.handle(&request).encode();
        debug!("📤 {} bytes to {}: {}", response.len(), peer_addr, hex::encode(&response));

        stream.write_all(&response).await?;
    }
    Ok(split.consumed())
}
