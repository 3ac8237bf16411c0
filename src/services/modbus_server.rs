//! Modbus/TCP server lifecycle.
//!
//! [`Server`] owns the data store, the dispatch table and one accept task per
//! listening address. Each accepted connection runs in its own task (see
//! [`super::socket_server`]); the data store is the only state those tasks
//! share.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::socket_server;
use crate::config::Config;
use crate::modbus::functions;
use crate::modbus::protocol::MAX_ADU_LEN;
use crate::modbus::{ExceptionCode, FunctionHandler, FunctionTable, TcpFrame};
use crate::storage::DataStore;
use crate::utils::error::ModbusError;

/// A decoded frame together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Request {
    pub peer_addr: SocketAddr,
    pub frame: TcpFrame,
}

impl Request {
    pub fn new(peer_addr: SocketAddr, frame: TcpFrame) -> Self {
        Self { peer_addr, frame }
    }

    /// Decode one ADU received from `peer_addr`.
    pub fn decode(peer_addr: SocketAddr, adu: &[u8]) -> Result<Self, ModbusError> {
        Ok(Self::new(peer_addr, TcpFrame::decode(adu)?))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// State shared between the server handle, accept loops and connections.
pub(crate) struct ServerState {
    pub(crate) store: DataStore,
    functions: RwLock<FunctionTable>,
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_connection_id: AtomicU64,
    pub(crate) read_buffer_size: usize,
    pub(crate) max_connections: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) fragment_timeout: Duration,
}

impl ServerState {
    pub(crate) fn handle(&self, request: &Request) -> TcpFrame {
        // The table lock is released before the handler runs.
        let handler = match self.functions.read() {
            Ok(table) => table.handler(request.frame.function),
            Err(_) => {
                error!("Function table lock poisoned");
                let mut response = request.frame.reply();
                response.set_exception(ExceptionCode::ServerDeviceFailure);
                return response;
            }
        };
        functions::execute(handler, &self.store, &request.frame)
    }

    pub(crate) fn register_connection(&self, peer_addr: SocketAddr) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(
                id,
                ConnectionInfo {
                    id,
                    peer_addr,
                    connected_at: Utc::now(),
                },
            );
        }
        id
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(&id);
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }
}

pub struct Server {
    name: String,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// A server with empty banks and the default function table.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// Connection settings come from `config`; presets are not applied here,
    /// see [`Config::apply_presets`]. The read buffer never drops below one
    /// full ADU.
    pub fn with_config(config: &Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: config.server_name.clone(),
            state: Arc::new(ServerState {
                store: DataStore::new(),
                functions: RwLock::new(FunctionTable::default()),
                connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
                read_buffer_size: config.read_buffer_size.max(MAX_ADU_LEN),
                max_connections: config.max_connections,
                shutdown_timeout: config.shutdown_timeout(),
                fragment_timeout: config.fragment_timeout(),
            }),
            shutdown,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &DataStore {
        &self.state.store
    }

    /// Add a handler for a new function code or replace a built-in one.
    pub fn register_function_handler(
        &self,
        function_code: u8,
        handler: FunctionHandler,
    ) -> Result<(), ModbusError> {
        let mut table = self.state.functions.write().map_err(|_| ModbusError::LockError)?;
        table.register(function_code, handler);
        info!("Registered handler for function code 0x{:02X}", function_code);
        Ok(())
    }

    /// Dispatch one request against the store without any socket involved.
    pub fn handle(&self, request: &Request) -> TcpFrame {
        self.state.handle(request)
    }

    /// Bind `address` and serve it from a new accept task. Returns the bound
    /// address, which differs from `address` when port 0 was requested.
    pub async fn listen_tcp(&self, address: &str) -> Result<SocketAddr, ModbusError> {
        if self.is_closed() {
            return Err(ModbusError::ServiceNotAvailable(format!(
                "{} is closed",
                self.name
            )));
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ModbusError::BindError {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(socket_server::accept_loop(
            listener,
            Arc::clone(&self.state),
            self.shutdown.subscribe(),
        ));
        self.listeners
            .lock()
            .map_err(|_| ModbusError::LockError)?
            .push(handle);

        info!("🔌 {} listening on {}", self.name, local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close every open connection and release the
    /// listeners. Waits at most the configured shutdown timeout per listener
    /// before aborting it. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("🛑 Stopping {}...", self.name);
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = match self.listeners.lock() {
            Ok(mut listeners) => listeners.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        // The accept loop spends up to the same timeout draining its
        // connections, so give it a little extra before aborting.
        let grace = self.state.shutdown_timeout + Duration::from_millis(100);
        for mut handle in handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Accept loop ended abnormally: {}", e),
                Err(_) => {
                    warn!("Accept loop did not stop within {:?}, aborting", grace);
                    handle.abort();
                }
            }
        }

        info!("✅ {} stopped", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .connections
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::protocol::function_code;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_unsupported_function() {
        let server = Server::new();
        let frame = TcpFrame {
            function: 255,
            ..Default::default()
        };

        let response = server.handle(&Request::new(peer(), frame));
        assert_eq!(response.exception(), Some(ExceptionCode::IllegalFunction));
    }

    #[test]
    fn test_handle_reads_preseeded_store() {
        let server = Server::new();
        server.store().set_holding_register(3, 0xBEEF).unwrap();

        let mut frame = TcpFrame {
            transaction_id: 5,
            function: function_code::READ_HOLDING_REGISTERS,
            ..Default::default()
        };
        frame.set_data_with_register_and_number(3, 1);

        let response = server.handle(&Request::new(peer(), frame));
        assert_eq!(response.transaction_id, 5);
        assert_eq!(response.data, vec![2, 0xBE, 0xEF]);
    }

    #[test]
    fn test_register_function_handler() {
        fn echo_pdu(_: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
            Ok(data.to_vec())
        }

        let server = Server::new();
        server.register_function_handler(0x41, echo_pdu).unwrap();

        let mut frame = TcpFrame {
            function: 0x41,
            ..Default::default()
        };
        frame.set_data(vec![1, 2, 3]);

        let response = server.handle(&Request::new(peer(), frame));
        assert_eq!(response.function, 0x41);
        assert_eq!(response.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_buffer_holds_full_adu() {
        let config = Config {
            read_buffer_size: 0,
            ..Config::default()
        };
        let server = Server::with_config(&config);
        assert_eq!(server.state.read_buffer_size, MAX_ADU_LEN);

        let server = Server::with_config(&Config::default());
        assert_eq!(server.state.read_buffer_size, 512);
    }

    #[test]
    fn test_request_decode_reports_frame_error() {
        let err = Request::decode(peer(), &[0, 1, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::FrameError(crate::modbus::FrameError::TooShort { len: 4 })
        ));

        let request = Request::decode(peer(), &[0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1]).unwrap();
        assert_eq!(request.frame.unit_id, 1);
        assert_eq!(request.frame.data, vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_close_without_listeners() {
        let server = Server::new();
        server.close().await;
        server.close().await;

        assert!(server.is_closed());
        assert!(matches!(
            server.listen_tcp("127.0.0.1:0").await,
            Err(ModbusError::ServiceNotAvailable(_))
        ));
    }
}
