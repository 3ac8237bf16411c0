//! In-memory Modbus/TCP server
//!
//! This library serves the four Modbus banks (coils, discrete inputs,
//! holding registers and input registers) to any number of Modbus/TCP
//! clients. Requests are decoded from MBAP frames, dispatched by function
//! code against a shared [`DataStore`], and answered with normal or
//! exception responses.
//!
//! ```no_run
//! use mbserver::Server;
//!
//! # async fn run() -> Result<(), mbserver::ModbusError> {
//! let server = Server::new();
//! server.store().set_input_register(0, 1234)?;
//! server.listen_tcp("0.0.0.0:502").await?;
//! // ...
//! server.close().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod modbus;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, RegisterPreset};
pub use modbus::{ExceptionCode, FrameError, FunctionHandler, FunctionTable, RegisterType, TcpFrame};
pub use services::{ConnectionInfo, Request, Server};
pub use storage::DataStore;
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
