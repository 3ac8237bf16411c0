pub mod modbus_server;
mod socket_server;

pub use modbus_server::{ConnectionInfo, Request, Server};
