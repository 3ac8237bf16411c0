//! Function code dispatch.
//!
//! Every handler takes the request PDU data (everything after the function
//! code) and returns the response PDU data, or the exception to report.
//! Handlers touch the banks only through [`DataStore`], so packing and
//! unpacking happen outside the store lock.

use log::{debug, warn};

use super::frame::{
    be_u16, bytes_to_registers, pack_bits, registers_to_bytes, unpack_bits, TcpFrame,
};
use super::protocol::{
    function_code, ExceptionCode, COIL_OFF, COIL_ON, READ_BITS_MAX, READ_REGISTERS_MAX,
    WRITE_COILS_MAX, WRITE_REGISTERS_MAX,
};
use crate::storage::DataStore;

pub type FunctionHandler = fn(&DataStore, &[u8]) -> Result<Vec<u8>, ExceptionCode>;

/// Static mapping from function code to handler.
#[derive(Clone)]
pub struct FunctionTable {
    handlers: [Option<FunctionHandler>; 256],
}

impl Default for FunctionTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(function_code::READ_COILS, read_coils);
        table.register(function_code::READ_DISCRETE_INPUTS, read_discrete_inputs);
        table.register(function_code::READ_HOLDING_REGISTERS, read_holding_registers);
        table.register(function_code::READ_INPUT_REGISTERS, read_input_registers);
        table.register(function_code::WRITE_SINGLE_COIL, write_single_coil);
        table.register(function_code::WRITE_SINGLE_REGISTER, write_single_register);
        table.register(function_code::WRITE_MULTIPLE_COILS, write_multiple_coils);
        table.register(function_code::WRITE_MULTIPLE_REGISTERS, write_multiple_registers);
        table
    }
}

impl FunctionTable {
    /// A table that answers every function code with IllegalFunction.
    pub fn empty() -> Self {
        Self {
            handlers: [None; 256],
        }
    }

    /// Add or replace the handler for `code`.
    pub fn register(&mut self, code: u8, handler: FunctionHandler) {
        self.handlers[usize::from(code)] = Some(handler);
    }

    pub fn handler(&self, code: u8) -> Option<FunctionHandler> {
        self.handlers[usize::from(code)]
    }

    /// Run the handler bound to the request's function code and build the
    /// response frame, normal or exception.
    pub fn dispatch(&self, store: &DataStore, request: &TcpFrame) -> TcpFrame {
        execute(self.handler(request.function), store, request)
    }
}

/// Build the response for `request` with an already looked-up handler, so
/// callers can release the table before user code runs.
pub fn execute(
    handler: Option<FunctionHandler>,
    store: &DataStore,
    request: &TcpFrame,
) -> TcpFrame {
    let mut response = request.reply();

    let result = match handler {
        Some(handler) => handler(store, &request.data),
        None => {
            warn!(
                "Unsupported function code 0x{:02X} (transaction {})",
                request.function, request.transaction_id
            );
            Err(ExceptionCode::IllegalFunction)
        }
    };

    match result {
        Ok(data) => response.set_data(data),
        Err(exception) => {
            debug!(
                "Function 0x{:02X} (transaction {}) failed: {}",
                request.function, request.transaction_id, exception
            );
            response.set_exception(exception);
        }
    }

    response
}

pub fn read_coils(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity) = address_and_quantity(data)?;
    check_quantity(quantity, READ_BITS_MAX)?;
    Ok(bit_response(&store.read_coils(start, quantity)?))
}

pub fn read_discrete_inputs(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity) = address_and_quantity(data)?;
    check_quantity(quantity, READ_BITS_MAX)?;
    Ok(bit_response(&store.read_discrete_inputs(start, quantity)?))
}

pub fn read_holding_registers(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity) = address_and_quantity(data)?;
    check_quantity(quantity, READ_REGISTERS_MAX)?;
    Ok(register_response(&store.read_holding_registers(start, quantity)?))
}

pub fn read_input_registers(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity) = address_and_quantity(data)?;
    check_quantity(quantity, READ_REGISTERS_MAX)?;
    Ok(register_response(&store.read_input_registers(start, quantity)?))
}

pub fn write_single_coil(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (address, value) = address_and_quantity(data)?;
    let on = match value {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(ExceptionCode::IllegalDataValue),
    };
    store.write_coils(address, &[on])?;
    Ok(data.to_vec())
}

pub fn write_single_register(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (address, value) = address_and_quantity(data)?;
    store.write_holding_registers(address, &[value])?;
    Ok(data.to_vec())
}

pub fn write_multiple_coils(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity, values) = write_request(data)?;
    check_quantity(quantity, WRITE_COILS_MAX)?;
    if values.len() != usize::from(quantity).div_ceil(8) {
        return Err(ExceptionCode::IllegalDataValue);
    }

    store.write_coils(start, &unpack_bits(values, usize::from(quantity)))?;
    Ok(echo(start, quantity))
}

pub fn write_multiple_registers(store: &DataStore, data: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
    let (start, quantity, values) = write_request(data)?;
    check_quantity(quantity, WRITE_REGISTERS_MAX)?;
    if values.len() != 2 * usize::from(quantity) {
        return Err(ExceptionCode::IllegalDataValue);
    }

    store.write_holding_registers(start, &bytes_to_registers(values))?;
    Ok(echo(start, quantity))
}

fn address_and_quantity(data: &[u8]) -> Result<(u16, u16), ExceptionCode> {
    if data.len() != 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((be_u16(data, 0), be_u16(data, 2)))
}

// start, quantity, byte count, values; the byte count must match what follows
fn write_request(data: &[u8]) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    if data.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = &data[5..];
    if usize::from(data[4]) != values.len() {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((be_u16(data, 0), be_u16(data, 2), values))
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

fn bit_response(bits: &[bool]) -> Vec<u8> {
    with_byte_count(pack_bits(bits))
}

fn register_response(registers: &[u16]) -> Vec<u8> {
    with_byte_count(registers_to_bytes(registers))
}

// Quantity limits keep the payload below 256 bytes.
fn with_byte_count(payload: Vec<u8>) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(payload.len() as u8);
    data.extend(payload);
    data
}

fn echo(start: u16, quantity: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&start.to_be_bytes());
    data.extend_from_slice(&quantity.to_be_bytes());
    data
}
