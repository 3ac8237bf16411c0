use log::{debug, error};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use crate::modbus::protocol::{ExceptionCode, RegisterType, BANK_SIZE};
use crate::utils::error::ModbusError;

/// The four Modbus banks, each holding 65536 entries.
///
/// All banks sit behind one mutex, so every request observes and applies
/// its whole range at once. Range checks happen before any mutation.
pub struct DataStore {
    banks: Mutex<Banks>,
}

struct Banks {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

impl Banks {
    fn new() -> Self {
        Self {
            coils: vec![false; BANK_SIZE],
            discrete_inputs: vec![false; BANK_SIZE],
            holding_registers: vec![0; BANK_SIZE],
            input_registers: vec![0; BANK_SIZE],
        }
    }
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        Self {
            banks: Mutex::new(Banks::new()),
        }
    }

    // Client requests

    pub fn read_coils(&self, start: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        let range = bank_range(start, usize::from(quantity))?;
        Ok(self.lock_for_request()?.coils[range].to_vec())
    }

    pub fn read_discrete_inputs(
        &self,
        start: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        let range = bank_range(start, usize::from(quantity))?;
        Ok(self.lock_for_request()?.discrete_inputs[range].to_vec())
    }

    pub fn read_holding_registers(
        &self,
        start: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        let range = bank_range(start, usize::from(quantity))?;
        Ok(self.lock_for_request()?.holding_registers[range].to_vec())
    }

    pub fn read_input_registers(
        &self,
        start: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        let range = bank_range(start, usize::from(quantity))?;
        Ok(self.lock_for_request()?.input_registers[range].to_vec())
    }

    pub fn write_coils(&self, start: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        let range = bank_range(start, values.len())?;
        self.lock_for_request()?.coils[range].copy_from_slice(values);
        debug!("Wrote {} coils starting at {}", values.len(), start);
        Ok(())
    }

    pub fn write_holding_registers(&self, start: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let range = bank_range(start, values.len())?;
        self.lock_for_request()?.holding_registers[range].copy_from_slice(values);
        debug!("Wrote {} holding registers starting at {}", values.len(), start);
        Ok(())
    }

    // Operator access. Discrete inputs and input registers are writable here
    // even though clients can only read them.

    pub fn coil(&self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.lock()?.coils[usize::from(address)])
    }

    pub fn set_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        self.lock()?.coils[usize::from(address)] = value;
        Ok(())
    }

    pub fn discrete_input(&self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.lock()?.discrete_inputs[usize::from(address)])
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        self.lock()?.discrete_inputs[usize::from(address)] = value;
        Ok(())
    }

    pub fn holding_register(&self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.lock()?.holding_registers[usize::from(address)])
    }

    pub fn set_holding_register(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        self.lock()?.holding_registers[usize::from(address)] = value;
        Ok(())
    }

    pub fn input_register(&self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.lock()?.input_registers[usize::from(address)])
    }

    pub fn set_input_register(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        self.lock()?.input_registers[usize::from(address)] = value;
        Ok(())
    }

    /// Load a block of values into any bank. For bit banks a non-zero value
    /// means on.
    pub fn load_preset(
        &self,
        register_type: RegisterType,
        start: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let range = bank_range(start, values.len()).map_err(|_| {
            ModbusError::InvalidData(format!(
                "{} values at {} {} overflow the bank",
                values.len(),
                register_type,
                start
            ))
        })?;

        let mut banks = self.lock()?;
        match register_type {
            RegisterType::Coil => copy_bits(&mut banks.coils[range], values),
            RegisterType::Discrete => copy_bits(&mut banks.discrete_inputs[range], values),
            RegisterType::Holding => banks.holding_registers[range].copy_from_slice(values),
            RegisterType::Input => banks.input_registers[range].copy_from_slice(values),
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Banks>, ModbusError> {
        self.banks.lock().map_err(|_| ModbusError::LockError)
    }

    fn lock_for_request(&self) -> Result<MutexGuard<'_, Banks>, ExceptionCode> {
        self.banks.lock().map_err(|_| {
            error!("Data store lock poisoned, answering with server device failure");
            ExceptionCode::ServerDeviceFailure
        })
    }
}

fn bank_range(start: u16, quantity: usize) -> Result<Range<usize>, ExceptionCode> {
    let start = usize::from(start);
    let end = start + quantity;
    if end > BANK_SIZE {
        debug!("Range {}..{} exceeds bank size {}", start, end, BANK_SIZE);
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

fn copy_bits(bank: &mut [bool], values: &[u16]) {
    for (slot, value) in bank.iter_mut().zip(values) {
        *slot = *value != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banks_start_empty() {
        let store = DataStore::new();
        assert_eq!(store.read_coils(0, 8).unwrap(), vec![false; 8]);
        assert_eq!(store.read_input_registers(65530, 6).unwrap(), vec![0; 6]);
    }

    #[test]
    fn test_write_then_read_holding_registers() {
        let store = DataStore::new();
        store.write_holding_registers(1, &[3, 4]).unwrap();

        assert_eq!(store.read_holding_registers(0, 4).unwrap(), vec![0, 3, 4, 0]);
        assert_eq!(store.holding_register(2).unwrap(), 4);
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let store = DataStore::new();
        assert_eq!(store.read_coils(65535, 2), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(store.read_input_registers(65535, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_rejected_write_leaves_bank_untouched() {
        let store = DataStore::new();
        store.set_holding_register(65535, 7).unwrap();

        let result = store.write_holding_registers(65534, &[1, 2, 3]);
        assert_eq!(result, Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(store.holding_register(65534).unwrap(), 0);
        assert_eq!(store.holding_register(65535).unwrap(), 7);
    }

    #[test]
    fn test_operator_access_to_read_only_banks() {
        let store = DataStore::new();
        store.set_input_register(65535, 65535).unwrap();
        store.set_discrete_input(3, true).unwrap();

        assert_eq!(store.read_input_registers(65535, 1).unwrap(), vec![65535]);
        assert_eq!(store.read_discrete_inputs(0, 4).unwrap(), vec![false, false, false, true]);
    }

    #[test]
    fn test_load_preset() {
        let store = DataStore::new();
        store.load_preset(RegisterType::Coil, 10, &[1, 0, 5]).unwrap();
        store.load_preset(RegisterType::Input, 0, &[1234, 5678]).unwrap();

        assert_eq!(store.read_coils(10, 3).unwrap(), vec![true, false, true]);
        assert_eq!(store.input_register(1).unwrap(), 5678);
        assert!(store.load_preset(RegisterType::Holding, 65535, &[1, 2]).is_err());
    }
}
