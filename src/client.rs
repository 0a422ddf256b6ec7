//! Synchronous request/response client for the BMU.
//!
//! Every call writes one request frame and reads back exactly one response
//! frame. Deadline expiries and corrupted frames are retried transparently as
//! the [`RetryPolicy`] allows; everything else is returned as an [`Error`].
//!
//! # Example
//!
//! ```no_run
//! use ninebot_bms_lib::client::BmuClient;
//!
//! fn main() -> Result<(), ninebot_bms_lib::Error> {
//!     let mut bmu = BmuClient::new("192.168.88.82:1234");
//!     let capacity = bmu.get_remaining_capacity()?;
//!     println!("Remaining: {capacity} mAh");
//!     Ok(())
//! }
//! ```

use crate::connection::{is_deadline_exceeded, Connect, ConnectionManager, TcpConnector};
use crate::protocol::*;
use crate::retry::{Immediate, Retry, RetryPolicy, Transient};
use crate::{Error, Result};
use std::time::Duration;

/// Number of cells read by `get_cell_voltages()` unless configured otherwise.
pub const DEFAULT_CELLS: u8 = 10;

#[derive(Debug)]
pub struct BmuClient<C: Connect = TcpConnector, P: RetryPolicy = Immediate> {
    connection: ConnectionManager<C>,
    policy: P,
    cells: u8,
}

impl BmuClient {
    /// Client for a BMU reachable at `address` (`host:port`). No connection
    /// is made until the first request.
    pub fn new(address: &str) -> Self {
        Self::with_connector(TcpConnector::new(address), Immediate)
    }
}

impl<C: Connect, P: RetryPolicy> BmuClient<C, P> {
    pub fn with_connector(connector: C, policy: P) -> Self {
        Self {
            connection: ConnectionManager::new(connector),
            policy,
            cells: DEFAULT_CELLS,
        }
    }

    /// Replaces the retry policy.
    pub fn with_policy<Q: RetryPolicy>(self, policy: Q) -> BmuClient<C, Q> {
        BmuClient {
            connection: self.connection,
            policy,
            cells: self.cells,
        }
    }

    /// Sets the deadline for one request attempt.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Sets the number of cells read by `get_cell_voltages()`, at most
    /// [`MAX_CELLS`].
    pub fn set_cells(&mut self, cells: u8) {
        if cells > MAX_CELLS {
            log::warn!("Cannot read {cells} cells, reading {MAX_CELLS}");
        }
        self.cells = cells.min(MAX_CELLS);
    }

    pub fn cells(&self) -> u8 {
        self.cells
    }

    /// Sends `tx_buffer` and returns the validated response.
    pub fn request(&mut self, tx_buffer: &[u8]) -> Result<Response> {
        self.policy.reset();
        let mut attempt: u32 = 0;
        loop {
            self.connection.ensure(false)?;
            let reason = match self.attempt(tx_buffer)? {
                Ok(response) => return Ok(response),
                Err(reason) => reason,
            };
            attempt = attempt.saturating_add(1);
            match self.policy.next(attempt, reason) {
                Retry::Now => log::debug!("Failed try {attempt}, repeating ({reason})"),
                Retry::After(delay) => {
                    log::debug!("Failed try {attempt}, repeating in {delay:?} ({reason})");
                    std::thread::sleep(delay);
                }
                Retry::GiveUp => {
                    return Err(Error::RetriesExhausted {
                        attempts: attempt,
                        last: reason,
                    })
                }
            }
        }
    }

    /// Runs one write/read/decode round. The outer `Result` carries fatal
    /// errors, the inner one the transient failure to retry on.
    fn attempt(&mut self, tx_buffer: &[u8]) -> Result<std::result::Result<Response, Transient>> {
        if let Err(err) = self.connection.write_frame(tx_buffer) {
            if is_deadline_exceeded(&err) {
                log::warn!("Timeout writing to {}: {err}", self.connection.endpoint());
                self.connection.ensure(true)?;
                return Ok(Err(Transient::WriteTimeout));
            }
            return Err(Error::Write(err));
        }

        let rx_buffer = match self.connection.read_frame() {
            Ok(rx_buffer) => rx_buffer,
            Err(err) if is_deadline_exceeded(&err) => {
                log::warn!("Timeout reading from {}: {err}", self.connection.endpoint());
                self.connection.ensure(true)?;
                return Ok(Err(Transient::ReadTimeout));
            }
            Err(err) => return Err(Error::Read(err)),
        };

        match Response::decode(&rx_buffer) {
            Ok(response) => Ok(Ok(response)),
            Err(err) if err.is_retryable() => {
                log::warn!("Discarding response: {err}");
                Ok(Err(Transient::Checksum))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads `len` raw bytes starting at register `address`.
    pub fn read_register(&mut self, address: u8, len: u8) -> Result<Vec<u8>> {
        log::trace!("read register {address:#04X} len={len}");
        Ok(self.request(&encode_request(address, len))?.payload)
    }

    fn read(&mut self, register: Register) -> Result<Vec<u8>> {
        Ok(self.request(&register.request())?.payload)
    }

    fn read_i16(&mut self, register: Register) -> Result<i16> {
        decode_i16(register.address(), &self.read(register)?)
    }

    pub fn get_status(&mut self) -> Result<u16> {
        Ok(self.read_i16(Register::Status)? as u16)
    }

    pub fn get_serial_number(&mut self) -> Result<String> {
        Ok(decode_serial_number(&self.read(Register::SerialNumber)?))
    }

    pub fn get_remaining_capacity_percent(&mut self) -> Result<i16> {
        self.read_i16(Register::RemainingCapacityPercent)
    }

    /// mAh
    pub fn get_remaining_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::RemainingCapacity)
    }

    /// mAh
    pub fn get_actual_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::ActualCapacity)
    }

    /// mAh
    pub fn get_factory_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::FactoryCapacity)
    }

    /// A, negative while charging
    pub fn get_current(&mut self) -> Result<f64> {
        decode_scaled(Register::Current.address(), &self.read(Register::Current)?)
    }

    /// V
    pub fn get_voltage(&mut self) -> Result<f64> {
        decode_scaled(Register::Voltage.address(), &self.read(Register::Voltage)?)
    }

    /// °C, one value per zone
    pub fn get_temperatures(&mut self) -> Result<Vec<i32>> {
        Ok(decode_temperatures(&self.read(Register::Temperature)?))
    }

    /// mV, one value per cell
    pub fn get_cell_voltages(&mut self) -> Result<Vec<i16>> {
        let payload = self.request(&cell_voltages_request(self.cells))?.payload;
        decode_cell_voltages(&payload, self.cells)
    }

    /// Reads every register of one polling cycle.
    pub fn read_snapshot(&mut self) -> Result<Snapshot> {
        Ok(Snapshot {
            status: self.get_status()?,
            serial_number: self.get_serial_number()?,
            remaining_capacity_percent: self.get_remaining_capacity_percent()?,
            remaining_capacity: self.get_remaining_capacity()?,
            actual_capacity: self.get_actual_capacity()?,
            factory_capacity: self.get_factory_capacity()?,
            current: self.get_current()?,
            voltage: self.get_voltage()?,
            temperatures: self.get_temperatures()?,
            cell_voltages: self.get_cell_voltages()?,
        })
    }
}
