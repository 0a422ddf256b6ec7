//! Provides an asynchronous client for the BMU using Tokio.
//!
//! Every write and every frame read races against the request deadline; when
//! the timer wins the pending I/O future is dropped, the connection is
//! replaced and the request is sent again, exactly like the synchronous
//! client does.
//!
//! # Example
//!
//! ```no_run
//! use ninebot_bms_lib::tokio_async::BmuClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ninebot_bms_lib::Error> {
//!     let mut bmu = BmuClient::new("192.168.88.82:1234");
//!     bmu.set_timeout(Duration::from_millis(500));
//!
//!     let snapshot = bmu.read_snapshot().await?;
//!     println!("Snapshot: {:?}", snapshot);
//!     Ok(())
//! }
//! ```

use crate::client::DEFAULT_CELLS;
use crate::connection::{is_deadline_exceeded, DEFAULT_TIMEOUT};
use crate::protocol::*;
use crate::retry::{Immediate, Retry, RetryPolicy, Transient};
use crate::{Error, Result};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

#[derive(Debug)]
pub struct BmuClient<P: RetryPolicy = Immediate> {
    address: String,
    stream: Option<BufReader<TcpStream>>,
    io_timeout: Duration,
    deadline: Instant,
    policy: P,
    cells: u8,
}

/// Reads one frame, sized by its length byte.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut rx_buffer = Vec::with_capacity(FRAME_OVERHEAD);
    let mut awaited_len = None;
    loop {
        rx_buffer.push(reader.read_u8().await?);
        if rx_buffer.len() == LENGTH_INDEX + 1 {
            awaited_len = Some(rx_buffer[LENGTH_INDEX] as usize + FRAME_OVERHEAD);
        }
        match awaited_len {
            Some(total) if rx_buffer.len() == total => return Ok(rx_buffer),
            _ => {}
        }
    }
}

fn elapsed() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

impl BmuClient {
    pub fn new(address: &str) -> Self {
        Self::with_policy(address, Immediate)
    }
}

impl<P: RetryPolicy> BmuClient<P> {
    pub fn with_policy(address: &str, policy: P) -> Self {
        Self {
            address: address.to_string(),
            stream: None,
            io_timeout: DEFAULT_TIMEOUT,
            deadline: Instant::now(),
            policy,
            cells: DEFAULT_CELLS,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Sets the number of cells read by `get_cell_voltages()`, at most
    /// [`MAX_CELLS`].
    pub fn set_cells(&mut self, cells: u8) {
        if cells > MAX_CELLS {
            log::warn!("Cannot read {cells} cells, reading {MAX_CELLS}");
        }
        self.cells = cells.min(MAX_CELLS);
    }

    async fn ensure(&mut self, force_reconnect: bool) -> Result<()> {
        if force_reconnect || self.stream.is_none() {
            if let Some(mut stream) = self.stream.take() {
                if let Err(err) = stream.shutdown().await {
                    log::debug!("Ignoring error on close: {err}");
                }
            }
            log::info!("Connecting to {}...", self.address);
            let stream = timeout(self.io_timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| elapsed())
                .and_then(|connected| connected)
                .map_err(|source| Error::Connect {
                    endpoint: self.address.clone(),
                    source,
                })?;
            self.stream = Some(BufReader::new(stream));
            log::info!("Connected to {}", self.address);
        }
        self.deadline = Instant::now() + self.io_timeout;
        Ok(())
    }

    fn stream(&mut self) -> io::Result<&mut BufReader<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }

    async fn write_frame(&mut self, tx_buffer: &[u8]) -> io::Result<()> {
        let deadline = self.deadline;
        let stream = self.stream()?;
        log::trace!("write bytes: {tx_buffer:02X?}");
        timeout_at(deadline, async {
            stream.write_all(tx_buffer).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| elapsed())?
    }

    async fn receive_frame(&mut self) -> io::Result<Vec<u8>> {
        let deadline = self.deadline;
        let stream = self.stream()?;
        let rx_buffer = timeout_at(deadline, read_frame(stream))
            .await
            .map_err(|_| elapsed())??;
        log::trace!("receive bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    async fn attempt(
        &mut self,
        tx_buffer: &[u8],
    ) -> Result<std::result::Result<Response, Transient>> {
        if let Err(err) = self.write_frame(tx_buffer).await {
            if is_deadline_exceeded(&err) {
                log::warn!("Timeout writing to {}: {err}", self.address);
                self.ensure(true).await?;
                return Ok(Err(Transient::WriteTimeout));
            }
            return Err(Error::Write(err));
        }

        let rx_buffer = match self.receive_frame().await {
            Ok(rx_buffer) => rx_buffer,
            Err(err) if is_deadline_exceeded(&err) => {
                log::warn!("Timeout reading from {}: {err}", self.address);
                self.ensure(true).await?;
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

    /// Sends `tx_buffer` and returns the validated response.
    pub async fn request(&mut self, tx_buffer: &[u8]) -> Result<Response> {
        self.policy.reset();
        let mut attempt: u32 = 0;
        loop {
            self.ensure(false).await?;
            let reason = match self.attempt(tx_buffer).await? {
                Ok(response) => return Ok(response),
                Err(reason) => reason,
            };
            attempt = attempt.saturating_add(1);
            match self.policy.next(attempt, reason) {
                Retry::Now => log::debug!("Failed try {attempt}, repeating ({reason})"),
                Retry::After(delay) => {
                    log::debug!("Failed try {attempt}, repeating in {delay:?} ({reason})");
                    tokio::time::sleep(delay).await;
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

    pub async fn read_register(&mut self, address: u8, len: u8) -> Result<Vec<u8>> {
        Ok(self.request(&encode_request(address, len)).await?.payload)
    }

    async fn read(&mut self, register: Register) -> Result<Vec<u8>> {
        Ok(self.request(&register.request()).await?.payload)
    }

    async fn read_i16(&mut self, register: Register) -> Result<i16> {
        decode_i16(register.address(), &self.read(register).await?)
    }

    pub async fn get_status(&mut self) -> Result<u16> {
        Ok(self.read_i16(Register::Status).await? as u16)
    }

    pub async fn get_serial_number(&mut self) -> Result<String> {
        Ok(decode_serial_number(&self.read(Register::SerialNumber).await?))
    }

    pub async fn get_remaining_capacity_percent(&mut self) -> Result<i16> {
        self.read_i16(Register::RemainingCapacityPercent).await
    }

    pub async fn get_remaining_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::RemainingCapacity).await
    }

    pub async fn get_actual_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::ActualCapacity).await
    }

    pub async fn get_factory_capacity(&mut self) -> Result<i16> {
        self.read_i16(Register::FactoryCapacity).await
    }

    pub async fn get_current(&mut self) -> Result<f64> {
        decode_scaled(
            Register::Current.address(),
            &self.read(Register::Current).await?,
        )
    }

    pub async fn get_voltage(&mut self) -> Result<f64> {
        decode_scaled(
            Register::Voltage.address(),
            &self.read(Register::Voltage).await?,
        )
    }

    pub async fn get_temperatures(&mut self) -> Result<Vec<i32>> {
        Ok(decode_temperatures(&self.read(Register::Temperature).await?))
    }

    pub async fn get_cell_voltages(&mut self) -> Result<Vec<i16>> {
        let payload = self
            .request(&cell_voltages_request(self.cells))
            .await?
            .payload;
        decode_cell_voltages(&payload, self.cells)
    }

    pub async fn read_snapshot(&mut self) -> Result<Snapshot> {
        Ok(Snapshot {
            status: self.get_status().await?,
            serial_number: self.get_serial_number().await?,
            remaining_capacity_percent: self.get_remaining_capacity_percent().await?,
            remaining_capacity: self.get_remaining_capacity().await?,
            actual_capacity: self.get_actual_capacity().await?,
            factory_capacity: self.get_factory_capacity().await?,
            current: self.get_current().await?,
            voltage: self.get_voltage().await?,
            temperatures: self.get_temperatures().await?,
            cell_voltages: self.get_cell_voltages().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn reply(parameter: u8, payload: &[u8]) -> Vec<u8> {
        Response {
            command: 0x01,
            parameter,
            payload: payload.to_vec(),
        }
        .encode()
    }

    async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
        let mut rx_buffer = vec![0; FRAME_OVERHEAD + 1];
        socket.read_exact(&mut rx_buffer).await.unwrap();
        rx_buffer
    }

    #[tokio::test]
    async fn test_read_frame_empty_payload() {
        let frame = reply(0x30, &[]);
        let mut reader = &frame[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(&reply(0x31, &[0x10, 0x27])).await.unwrap();
            request
        });

        let mut bmu = BmuClient::new(&address);
        assert_eq!(bmu.get_remaining_capacity().await.unwrap(), 10000);
        assert_eq!(server.await.unwrap(), Register::RemainingCapacity.request());
    }

    #[tokio::test]
    async fn test_read_timeout_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            // first connection swallows the request and stays silent
            let (mut silent, _) = listener.accept().await.unwrap();
            read_request(&mut silent).await;
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(&reply(0x34, &[0x1c, 0x0f])).await.unwrap();
            drop(silent);
        });

        let mut bmu = BmuClient::new(&address);
        bmu.set_timeout(Duration::from_millis(200));
        let voltage = bmu.get_voltage().await.unwrap();
        assert!((voltage - 38.68).abs() < 1e-9);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_checksum_error_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut corrupted = reply(0x30, &[0x01, 0x00]);
            corrupted[8] ^= 0x80;
            read_request(&mut socket).await;
            socket.write_all(&corrupted).await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(&reply(0x30, &[0x01, 0x00])).await.unwrap();
        });

        let mut bmu = BmuClient::new(&address);
        assert_eq!(bmu.get_status().await.unwrap(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut frame = reply(0x30, &[0x01, 0x00]);
            frame[1] = 0x00;
            read_request(&mut socket).await;
            socket.write_all(&frame).await.unwrap();
        });

        let mut bmu = BmuClient::new(&address);
        assert!(matches!(
            bmu.get_status().await,
            Err(Error::Decode(DecodeError::BadMagic(_)))
        ));
    }
}
