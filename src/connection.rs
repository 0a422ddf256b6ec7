use crate::protocol::{FRAME_OVERHEAD, LENGTH_INDEX};
use crate::{Error, Result};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Deadline applied to every request, counted from the last `ensure()`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// A duplex byte stream to the BMU.
pub trait Transport: Read + Write {
    /// Applies `timeout` to the following blocking reads and writes.
    fn set_io_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn set_io_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Opens new streams to a fixed endpoint.
pub trait Connect {
    type Stream: Transport;

    fn connect(&mut self) -> io::Result<Self::Stream>;

    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => {
                    log::debug!("Cannot connect to {addr}: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' does not resolve to any address", self.address),
            )
        }))
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}

/// True if the error comes from an expired read or write deadline.
///
/// Sockets report an elapsed timeout as `WouldBlock` on unix and `TimedOut`
/// on windows.
pub fn is_deadline_exceeded(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Owns the single connection to the BMU and the deadline of the request
/// running on it.
pub struct ConnectionManager<C: Connect> {
    connector: C,
    reader: Option<BufReader<C::Stream>>,
    timeout: Duration,
    deadline: Instant,
}

impl<C: Connect> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<C: Connect> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            reader: None,
            timeout: DEFAULT_TIMEOUT,
            deadline: Instant::now(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Makes sure a connection exists, replacing it if `force_reconnect` is
    /// set, and restarts the deadline.
    pub fn ensure(&mut self, force_reconnect: bool) -> Result<()> {
        if force_reconnect || self.reader.is_none() {
            if let Some(mut reader) = self.reader.take() {
                if let Err(err) = reader.get_mut().close() {
                    log::debug!("Ignoring error on close: {err}");
                }
            }
            let endpoint = self.connector.endpoint();
            log::info!("Connecting to {endpoint}...");
            let stream = self
                .connector
                .connect()
                .map_err(|source| Error::Connect {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            self.reader = Some(BufReader::new(stream));
            log::info!("Connected to {endpoint}");
        }
        self.deadline = Instant::now() + self.timeout;
        Ok(())
    }

    fn remaining(&self) -> io::Result<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))
    }

    fn reader(&mut self) -> io::Result<&mut BufReader<C::Stream>> {
        self.reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }

    pub fn write_frame(&mut self, tx_buffer: &[u8]) -> io::Result<()> {
        let remaining = self.remaining()?;
        let stream = self.reader()?.get_mut();
        stream.set_io_timeout(remaining)?;
        log::trace!("write bytes: {tx_buffer:02X?}");
        stream.write_all(tx_buffer)?;
        stream.flush()
    }

    /// Reads exactly one frame. The third byte carries the payload length,
    /// which fixes the total size of the frame.
    pub fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut rx_buffer = Vec::with_capacity(FRAME_OVERHEAD);
        let mut awaited_len = None;
        loop {
            let remaining = self.remaining()?;
            let reader = self.reader()?;
            if reader.buffer().is_empty() {
                reader.get_mut().set_io_timeout(remaining)?;
            }
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte)?;
            rx_buffer.push(byte[0]);

            if rx_buffer.len() == LENGTH_INDEX + 1 {
                awaited_len = Some(rx_buffer[LENGTH_INDEX] as usize + FRAME_OVERHEAD);
            }
            match awaited_len {
                Some(total) if rx_buffer.len() == total => break,
                _ => {}
            }
        }
        log::trace!("receive bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }
}
