use crate::protocol::DecodeError;
use crate::retry::Transient;

/// Errors that end a request. Transient failures never show up here unless
/// the configured retry policy gave up on them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream to the BMU could not be opened.
    #[error("Cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    /// Writing the request failed for a reason other than the deadline.
    #[error("Cannot write request: {0}")]
    Write(#[source] std::io::Error),
    /// Reading the response failed for a reason other than the deadline.
    #[error("Cannot read response: {0}")]
    Read(#[source] std::io::Error),
    /// The response frame is malformed.
    #[error("Invalid response frame: {0}")]
    Decode(#[from] DecodeError),
    /// The response payload does not have the size the register needs.
    #[error("Invalid payload size for register {register:#04X} - expected={expected} received={received}")]
    PayloadSize {
        register: u8,
        expected: usize,
        received: usize,
    },
    /// The retry policy stopped retrying.
    #[error("Giving up after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: u32, last: Transient },
}

/// A specialized `Result` type for BMU operations.
pub type Result<T> = std::result::Result<T, Error>;
