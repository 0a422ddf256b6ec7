#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ninebot_bms_lib
//!
//! This crate provides a library for reading the battery management unit (BMU)
//! of Ninebot scooters over a TCP byte stream, for example a serial-to-TCP
//! bridge wired to the scooter bus.
//!
//! It contains the frame codec of the `5A A5` read-register protocol, a
//! connection manager with a per-request deadline, a request client that
//! retries timeouts and corrupted frames, and an estimator deriving the
//! discharge rate and time-to-empty from successive capacity readings.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `ninebot-bms` command-line tool.
//!
//! ### Client Features
//! - `tokio-async`: Enables the **asynchronous** client using `tokio`.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for the snapshot and telemetry record.
//! - `bin-dependencies`: Enables all features required by the `ninebot-bms` binary executable.

/// Contains error types for the library.
mod error;
/// Synchronous request/response client.
pub mod client;
/// Connection lifecycle and per-request deadline.
pub mod connection;
/// Discharge rate and time-to-empty estimation.
pub mod estimator;
/// Defines the communication protocol of the BMU.
pub mod protocol;
/// Retry policies for transient request failures.
pub mod retry;
/// Telemetry record and sink.
pub mod telemetry;

pub use error::{Error, Result};

/// Asynchronous client for BMU communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-async")))]
#[cfg(feature = "tokio-async")]
pub mod tokio_async;
