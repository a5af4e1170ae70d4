//! The session capability every front-end transport must implement. The connection manager only
//! ever talks to a server through these traits.

pub mod mock;

use crate::core::{
    Endianness,
    RegisterAddress,
    WORD_BYTES,
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Server {server} unreachable: {reason}")]
    Connect { server: String, reason: String },
    #[error("Read from {node} failed: {reason}")]
    Read { node: String, reason: String },
    #[error("Write to {node} failed: {reason}")]
    Write { node: String, reason: String },
    #[error("Malformed reply from {node}: expected {expected} bytes, got {got}")]
    ShortRead {
        node: String,
        expected: usize,
        got: usize,
    },
    #[error("Internal system IO error")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Opens sessions to servers. Shared by every connection a manager owns.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open a new session to `server`
    /// # Errors
    /// Returns [`TransportError::Connect`] when the server cannot be reached
    fn connect(&self, server: &str) -> TransportResult<Self::Transport>;
}

/// The trait implemented by front-end transport sessions.
/// The methods of this trait *assume* the session is connected.
pub trait Transport: Send + 'static {
    /// Close the session
    fn disconnect(&mut self) -> TransportResult<()>;

    /// Tests whether `device` answers on this session
    fn is_online(&mut self, device: &str) -> TransportResult<bool>;

    /// Write a raw payload to bus `node`
    fn write_block(&mut self, node: &str, data: &[u8]) -> TransportResult<()>;

    /// Read `len` raw bytes from bus `node`
    fn read_block(&mut self, node: &str, len: usize) -> TransportResult<Vec<u8>>;

    /// Write one register word. The payload is the register id followed by the value, both
    /// encoded in `order`.
    fn write_register(
        &mut self,
        address: &RegisterAddress,
        value: u32,
        order: Endianness,
    ) -> TransportResult<()> {
        let mut payload = Vec::with_capacity(2 * WORD_BYTES);
        payload.extend_from_slice(&order.encode(address.register));
        payload.extend_from_slice(&order.encode(value));
        self.write_block(&address.bus, &payload)
    }

    /// Read one register word by selecting the register id and then reading a word back
    fn read_register(&mut self, address: &RegisterAddress, order: Endianness) -> TransportResult<u32> {
        self.write_block(&address.bus, &order.encode(address.register))?;
        let bytes = self.read_block(&address.bus, WORD_BYTES)?;
        order
            .decode(&bytes)
            .ok_or_else(|| TransportError::ShortRead {
                node: address.bus.to_string(),
                expected: WORD_BYTES,
                got: bytes.len(),
            })
    }
}

/// Result of a reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Reachable,
    /// The server answered but the device did not
    Unreachable,
    ServerOffline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reachable => "reachable",
            Self::Unreachable => "unreachable",
            Self::ServerOffline => "server offline",
        };
        f.write_str(s)
    }
}
