//! The crate-wide error type

use crate::{
    core::ConnectionId,
    transport::TransportError,
};
use kstring::KString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The connector could not open a session to the server
    #[error("Could not connect to server {server}")]
    Connection {
        server: KString,
        #[source]
        source: TransportError,
    },
    /// A single read or write failed on an open session
    #[error("Transport failure at {address}")]
    Io {
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("Giving up on {operation} after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("Readback mismatch at {address}: wrote {written:#010x}, read {observed:#010x}")]
    ReadbackMismatch {
        address: String,
        written: u32,
        observed: u32,
    },
    #[error("Bad configuration for {key}: {reason}")]
    Config { key: String, reason: String },
    /// A lease was used after its connection manager shut down
    #[error("Manager invalid, lease on {0} outlived its connection manager")]
    InvalidManager(ConnectionId),
    #[error("Lock guarding the {0} was poisoned")]
    Poisoned(&'static str),
    #[error("Failed to start the connection teardown runtime")]
    Runtime(#[from] std::io::Error),
}

impl Error {
    /// Whether the device layer may retry the operation that produced this error
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    pub(crate) fn config(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
