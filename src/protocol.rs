//! Single register accesses over a leased session, and the bounded retry the device layer wraps
//! around them

use crate::{
    core::{
        snooze,
        Endianness,
        RegisterAddress,
    },
    error::{
        Error,
        Result,
    },
    manager::Lease,
    transport::{
        Connector,
        Transport,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;
use tracing::{
    debug,
    error,
    trace,
    warn,
};

/// Write `value` to `address`
/// # Errors
/// Returns [`Error::Io`] on transport failure or [`Error::InvalidManager`] on a dead lease
pub fn write_register<C: Connector>(
    lease: &Lease<C>,
    address: &RegisterAddress,
    value: u32,
    order: Endianness,
) -> Result<()> {
    trace!(%address, value, "Writing register");
    lease
        .with_transport(|t| t.write_register(address, value, order))?
        .map_err(|source| Error::Io {
            address: address.to_string(),
            source,
        })
}

/// Read the value of `address`
/// # Errors
/// Returns [`Error::Io`] on transport failure or [`Error::InvalidManager`] on a dead lease
pub fn read_register<C: Connector>(
    lease: &Lease<C>,
    address: &RegisterAddress,
    order: Endianness,
) -> Result<u32> {
    let value = lease
        .with_transport(|t| t.read_register(address, order))?
        .map_err(|source| Error::Io {
            address: address.to_string(),
            source,
        })?;
    trace!(%address, value, "Read register");
    Ok(value)
}

/// Write `value` to `address` and read it back
/// # Errors
/// Returns [`Error::ReadbackMismatch`] if the device echoes a different value, otherwise the
/// errors of [`write_register`] and [`read_register`]
pub fn write_and_verify<C: Connector>(
    lease: &Lease<C>,
    address: &RegisterAddress,
    value: u32,
    order: Endianness,
) -> Result<()> {
    write_register(lease, address, value, order)?;
    let observed = read_register(lease, address, order)?;
    check_readback(address, value, observed)
}

/// # Errors
/// Returns [`Error::ReadbackMismatch`] if `observed` differs from `written`
pub fn check_readback(address: &RegisterAddress, written: u32, observed: u32) -> Result<()> {
    if written == observed {
        Ok(())
    } else {
        error!(%address, written, observed, "Readback mismatch");
        Err(Error::ReadbackMismatch {
            address: address.to_string(),
            written,
            observed,
        })
    }
}

/// Write a raw payload to bus `node`
/// # Errors
/// Returns [`Error::Io`] on transport failure
pub fn write_block<C: Connector>(lease: &Lease<C>, node: &str, data: &[u8]) -> Result<()> {
    lease
        .with_transport(|t| t.write_block(node, data))?
        .map_err(|source| Error::Io {
            address: node.to_string(),
            source,
        })
}

/// Read `len` raw bytes from bus `node`
/// # Errors
/// Returns [`Error::Io`] on transport failure
pub fn read_block<C: Connector>(lease: &Lease<C>, node: &str, len: usize) -> Result<Vec<u8>> {
    lease
        .with_transport(|t| t.read_block(node, len))?
        .map_err(|source| Error::Io {
            address: node.to_string(),
            source,
        })
}

/// A value together with the number of attempts it took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

/// Bounded retry of transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Pause between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the attempts run out.
    /// At least one attempt is always made.
    /// # Errors
    /// Returns [`Error::RetriesExhausted`] wrapping the last failure once every attempt failed,
    /// or the first non-transient error unchanged
    pub fn run<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<Attempted<T>> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retrying");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(operation, attempt, max_attempts, error = %e, "Transient failure, retrying");
                    snooze(self.delay);
                }
                Err(e) if e.is_transient() => {
                    warn!(operation, attempts = attempt, error = %e, "Out of retries");
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
