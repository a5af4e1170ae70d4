//! Front-end device models built on leased connections
//!
//! Every device type is described by capability traits: [`HasDeviceAddress`] names the device,
//! [`HasLeasedConnection`] ties it to a [`ConnectionManager`], and [`Device`] layers the single
//! register accessors (with retry and skip handling) and the bulk configuration operations on top.

/// Implements the address and connection capabilities for a device type holding `manager` and
/// `common` fields
macro_rules! leased_device {
    ($device:ident) => {
        impl<C: Connector> HasDeviceAddress for $device<'_, C> {
            fn server_address(&self) -> &str {
                &self.common.server
            }

            fn device_address(&self) -> &str {
                &self.common.device
            }
        }

        impl<C: Connector> HasLeasedConnection for $device<'_, C> {
            type Connector = C;

            fn manager(&self) -> &ConnectionManager<C> {
                self.manager
            }
        }
    };
}

pub mod alignment_set;
pub mod carrier;
pub mod fleet;
pub mod processor;

pub use alignment_set::AlignmentChipSet;
pub use carrier::Carrier;
pub use fleet::{
    AnyDevice,
    DeviceFleet,
    FleetReport,
};
pub use processor::TriggerProcessor;

use crate::{
    config::{
        ConfigTree,
        Settings,
    },
    core::{
        Endianness,
        RegisterAddress,
    },
    error::{
        Error,
        Result,
    },
    manager::{
        ConnectionManager,
        Lease,
    },
    protocol::{
        self,
        RetryPolicy,
    },
    transport::Connector,
};
use kstring::KString;
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use tracing::{
    debug,
    error,
};

/// Reported for registers on the skip list
pub const SKIPPED_VALUE: u32 = 0xFFFF_FFFF;

/// Identity and access policy every device type carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Common {
    pub(crate) server: KString,
    pub(crate) device: KString,
    pub(crate) skip_registers: BTreeSet<u32>,
    pub(crate) retry: RetryPolicy,
}

impl Common {
    pub(crate) fn from_config(config: &ConfigTree, settings: &Settings) -> Result<Self> {
        Ok(Self {
            server: config.server_address()?,
            device: config.device_address()?,
            skip_registers: config.get_set("SkipRegisters")?,
            retry: settings.retry,
        })
    }
}

pub trait HasDeviceAddress {
    /// `host:port` of the server exposing the device
    fn server_address(&self) -> &str;
    /// Address of the device on its server
    fn device_address(&self) -> &str;
    /// Name used in log messages
    fn name(&self) -> String {
        format!("{}/{}", self.server_address(), self.device_address())
    }
}

pub trait HasLeasedConnection: HasDeviceAddress {
    type Connector: Connector;

    fn manager(&self) -> &ConnectionManager<Self::Connector>;

    /// Lease the session of this device
    /// # Errors
    /// Returns an error if the server can't be reached
    fn connection(&self) -> Result<Lease<Self::Connector>> {
        self.manager()
            .acquire(self.server_address(), self.device_address())
    }
}

pub trait Device: HasLeasedConnection {
    /// Registers excluded from every read and write
    fn skip_set(&self) -> &BTreeSet<u32>;

    fn retry_policy(&self) -> &RetryPolicy;

    /// Bus node carrying the register traffic of this device
    fn bus(&self) -> &str {
        self.device_address()
    }

    fn byte_order(&self) -> Endianness {
        Endianness::Little
    }

    fn address(&self, register: u32) -> RegisterAddress {
        RegisterAddress::new(self.bus(), register)
    }

    fn is_skipped(&self, register: u32) -> bool {
        self.skip_set().contains(&register)
    }

    /// Write one register, retrying transient failures. Skipped registers are left untouched.
    /// # Errors
    /// Returns [`Error::RetriesExhausted`] once the retry policy gives up
    fn write_register(&self, register: u32, value: u32) -> Result<()> {
        let address = self.address(register);
        if self.is_skipped(register) {
            debug!(device = %self.name(), %address, "Skip writing");
            return Ok(());
        }
        let lease = self.connection()?;
        self.retry_policy().run(&format!("write {address}"), || {
            protocol::write_register(&lease, &address, value, self.byte_order())
        })?;
        Ok(())
    }

    /// Read one register, retrying transient failures. Skipped registers read as
    /// [`SKIPPED_VALUE`].
    /// # Errors
    /// Returns [`Error::RetriesExhausted`] once the retry policy gives up
    fn read_register(&self, register: u32) -> Result<u32> {
        let address = self.address(register);
        if self.is_skipped(register) {
            debug!(device = %self.name(), %address, "Skip reading");
            return Ok(SKIPPED_VALUE);
        }
        let lease = self.connection()?;
        let read = self.retry_policy().run(&format!("read {address}"), || {
            protocol::read_register(&lease, &address, self.byte_order())
        })?;
        Ok(read.value)
    }

    /// Write one register and read it back. The write and the read are retried separately, a
    /// mismatch never is.
    /// # Errors
    /// Returns [`Error::ReadbackMismatch`] if the device echoes a different value
    fn write_and_verify(&self, register: u32, value: u32) -> Result<()> {
        if self.is_skipped(register) {
            debug!(device = %self.name(), register, "Skip writing");
            return Ok(());
        }
        self.write_register(register, value)?;
        let observed = self.read_register(register)?;
        protocol::check_readback(&self.address(register), value, observed)
    }

    /// Write the configuration of this device
    /// # Errors
    /// Returns an error if the configuration is malformed or a critical register failed
    fn write_configuration(&self) -> Result<WriteReport>;

    /// Read back the configuration registers of this device. Skipped registers map to
    /// [`SKIPPED_VALUE`], registers that failed are left out.
    /// # Errors
    /// Returns an error if a critical register failed
    fn read_configuration(&self) -> Result<BTreeMap<u32, u32>>;
}

/// One entry of a bulk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub register: u32,
    pub value: u32,
    /// A failure aborts the whole bulk write
    pub critical: bool,
    pub verify: bool,
}

impl RegisterWrite {
    #[must_use]
    pub const fn new(register: u32, value: u32) -> Self {
        Self {
            register,
            value,
            critical: false,
            verify: false,
        }
    }

    #[must_use]
    pub const fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    #[must_use]
    pub const fn verified(mut self) -> Self {
        self.verify = true;
        self
    }
}

#[derive(Debug)]
pub struct RegisterFailure {
    pub register: u32,
    pub error: Error,
}

/// What a bulk write did to each register
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failed: Vec<RegisterFailure>,
}

impl WriteReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn merge(&mut self, other: Self) {
        self.written.extend(other.written);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

/// Write `writes` in order. Non-critical failures are logged and collected.
pub(crate) fn write_sequence<D: Device + ?Sized>(
    device: &D,
    writes: &[RegisterWrite],
) -> Result<WriteReport> {
    // Keep the session open across the whole sequence
    let _lease = device.connection()?;
    let mut report = WriteReport::default();
    for write in writes {
        if device.is_skipped(write.register) {
            debug!(device = %device.name(), register = write.register, "Skip writing");
            report.skipped.push(write.register);
            continue;
        }
        let result = if write.verify {
            device.write_and_verify(write.register, write.value)
        } else {
            device.write_register(write.register, write.value)
        };
        match result {
            Ok(()) => report.written.push(write.register),
            Err(e) if write.critical => {
                error!(device = %device.name(), register = write.register, error = %e, "Critical register failed");
                return Err(e);
            }
            Err(e) => {
                error!(device = %device.name(), register = write.register, error = %e, "Failed to write register");
                report.failed.push(RegisterFailure {
                    register: write.register,
                    error: e,
                });
            }
        }
    }
    Ok(report)
}

/// Read `registers`. Failures of registers in `critical` abort, others are logged and left out.
pub(crate) fn read_set<D: Device + ?Sized>(
    device: &D,
    registers: &[u32],
    critical: &[u32],
) -> Result<BTreeMap<u32, u32>> {
    let _lease = device.connection()?;
    let mut values = BTreeMap::new();
    for &register in registers {
        match device.read_register(register) {
            Ok(value) => {
                values.insert(register, value);
            }
            Err(e) if critical.contains(&register) => {
                error!(device = %device.name(), register, error = %e, "Critical register failed");
                return Err(e);
            }
            Err(e) => {
                error!(device = %device.name(), register, error = %e, "Failed to read register");
            }
        }
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::ConfigTree,
        transport::mock::{
            MockBoard,
            MockConnector,
        },
    };
    use kstring::KString;
    use std::time::Duration;

    pub(crate) const SERVER: &str = "opc.example:48020";

    pub(crate) fn manager(board: &MockBoard) -> ConnectionManager<MockConnector> {
        ConnectionManager::with_idle_timeout(board.connector(), Duration::from_secs(10)).unwrap()
    }

    /// A bare device with a scratch register file
    struct Scratch<'m> {
        manager: &'m ConnectionManager<MockConnector>,
        device: KString,
        skip: BTreeSet<u32>,
        retry: RetryPolicy,
    }

    impl<'m> Scratch<'m> {
        fn new(manager: &'m ConnectionManager<MockConnector>, config: &ConfigTree) -> Self {
            Self {
                manager,
                device: config.device_address().unwrap(),
                skip: config.get_set("SkipRegisters").unwrap(),
                retry: RetryPolicy::new(3, Duration::ZERO),
            }
        }
    }

    impl HasDeviceAddress for Scratch<'_> {
        fn server_address(&self) -> &str {
            SERVER
        }

        fn device_address(&self) -> &str {
            &self.device
        }
    }

    impl HasLeasedConnection for Scratch<'_> {
        type Connector = MockConnector;

        fn manager(&self) -> &ConnectionManager<MockConnector> {
            self.manager
        }
    }

    impl Device for Scratch<'_> {
        fn skip_set(&self) -> &BTreeSet<u32> {
            &self.skip
        }

        fn retry_policy(&self) -> &RetryPolicy {
            &self.retry
        }

        fn write_configuration(&self) -> Result<WriteReport> {
            write_sequence(
                self,
                &[
                    RegisterWrite::new(1, 10).critical(),
                    RegisterWrite::new(2, 20),
                    RegisterWrite::new(3, 30).verified(),
                ],
            )
        }

        fn read_configuration(&self) -> Result<BTreeMap<u32, u32>> {
            read_set(self, &[1, 2, 3], &[1])
        }
    }

    fn scratch<'m>(mgr: &'m ConnectionManager<MockConnector>, skip: &[u32]) -> Scratch<'m> {
        let config = ConfigTree::new(serde_json::json!({
            "DeviceAddress": "scratch",
            "SkipRegisters": skip,
        }));
        Scratch::new(mgr, &config)
    }

    #[test]
    fn test_skip_list() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[2]);
        board.set(&dev.address(2), 5);
        dev.write_register(2, 99).unwrap();
        assert!(board.writes_to(&dev.address(2)).is_empty());
        assert_eq!(dev.read_register(2).unwrap(), SKIPPED_VALUE);
        dev.write_and_verify(2, 99).unwrap();
        assert_eq!(board.writes(), 0);
        assert_eq!(board.reads(), 0);
    }

    #[test]
    fn test_single_register_retry() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[]);
        board.fail_next(&dev.address(4), 2);
        dev.write_register(4, 1).unwrap();
        assert_eq!(board.writes(), 3);
        board.fail_next(&dev.address(4), 3);
        let err = dev.read_register(4).unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn test_bulk_write_reports() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[2]);
        board.fail_next(&dev.address(3), 3);
        let report = dev.write_configuration().unwrap();
        assert_eq!(report.written, vec![1]);
        assert_eq!(report.skipped, vec![2]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].register, 3);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_bulk_write_critical_aborts() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[]);
        board.fail_next(&dev.address(1), 3);
        assert!(dev.write_configuration().is_err());
        assert!(board.writes_to(&dev.address(2)).is_empty());
    }

    #[test]
    fn test_bulk_write_verify_mismatch() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[]);
        board.corrupt_readback(&dev.address(3));
        let report = dev.write_configuration().unwrap();
        assert!(matches!(
            report.failed[0].error,
            Error::ReadbackMismatch { .. }
        ));
    }

    #[test]
    fn test_bulk_read() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = scratch(&mgr, &[2]);
        board.set(&dev.address(1), 11);
        board.fail_next(&dev.address(3), 3);
        let values = dev.read_configuration().unwrap();
        assert_eq!(values, BTreeMap::from([(1, 11), (2, SKIPPED_VALUE)]));
        board.fail_next(&dev.address(1), 3);
        assert!(dev.read_configuration().is_err());
    }
}
