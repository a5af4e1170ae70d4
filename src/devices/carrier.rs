//! The ASIC carrier board, which routes the readout path of its front-end ASICs and checks the
//! integrity of its optical link

use super::{
    read_set,
    write_sequence,
    Common,
    Device,
    HasDeviceAddress,
    HasLeasedConnection,
    RegisterWrite,
    WriteReport,
};
use crate::{
    config::{
        ConfigTree,
        Settings,
    },
    core::Endianness,
    error::{
        Error,
        Result,
    },
    manager::ConnectionManager,
    protocol::RetryPolicy,
    transport::Connector,
};
use serde_json::Value;
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use tracing::info;

pub mod registers {
    /// Selects which detector technology drives the readout outputs
    pub const RJOUT_SEL: u32 = 0x01;
    pub const MIRROR_RESET: u32 = 0x02;
    /// Read-only
    pub const GBT_PHASE_SKEW: u32 = 0x0b;
    /// Write-only
    pub const GBT_PHASE_ADJUST: u32 = 0x0c;
    /// Read-only
    pub const PRBS_ERROR_COUNT: u32 = 0x0f;
    pub const PRBS_RESET: u32 = 0x10;
}

use registers::*;

/// Technology routed to the readout outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutPath {
    Stgc = 0,
    Mm = 1,
}

impl ReadoutPath {
    fn from_config(config: &ConfigTree) -> Result<Self> {
        const KEY: &str = "ReadoutPath";
        let path = match config.get_or::<Value>(KEY, Value::from(0))? {
            Value::String(s) if s.eq_ignore_ascii_case("stgc") => Self::Stgc,
            Value::String(s) if s.eq_ignore_ascii_case("mm") => Self::Mm,
            Value::Number(n) if n.as_u64() == Some(0) => Self::Stgc,
            Value::Number(n) if n.as_u64() == Some(1) => Self::Mm,
            other => {
                return Err(Error::config(
                    KEY,
                    format!("expected \"sTGC\", \"MM\", 0 or 1, got {other}"),
                ))
            }
        };
        Ok(path)
    }
}

const READBACK: [u32; 5] = [
    RJOUT_SEL,
    MIRROR_RESET,
    GBT_PHASE_SKEW,
    PRBS_ERROR_COUNT,
    PRBS_RESET,
];

#[derive(Debug)]
pub struct Carrier<'m, C: Connector> {
    manager: &'m ConnectionManager<C>,
    common: Common,
    readout_path: ReadoutPath,
    gbt_phase_adjust: u32,
}

leased_device!(Carrier);

impl<'m, C: Connector> Carrier<'m, C> {
    /// Builds a [`Carrier`] from its configuration tree
    /// # Errors
    /// Returns an error if the configuration is malformed
    pub fn new(
        manager: &'m ConnectionManager<C>,
        config: &ConfigTree,
        settings: &Settings,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            common: Common::from_config(config, settings)?,
            readout_path: ReadoutPath::from_config(config)?,
            gbt_phase_adjust: config.get_u32_or("GbtPhaseAdjust", 0)?,
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.common.retry = retry;
        self
    }

    #[must_use]
    pub fn readout_path(&self) -> ReadoutPath {
        self.readout_path
    }

    /// Pulse the reset of the PRBS checker, clearing its error counter
    /// # Errors
    /// Returns an error if a write fails
    pub fn reset_prbs_checker(&self) -> Result<()> {
        self.write_register(PRBS_RESET, 1)?;
        self.write_register(PRBS_RESET, 0)
    }

    /// Errors the PRBS checker counted since its last reset
    /// # Errors
    /// Returns an error if the counter can't be read
    pub fn prbs_error_count(&self) -> Result<u32> {
        self.read_register(PRBS_ERROR_COUNT)
    }

    /// Measured phase skew of the optical link
    /// # Errors
    /// Returns an error if the register can't be read
    pub fn gbt_phase_skew(&self) -> Result<u32> {
        self.read_register(GBT_PHASE_SKEW)
    }
}

impl<C: Connector> Device for Carrier<'_, C> {
    fn skip_set(&self) -> &BTreeSet<u32> {
        &self.common.skip_registers
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.common.retry
    }

    fn byte_order(&self) -> Endianness {
        Endianness::Big
    }

    fn write_configuration(&self) -> Result<WriteReport> {
        let _lease = self.connection()?;
        let mut report = write_sequence(
            self,
            &[
                RegisterWrite::new(RJOUT_SEL, self.readout_path as u32).critical(),
                RegisterWrite::new(GBT_PHASE_ADJUST, self.gbt_phase_adjust),
            ],
        )?;
        report.merge(write_sequence(
            self,
            &[
                RegisterWrite::new(PRBS_RESET, 1),
                RegisterWrite::new(PRBS_RESET, 0),
            ],
        )?);
        info!(device = %self.name(), path = ?self.readout_path, "Configured carrier");
        Ok(report)
    }

    fn read_configuration(&self) -> Result<BTreeMap<u32, u32>> {
        read_set(self, &READBACK, &[RJOUT_SEL])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::{
            tests::{
                manager,
                SERVER,
            },
            SKIPPED_VALUE,
        },
        transport::mock::MockBoard,
    };
    use serde_json::json;
    use std::time::Duration;

    fn carrier<'m, C: Connector>(
        mgr: &'m ConnectionManager<C>,
        config: Value,
    ) -> Result<Carrier<'m, C>> {
        let mut cfg = json!({ "ServerAddress": SERVER, "DeviceAddress": "sector.carrier" });
        if let (Some(cfg), Value::Object(extra)) = (cfg.as_object_mut(), config) {
            cfg.extend(extra);
        }
        Carrier::new(mgr, &ConfigTree::new(cfg), &Settings::default())
            .map(|c| c.with_retry(RetryPolicy::new(2, Duration::ZERO)))
    }

    #[test]
    fn test_write_configuration() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = carrier(&mgr, json!({ "ReadoutPath": "MM", "GbtPhaseAdjust": 6 })).unwrap();
        let report = dev.write_configuration().unwrap();
        assert!(report.is_complete());
        assert_eq!(board.value(&dev.address(RJOUT_SEL)), 1);
        assert_eq!(board.value(&dev.address(GBT_PHASE_ADJUST)), 6);
        assert_eq!(board.writes_to(&dev.address(PRBS_RESET)), vec![1, 0]);
    }

    #[test]
    fn test_readout_path_parsing() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        assert_eq!(
            carrier(&mgr, json!({})).unwrap().readout_path(),
            ReadoutPath::Stgc
        );
        assert_eq!(
            carrier(&mgr, json!({ "ReadoutPath": 1 })).unwrap().readout_path(),
            ReadoutPath::Mm
        );
        assert!(matches!(
            carrier(&mgr, json!({ "ReadoutPath": "pixel" })),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_readout_path_is_critical() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = carrier(&mgr, json!({})).unwrap();
        board.fail_next(&dev.address(RJOUT_SEL), 2);
        assert!(dev.write_configuration().is_err());
        assert!(board.writes_to(&dev.address(PRBS_RESET)).is_empty());
    }

    #[test]
    fn test_prbs() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = carrier(&mgr, json!({})).unwrap();
        board.set(&dev.address(PRBS_ERROR_COUNT), 17);
        assert_eq!(dev.prbs_error_count().unwrap(), 17);
        dev.reset_prbs_checker().unwrap();
        assert_eq!(board.writes_to(&dev.address(PRBS_RESET)), vec![1, 0]);
    }

    #[test]
    fn test_read_configuration() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = carrier(&mgr, json!({ "SkipRegisters": [0x0b] })).unwrap();
        board.set(&dev.address(PRBS_ERROR_COUNT), 3);
        board.fail_next(&dev.address(MIRROR_RESET), 2);
        let values = dev.read_configuration().unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(values[&GBT_PHASE_SKEW], SKIPPED_VALUE);
        assert_eq!(values[&PRBS_ERROR_COUNT], 3);
        assert!(!values.contains_key(&MIRROR_RESET));
    }
}
