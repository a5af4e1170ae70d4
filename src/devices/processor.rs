//! The trigger processor, which receives the hit data of the front-end boards over serial fibers

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
    alignment::{
        AlignmentOutcome,
        ResetAlignment,
    },
    config::{
        AlignmentSettings,
        ConfigTree,
        Settings,
    },
    error::{
        Error,
        Result,
    },
    manager::ConnectionManager,
    protocol::RetryPolicy,
    transport::Connector,
};
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use tracing::{
    info,
    warn,
};

/// Register map of the trigger processor
pub mod registers {
    pub const ADDC_EMU_DISABLE: u32 = 0x01;
    /// One "aligned" bit per fiber
    pub const FIBER_ALIGNMENT: u32 = 0x02;
    /// One reset bit per QPLL
    pub const FIBER_QPLL_RESET: u32 = 0x03;
    pub const FIBER_BC_OFFSET: u32 = 0x08;
    pub const DATE_CODE: u32 = 0x09;
    pub const GIT_HASH: u32 = 0x0a;
    pub const INPUT_PHASE: u32 = 0x0b;
    pub const INPUT_PHASE_OFFSET: u32 = 0x0c;
    pub const L1A_CONTROL: u32 = 0x10;
    pub const L1A_OPENING_OFFSET: u32 = 0x11;
    pub const L1A_REQUEST_OFFSET: u32 = 0x12;
    pub const L1A_CLOSING_OFFSET: u32 = 0x13;
    pub const SELF_TRIGGER_DELAY: u32 = 0x21;
    pub const VMM_MASK_HOT_THRESH: u32 = 0x22;
    pub const VMM_MASK_HOT_THRESH_HYST: u32 = 0x23;
    pub const VMM_MASK_DRAIN_PERIOD: u32 = 0x24;
    pub const HORX_ENV_MON_ADDR: u32 = 0x26;
    pub const GLO_SYNC_IDLE_STATE: u32 = 0x28;
    pub const GLO_SYNC_BCID_OFFSET: u32 = 0x29;
    pub const LAT_TX_IDLE_STATE: u32 = 0x2f;
}

use registers::*;

pub const NUM_FIBERS: usize = 32;
pub const FIBERS_PER_QPLL: usize = 4;
pub const L1A_RESET_ENABLE: u32 = 0xFF;
pub const L1A_RESET_DISABLE: u32 = 0x00;
pub const QPLL_RESET_DISABLE: u32 = 0x00;
/// The only firmware generation this model drives
pub const FIRMWARE_GENERATION: u32 = 2;

/// Configuration key, register, and the default written when the key is absent, in write order.
/// The trigger window, fiber and input phase settings default to zero, the hot-VMM masking to
/// the firmware reset values.
const CONFIGURATION: [(&str, u32, u32); 13] = [
    ("ARTWindowCenter", L1A_REQUEST_OFFSET, 0),
    ("ARTWindowLeft", L1A_OPENING_OFFSET, 0),
    ("ARTWindowRight", L1A_CLOSING_OFFSET, 0),
    ("FiberBCOffset", FIBER_BC_OFFSET, 0),
    ("GlobalInputPhase", INPUT_PHASE, 0),
    ("GlobalInputOffset", INPUT_PHASE_OFFSET, 0),
    ("SelfTriggerDelay", SELF_TRIGGER_DELAY, 0),
    ("VmmMaskHotThresh", VMM_MASK_HOT_THRESH, 0xA),
    ("VmmMaskHotThreshHyst", VMM_MASK_HOT_THRESH_HYST, 0x3),
    ("VmmMaskDrainPeriod", VMM_MASK_DRAIN_PERIOD, 0x9c40),
    ("HorxEnvMonAddr", HORX_ENV_MON_ADDR, 0),
    ("GloSyncIdleState", GLO_SYNC_IDLE_STATE, 0),
    ("GloSyncBcidOffset", GLO_SYNC_BCID_OFFSET, 0),
];

const READBACK: [u32; 17] = [
    ADDC_EMU_DISABLE,
    FIBER_ALIGNMENT,
    FIBER_BC_OFFSET,
    DATE_CODE,
    GIT_HASH,
    INPUT_PHASE,
    INPUT_PHASE_OFFSET,
    L1A_CONTROL,
    L1A_OPENING_OFFSET,
    L1A_REQUEST_OFFSET,
    L1A_CLOSING_OFFSET,
    SELF_TRIGGER_DELAY,
    VMM_MASK_HOT_THRESH,
    VMM_MASK_HOT_THRESH_HYST,
    VMM_MASK_DRAIN_PERIOD,
    GLO_SYNC_IDLE_STATE,
    GLO_SYNC_BCID_OFFSET,
];

#[derive(Debug)]
pub struct TriggerProcessor<'m, C: Connector> {
    manager: &'m ConnectionManager<C>,
    common: Common,
    config: ConfigTree,
    skip_fibers: BTreeSet<u32>,
    alignment: AlignmentSettings,
    /// Whether writing the configuration ends with fiber alignment
    align_inputs: bool,
}

leased_device!(TriggerProcessor);

impl<'m, C: Connector> TriggerProcessor<'m, C> {
    /// Builds a [`TriggerProcessor`] from its configuration tree
    /// # Errors
    /// Returns an error if the addresses or skip lists are malformed, or the configuration asks
    /// for another firmware generation
    pub fn new(
        manager: &'m ConnectionManager<C>,
        config: &ConfigTree,
        settings: &Settings,
    ) -> Result<Self> {
        let generation = config.get_u32_or("FirmwareGeneration", FIRMWARE_GENERATION)?;
        if generation != FIRMWARE_GENERATION {
            return Err(Error::config(
                "FirmwareGeneration",
                format!("only generation {FIRMWARE_GENERATION} is supported, got {generation}"),
            ));
        }
        Ok(Self {
            manager,
            common: Common::from_config(config, settings)?,
            skip_fibers: config.get_set("SkipFibers")?,
            align_inputs: config.get_or("AlignInputs", true)?,
            config: config.clone(),
            alignment: settings.alignment,
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.common.retry = retry;
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: AlignmentSettings) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub fn skip_fibers(&self) -> &BTreeSet<u32> {
        &self.skip_fibers
    }

    /// The register writes of [`Device::write_configuration`], before the L1A reset
    /// # Errors
    /// Returns an error if a value is present but not a 32-bit integer
    pub fn configuration_plan(&self) -> Result<Vec<RegisterWrite>> {
        CONFIGURATION
            .iter()
            .map(|&(key, register, default)| {
                let value = self.config.get_u32_or(key, default)?;
                Ok(RegisterWrite::new(register, value))
            })
            .collect()
    }

    /// The QPLL reset procedure for the input fibers
    #[must_use]
    pub fn fiber_alignment(&self) -> ResetAlignment {
        ResetAlignment {
            channels: NUM_FIBERS,
            domain_size: FIBERS_PER_QPLL,
            reset_idle: QPLL_RESET_DISABLE,
            skip: self.skip_fibers.clone(),
            ..ResetAlignment::new(FIBER_ALIGNMENT, FIBER_QPLL_RESET, &self.alignment)
        }
    }

    /// Number of times each fiber reported aligned out of `samples` reads
    /// # Errors
    /// Returns an error if the alignment register can't be read
    pub fn read_alignment(&self, samples: usize) -> Result<Vec<usize>> {
        let _lease = self.connection()?;
        self.fiber_alignment().read_alignment(self, samples)
    }

    /// Reset the QPLLs of misaligned fibers until every non-skipped fiber is stable
    /// # Errors
    /// Returns an error on register access failures, not on failing to converge
    pub fn align_fibers(&self) -> Result<AlignmentOutcome> {
        self.fiber_alignment().run(self)
    }

    /// Drive the sync and latency outputs to their idle-high state
    /// # Errors
    /// Returns an error if a write fails
    pub fn toggle_idle_state_high(&self) -> Result<()> {
        self.write_register(GLO_SYNC_IDLE_STATE, 1)?;
        self.write_register(LAT_TX_IDLE_STATE, 1)?;
        self.write_register(LAT_TX_IDLE_STATE, 0)
    }

    /// Pulse the L1A logic reset
    /// # Errors
    /// Returns an error if a write fails
    pub fn reset_l1a(&self) -> Result<()> {
        self.write_register(L1A_CONTROL, L1A_RESET_ENABLE)?;
        self.write_register(L1A_CONTROL, L1A_RESET_DISABLE)
    }
}

impl<C: Connector> Device for TriggerProcessor<'_, C> {
    fn skip_set(&self) -> &BTreeSet<u32> {
        &self.common.skip_registers
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.common.retry
    }

    fn write_configuration(&self) -> Result<WriteReport> {
        let plan = self.configuration_plan()?;
        let _lease = self.connection()?;
        let report = write_sequence(self, &plan)?;
        self.toggle_idle_state_high()?;
        self.reset_l1a()?;
        if self.align_inputs {
            let outcome = self.align_fibers()?;
            if !outcome.converged {
                warn!(device = %self.name(), resets = outcome.attempts, "Inputs left misaligned");
            }
        }
        info!(
            device = %self.name(),
            written = report.written.len(),
            failed = report.failed.len(),
            "Configured trigger processor"
        );
        Ok(report)
    }

    fn read_configuration(&self) -> Result<BTreeMap<u32, u32>> {
        read_set(self, &READBACK, &[L1A_CONTROL])
    }
}
