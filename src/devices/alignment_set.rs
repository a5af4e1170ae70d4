//! The alignment chip set: a multi-chip board that aligns the BCIDs of the front-end channels
//! feeding a trigger, through per-channel input delays and a common strobe phase

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
        deskew,
        strobe,
        ChannelScan,
        DeskewSolution,
    },
    config::{
        AlignmentSettings,
        ConfigTree,
        Settings,
    },
    core::{
        pack_fields,
        unpack_fields,
    },
    error::{
        Error,
        Result,
    },
    manager::ConnectionManager,
    protocol::RetryPolicy,
    transport::Connector,
};
use packed_struct::prelude::*;
use std::collections::{
    BTreeMap,
    BTreeSet,
};
use tracing::{
    debug,
    info,
};

pub mod registers {
    pub const CONTROL: u32 = 0x00;
    pub const STROBE: u32 = 0x01;
    /// Eight 4-bit channel delays per register
    pub const CHANNEL_DELAYS: [u32; 3] = [0x04, 0x05, 0x06];
    /// Low four bits of the BCID each channel presents, eight channels per register
    pub const CHANNEL_BCIDS: [u32; 3] = [0x10, 0x11, 0x12];
}

use registers::*;

pub const NUM_CHANNELS: usize = 24;
/// Width of the per-channel delay and BCID fields
pub const FIELD_WIDTH: u32 = 4;
pub const DELAY_SETTINGS: u32 = 1 << FIELD_WIDTH;
pub const STROBE_SETTINGS: u32 = 8;

/// The control register
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct Control {
    #[packed_field(bits = "0")]
    pub readout_enable: bool,
    #[packed_field(bits = "1")]
    pub start_idle_state: bool,
    #[packed_field(bits = "8..=15")]
    pub readout_bc_offset: u8,
    #[packed_field(bits = "16..=23")]
    pub bcid_offset: u8,
}

impl Control {
    /// # Errors
    /// Returns an error if the word can't be unpacked
    pub fn from_word(word: u32) -> Result<Self> {
        Self::unpack(&word.to_be_bytes()).map_err(|e| Error::config("Control", e))
    }

    /// # Errors
    /// Returns an error if the fields can't be packed
    pub fn to_word(self) -> Result<u32> {
        self.pack()
            .map(u32::from_be_bytes)
            .map_err(|e| Error::config("Control", e))
    }

    fn from_config(config: &ConfigTree) -> Result<Self> {
        let byte = |key: &str| -> Result<u8> {
            let value = config.get_u32_or(key, 0)?;
            u8::try_from(value).map_err(|_| Error::config(key, format!("{value} does not fit 8 bits")))
        };
        Ok(Self {
            readout_enable: config.get_or("ReadoutEnable", false)?,
            start_idle_state: config.get_or("StartIdleState", false)?,
            readout_bc_offset: byte("ReadoutBcOffset")?,
            bcid_offset: byte("BcidOffset")?,
        })
    }
}

/// A field of the control register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlField {
    ReadoutEnable,
    StartIdleState,
    ReadoutBcOffset,
    BcidOffset,
}

impl ControlField {
    fn apply(self, control: &mut Control, value: u32) -> Result<()> {
        let byte = || {
            u8::try_from(value).map_err(|_| Error::config(format!("{self:?}"), format!("{value} does not fit 8 bits")))
        };
        match self {
            Self::ReadoutEnable => control.readout_enable = value != 0,
            Self::StartIdleState => control.start_idle_state = value != 0,
            Self::ReadoutBcOffset => control.readout_bc_offset = byte()?,
            Self::BcidOffset => control.bcid_offset = byte()?,
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct AlignmentChipSet<'m, C: Connector> {
    manager: &'m ConnectionManager<C>,
    common: Common,
    control: Control,
    strobe: u32,
    delays: Vec<u32>,
    alignment: AlignmentSettings,
}

leased_device!(AlignmentChipSet);

fn check_delay(key: &str, delay: u32) -> Result<u32> {
    if delay < DELAY_SETTINGS {
        Ok(delay)
    } else {
        Err(Error::config(
            key,
            format!("delay {delay} outside 0..{DELAY_SETTINGS}"),
        ))
    }
}

impl<'m, C: Connector> AlignmentChipSet<'m, C> {
    /// Builds an [`AlignmentChipSet`] from its configuration tree. Delays come from
    /// `ChannelDelays` (one per channel) or else `CommonDelay`.
    /// # Errors
    /// Returns an error if the configuration is malformed
    pub fn new(
        manager: &'m ConnectionManager<C>,
        config: &ConfigTree,
        settings: &Settings,
    ) -> Result<Self> {
        let delays = if config.contains("ChannelDelays") {
            let delays: Vec<u32> = config.get("ChannelDelays")?;
            if delays.len() != NUM_CHANNELS {
                return Err(Error::config(
                    "ChannelDelays",
                    format!("expected {NUM_CHANNELS} delays, got {}", delays.len()),
                ));
            }
            delays
                .into_iter()
                .map(|d| check_delay("ChannelDelays", d))
                .collect::<Result<_>>()?
        } else {
            let common = check_delay("CommonDelay", config.get_u32_or("CommonDelay", 0)?)?;
            vec![common; NUM_CHANNELS]
        };
        let strobe = config.get_u32_or("Strobe", 0)?;
        if strobe >= STROBE_SETTINGS {
            return Err(Error::config(
                "Strobe",
                format!("strobe {strobe} outside 0..{STROBE_SETTINGS}"),
            ));
        }
        Ok(Self {
            manager,
            common: Common::from_config(config, settings)?,
            control: Control::from_config(config)?,
            strobe,
            delays,
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

    /// # Errors
    /// Returns an error if the register can't be read
    pub fn read_control(&self) -> Result<Control> {
        Control::from_word(self.read_register(CONTROL)?)
    }

    /// Write and verify the whole control register
    /// # Errors
    /// Returns an error if the write fails or reads back differently
    pub fn write_control(&self, control: Control) -> Result<()> {
        self.write_and_verify(CONTROL, control.to_word()?)
    }

    /// Read-modify-write one field of the control register
    /// # Errors
    /// Returns an error if `value` does not fit the field or the register access fails
    pub fn write_control_field(&self, field: ControlField, value: u32) -> Result<()> {
        let _lease = self.connection()?;
        let mut control = self.read_control()?;
        field.apply(&mut control, value)?;
        debug!(device = %self.name(), ?field, value, "Writing control field");
        self.write_control(control)
    }

    /// # Errors
    /// Returns an error if the register access fails
    pub fn enable_readout(&self) -> Result<()> {
        self.write_control_field(ControlField::ReadoutEnable, 1)
    }

    /// # Errors
    /// Returns an error if the register access fails
    pub fn disable_readout(&self) -> Result<()> {
        self.write_control_field(ControlField::ReadoutEnable, 0)
    }

    /// The low BCID bits every channel currently presents
    /// # Errors
    /// Returns an error if a status register can't be read
    pub fn read_channel_bcids(&self) -> Result<Vec<u32>> {
        let _lease = self.connection()?;
        let words = CHANNEL_BCIDS
            .iter()
            .map(|&register| self.read_register(register))
            .collect::<Result<Vec<_>>>()?;
        Ok(unpack_fields(&words, FIELD_WIDTH, NUM_CHANNELS))
    }

    /// Apply the same delay to every channel
    /// # Errors
    /// Returns an error if `delay` is out of range or a write fails
    pub fn write_common_delay(&self, delay: u32) -> Result<()> {
        self.write_channel_delays(&[delay; NUM_CHANNELS])
    }

    /// # Errors
    /// Returns an error unless exactly one in-range delay per channel is given, or if a write fails
    pub fn write_channel_delays(&self, delays: &[u32]) -> Result<()> {
        self.delay_writes(delays)?
            .into_iter()
            .try_for_each(|write| self.write_register(write.register, write.value))
    }

    fn delay_writes(&self, delays: &[u32]) -> Result<Vec<RegisterWrite>> {
        if delays.len() != NUM_CHANNELS {
            return Err(Error::config(
                "ChannelDelays",
                format!("expected {NUM_CHANNELS} delays, got {}", delays.len()),
            ));
        }
        for &delay in delays {
            check_delay("ChannelDelays", delay)?;
        }
        Ok(CHANNEL_DELAYS
            .iter()
            .zip(pack_fields(delays, FIELD_WIDTH))
            .map(|(&register, word)| RegisterWrite::new(register, word))
            .collect())
    }

    /// Find and apply the per-channel delays that make every channel present the same BCID
    /// # Errors
    /// Returns an error if a register access fails
    pub fn deskew(&self) -> Result<Option<DeskewSolution>> {
        deskew::run(self, &self.alignment)
    }

    /// Find and apply the strobe phase at which every channel reliably presents the same BCID
    /// # Errors
    /// Returns an error if a register access fails
    pub fn select_strobe(&self) -> Result<Option<u32>> {
        strobe::run(self, &self.alignment)
    }
}

impl<C: Connector> ChannelScan for AlignmentChipSet<'_, C> {
    fn channel_count(&self) -> usize {
        NUM_CHANNELS
    }

    fn value_period(&self) -> u32 {
        1 << FIELD_WIDTH
    }

    fn read_channel_values(&self) -> Result<Vec<u32>> {
        self.read_channel_bcids()
    }

    fn delay_settings(&self) -> u32 {
        DELAY_SETTINGS
    }

    fn write_common_delay(&self, delay: u32) -> Result<()> {
        AlignmentChipSet::write_common_delay(self, delay)
    }

    fn write_channel_delays(&self, delays: &[u32]) -> Result<()> {
        AlignmentChipSet::write_channel_delays(self, delays)
    }

    fn strobe_settings(&self) -> u32 {
        STROBE_SETTINGS
    }

    fn write_strobe(&self, strobe: u32) -> Result<()> {
        self.write_register(STROBE, strobe)
    }
}

impl<C: Connector> Device for AlignmentChipSet<'_, C> {
    fn skip_set(&self) -> &BTreeSet<u32> {
        &self.common.skip_registers
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.common.retry
    }

    fn write_configuration(&self) -> Result<WriteReport> {
        let mut plan = vec![
            RegisterWrite::new(CONTROL, self.control.to_word()?)
                .critical()
                .verified(),
            RegisterWrite::new(STROBE, self.strobe),
        ];
        plan.extend(self.delay_writes(&self.delays)?);
        let report = write_sequence(self, &plan)?;
        info!(device = %self.name(), control = ?self.control, strobe = self.strobe, "Configured alignment chip set");
        Ok(report)
    }

    fn read_configuration(&self) -> Result<BTreeMap<u32, u32>> {
        let mut registers = vec![CONTROL, STROBE];
        registers.extend(CHANNEL_DELAYS);
        read_set(self, &registers, &[CONTROL])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::RegisterAddress,
        devices::tests::{
            manager,
            SERVER,
        },
        transport::mock::MockBoard,
    };
    use serde_json::{
        json,
        Value,
    };
    use std::time::Duration;

    fn chip_set<'m, C: Connector>(
        mgr: &'m ConnectionManager<C>,
        extra: Value,
    ) -> Result<AlignmentChipSet<'m, C>> {
        let mut cfg = json!({ "ServerAddress": SERVER, "DeviceAddress": "sector.pad" });
        if let (Some(cfg), Value::Object(extra)) = (cfg.as_object_mut(), extra) {
            cfg.extend(extra);
        }
        AlignmentChipSet::new(mgr, &ConfigTree::new(cfg), &Settings::default()).map(|dev| {
            dev.with_retry(RetryPolicy::new(2, Duration::ZERO))
                .with_alignment(AlignmentSettings {
                    settle: Duration::ZERO,
                    samples: 3,
                    max_attempts: 1,
                })
        })
    }

    /// Make each BCID status register present, per channel, `bcid(channel, delay, strobe)`
    fn simulate<F>(board: &MockBoard, bus: &str, bcid: F)
    where
        F: Fn(usize, u32, u32) -> u32 + Clone + Send + 'static,
    {
        for (word, &register) in CHANNEL_BCIDS.iter().enumerate() {
            let delay_reg = RegisterAddress::new(bus, CHANNEL_DELAYS[word]);
            let strobe_reg = RegisterAddress::new(bus, STROBE);
            let bcid = bcid.clone();
            board.respond_with(&RegisterAddress::new(bus, register), move |regs| {
                let delays = unpack_fields(&[regs.value(&delay_reg)], FIELD_WIDTH, 8);
                let strobe = regs.value(&strobe_reg);
                let fields: Vec<u32> = delays
                    .iter()
                    .enumerate()
                    .map(|(i, &delay)| bcid(word * 8 + i, delay, strobe))
                    .collect();
                pack_fields(&fields, FIELD_WIDTH)[0]
            });
        }
    }

    #[test]
    fn test_control_packing() {
        let control = Control {
            readout_enable: true,
            start_idle_state: false,
            readout_bc_offset: 0x12,
            bcid_offset: 0x34,
        };
        let word = control.to_word().unwrap();
        assert_eq!(word, 0x0034_1201);
        assert_eq!(Control::from_word(word).unwrap(), control);
    }

    #[test]
    fn test_write_configuration() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(
            &mgr,
            json!({ "ReadoutEnable": true, "ReadoutBcOffset": "0x5", "Strobe": 3, "CommonDelay": 2 }),
        )
        .unwrap();
        let report = dev.write_configuration().unwrap();
        assert!(report.is_complete());
        assert_eq!(board.value(&dev.address(CONTROL)), 0x0000_0501);
        assert_eq!(board.value(&dev.address(STROBE)), 3);
        for register in CHANNEL_DELAYS {
            assert_eq!(board.value(&dev.address(register)), 0x2222_2222);
        }
        let values = dev.read_configuration().unwrap();
        assert_eq!(values[&CONTROL], 0x0000_0501);
        assert_eq!(values.len(), 5);
    }

    #[test]
    fn test_control_readback_mismatch_is_fatal() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        board.corrupt_readback(&dev.address(CONTROL));
        assert!(matches!(
            dev.write_configuration(),
            Err(Error::ReadbackMismatch { .. })
        ));
        assert!(board.writes_to(&dev.address(STROBE)).is_empty());
    }

    #[test]
    fn test_bad_configuration() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        assert!(chip_set(&mgr, json!({ "ChannelDelays": [1, 2, 3] })).is_err());
        assert!(chip_set(&mgr, json!({ "CommonDelay": 16 })).is_err());
        assert!(chip_set(&mgr, json!({ "Strobe": 8 })).is_err());
        assert!(chip_set(&mgr, json!({ "BcidOffset": 256 })).is_err());
    }

    #[test]
    fn test_control_fields() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        board.set(&dev.address(CONTROL), 0x0034_0000);
        dev.enable_readout().unwrap();
        assert_eq!(board.value(&dev.address(CONTROL)), 0x0034_0001);
        dev.write_control_field(ControlField::ReadoutBcOffset, 7)
            .unwrap();
        assert_eq!(board.value(&dev.address(CONTROL)), 0x0034_0701);
        dev.disable_readout().unwrap();
        assert_eq!(board.value(&dev.address(CONTROL)), 0x0034_0700);
        assert!(dev
            .write_control_field(ControlField::BcidOffset, 300)
            .is_err());
    }

    #[test]
    fn test_channel_bcids() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        board.set(&dev.address(CHANNEL_BCIDS[0]), 0x7654_3210);
        board.set(&dev.address(CHANNEL_BCIDS[2]), 0xFFFF_FFFF);
        let bcids = dev.read_channel_bcids().unwrap();
        assert_eq!(bcids.len(), NUM_CHANNELS);
        assert_eq!(&bcids[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&bcids[8..16], &[0; 8]);
        assert_eq!(&bcids[16..], &[0xF; 8]);
    }

    #[test]
    fn test_channel_delays() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        let delays: Vec<u32> = (0..24).map(|ch| ch % 16).collect();
        dev.write_channel_delays(&delays).unwrap();
        assert_eq!(board.value(&dev.address(CHANNEL_DELAYS[0])), 0x7654_3210);
        assert_eq!(board.value(&dev.address(CHANNEL_DELAYS[1])), 0xFEDC_BA98);
        assert_eq!(board.value(&dev.address(CHANNEL_DELAYS[2])), 0x7654_3210);
        assert!(dev.write_channel_delays(&delays[..4]).is_err());
        assert!(dev.write_channel_delays(&[16; NUM_CHANNELS]).is_err());
    }

    #[test]
    fn test_deskew() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        // Even channels see 0xc until delay 2 and odd ones until delay 6
        simulate(&board, dev.bus(), |channel, delay, _| {
            let phase = if channel % 2 == 0 { 4 } else { 0 };
            (12 + (delay + phase) / 6) % 16
        });
        let solution = dev.deskew().unwrap().unwrap();
        assert_eq!(solution.target, 0xd);
        for register in CHANNEL_DELAYS {
            assert_eq!(board.value(&dev.address(register)), 0x6262_6262);
        }
        assert_eq!(dev.read_channel_bcids().unwrap(), vec![0xd; NUM_CHANNELS]);
    }

    #[test]
    fn test_deskew_without_common_value() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        // Channel 0 never changes, so it has no interior run
        simulate(&board, dev.bus(), |channel, delay, _| {
            if channel == 0 {
                3
            } else {
                (12 + delay / 6) % 16
            }
        });
        assert_eq!(dev.deskew().unwrap(), None);
        for register in CHANNEL_DELAYS {
            assert_eq!(board.value(&dev.address(register)), 0);
        }
    }

    #[test]
    fn test_select_strobe() {
        let board = MockBoard::new();
        let mgr = manager(&board);
        let dev = chip_set(&mgr, json!({})).unwrap();
        simulate(&board, dev.bus(), |channel, _, strobe| {
            let phase = if channel % 2 == 0 { 2 } else { 1 };
            3 + (strobe + phase) / 4
        });
        assert_eq!(dev.select_strobe().unwrap(), Some(3));
        assert_eq!(board.value(&dev.address(STROBE)), 3);
        assert_eq!(
            board.writes_to(&dev.address(STROBE)),
            vec![0, 1, 2, 3, 4, 5, 6, 7, 3]
        );
    }
}
