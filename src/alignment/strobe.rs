//! Strobe phase selection
//!
//! The strobe shifts the sampling phase of every channel at once. The chosen phase is the smallest
//! one at which all channels present the same value and that value sits inside an unbroken run for
//! every channel, i.e. away from the edges where sampling is unreliable.

use super::{
    per_channel,
    sample_medians,
    viable_values,
    ChannelScan,
};
use crate::{
    config::AlignmentSettings,
    core::snooze,
    error::Result,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Select the strobe from `medians[strobe][channel]`
#[must_use]
pub fn select_strobe(medians: &[Vec<u32>], period: u32) -> Option<u32> {
    let viable: Vec<_> = per_channel(medians)
        .iter()
        .map(|sequence| viable_values(sequence, period))
        .collect();
    if viable.is_empty() {
        return None;
    }
    medians.iter().enumerate().find_map(|(strobe, row)| {
        let (&value, rest) = row.split_first()?;
        let agreed = rest.iter().all(|&v| v == value) && viable.iter().all(|set| set.contains(&value));
        if agreed {
            u32::try_from(strobe).ok()
        } else {
            None
        }
    })
}

/// Scan every strobe phase of `device` and write the selected one back. Returns `None` after
/// restoring strobe zero when no phase qualifies.
/// # Errors
/// Returns an error if a register access fails after retries
pub fn run<D: ChannelScan + ?Sized>(device: &D, settings: &AlignmentSettings) -> Result<Option<u32>> {
    let name = device.name();
    let _lease = device.connection()?;
    info!(device = %name, settings = device.strobe_settings(), "Scanning strobe phases");
    let mut medians = Vec::new();
    for strobe in 0..device.strobe_settings() {
        device.write_strobe(strobe)?;
        snooze(settings.settle);
        let row = sample_medians(device, settings.samples)?;
        debug!(device = %name, strobe, medians = ?row, "Scanned strobe");
        medians.push(row);
    }
    if let Some(strobe) = select_strobe(&medians, device.value_period()) {
        info!(device = %name, strobe, "Strobe selected");
        device.write_strobe(strobe)?;
        Ok(Some(strobe))
    } else {
        warn!(device = %name, "No strobe phase where every channel agrees");
        device.write_strobe(0)?;
        Ok(None)
    }
}
