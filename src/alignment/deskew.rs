//! Per-channel delay deskew
//!
//! Every delay setting is applied to all channels at once and the channels' values are sampled.
//! Per channel, the values seen over the scan form runs; a value is viable for a channel when its
//! run lies fully inside the scan. The target is a value viable for every channel, and each channel
//! is then given the smallest delay at which it presents the target.

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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeskewSolution {
    /// Value every channel presents once delayed
    pub target: u32,
    /// Delay setting per channel
    pub delays: Vec<u32>,
    pub total_delay: u64,
}

/// Pick the common target for `sequences` (one per channel, indexed by delay setting).
///
/// Among the values viable for every channel the one needing the least total delay wins, ties going
/// to the smaller value. `None` if the channels share no viable value.
#[must_use]
pub fn choose_target(sequences: &[Vec<u32>], period: u32) -> Option<DeskewSolution> {
    let viable: Vec<_> = sequences
        .iter()
        .map(|sequence| viable_values(sequence, period))
        .collect();
    let (first, rest) = viable.split_first()?;
    let mut best: Option<DeskewSolution> = None;
    for &target in first.iter().filter(|v| rest.iter().all(|set| set.contains(v))) {
        let delays: Option<Vec<u32>> = sequences
            .iter()
            .map(|sequence| {
                sequence
                    .iter()
                    .position(|&v| v == target)
                    .and_then(|setting| u32::try_from(setting).ok())
            })
            .collect();
        let Some(delays) = delays else {
            continue;
        };
        let total_delay = delays.iter().map(|&d| u64::from(d)).sum();
        if best.as_ref().map_or(true, |b| total_delay < b.total_delay) {
            best = Some(DeskewSolution {
                target,
                delays,
                total_delay,
            });
        }
    }
    best
}

/// Scan every delay setting of `device`, choose the target and write the per-channel delays.
/// Returns `None` after resetting the delays to zero when no common target exists.
/// # Errors
/// Returns an error if a register access fails after retries
pub fn run<D: ChannelScan + ?Sized>(
    device: &D,
    settings: &AlignmentSettings,
) -> Result<Option<DeskewSolution>> {
    let name = device.name();
    let _lease = device.connection()?;
    info!(device = %name, settings = device.delay_settings(), "Scanning channel delays");
    let mut medians = Vec::new();
    for delay in 0..device.delay_settings() {
        device.write_common_delay(delay)?;
        snooze(settings.settle);
        let row = sample_medians(device, settings.samples)?;
        debug!(device = %name, delay, medians = ?row, "Scanned delay");
        medians.push(row);
    }
    let sequences = per_channel(&medians);
    for (channel, sequence) in sequences.iter().enumerate() {
        let viable = viable_values(sequence, device.value_period());
        debug!(device = %name, channel, ?sequence, ?viable, "Viable values");
    }
    if let Some(solution) = choose_target(&sequences, device.value_period()) {
        info!(
            device = %name,
            target = solution.target,
            delays = ?solution.delays,
            total_delay = solution.total_delay,
            "Deskew target chosen"
        );
        device.write_channel_delays(&solution.delays)?;
        Ok(Some(solution))
    } else {
        warn!(device = %name, "Channels share no viable value, deskew failed");
        device.write_common_delay(0)?;
        Ok(None)
    }
}
