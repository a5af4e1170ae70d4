//! Closed-loop procedures that converge noisy multi-channel hardware state
//!
//! All of them drive a [`Device`](crate::devices::Device) through its register accessors only,
//! hold one lease for their whole run, and report their reasoning as `tracing` events. Failing to
//! converge is not an error: the outcome says so and a warning is logged.

pub mod deskew;
pub mod reset;
pub mod strobe;

pub use deskew::{
    choose_target,
    DeskewSolution,
};
pub use reset::ResetAlignment;
pub use strobe::select_strobe;

use crate::{
    core::median,
    devices::Device,
    error::Result,
};
use std::collections::BTreeSet;

/// Devices whose channels each present a small wrapping value (for example the low bits of a
/// BCID) that can be shifted by a per-channel delay or a common strobe phase
pub trait ChannelScan: Device {
    fn channel_count(&self) -> usize;

    /// Channel values wrap modulo this period
    fn value_period(&self) -> u32;

    /// One reading of every channel's value
    /// # Errors
    /// Returns an error if a status register can't be read
    fn read_channel_values(&self) -> Result<Vec<u32>>;

    /// Number of delay settings, scanned from zero
    fn delay_settings(&self) -> u32;

    /// # Errors
    /// Returns an error if a delay register can't be written
    fn write_common_delay(&self, delay: u32) -> Result<()>;

    /// # Errors
    /// Returns an error if a delay register can't be written
    fn write_channel_delays(&self, delays: &[u32]) -> Result<()>;

    /// Number of strobe phases, scanned from zero
    fn strobe_settings(&self) -> u32;

    /// # Errors
    /// Returns an error if the strobe register can't be written
    fn write_strobe(&self, strobe: u32) -> Result<()>;
}

/// Per-channel medians of `samples` readings
/// # Errors
/// Returns an error if a reading fails
pub fn sample_medians<D: ChannelScan + ?Sized>(device: &D, samples: usize) -> Result<Vec<u32>> {
    let readings = (0..samples.max(1))
        .map(|_| device.read_channel_values())
        .collect::<Result<Vec<_>>>()?;
    Ok((0..device.channel_count())
        .map(|channel| {
            let values: Vec<u32> = readings
                .iter()
                .filter_map(|reading| reading.get(channel).copied())
                .collect();
            median(&values).unwrap_or_default()
        })
        .collect())
}

/// How a closed-loop procedure ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentOutcome {
    pub converged: bool,
    /// Corrective actions (resets, writes) issued before the procedure stopped
    pub attempts: usize,
}

/// Values of `sequence` that appear as one unbroken interior run.
///
/// The first and last values of the sequence are excluded since their runs may extend beyond the
/// scanned range. Values are taken modulo `period`: a sequence that is not monotonic as-is is
/// unwrapped by moving values below `period / 2` up by one period. A sequence that is monotonic
/// neither way has no viable values.
///
/// The unwrap assumes a wrapping scan starts in the upper half of the period, which holds when the
/// scan covers less than half a period. A wrapping scan starting in the lower half has no viable
/// values.
#[must_use]
pub fn viable_values(sequence: &[u32], period: u32) -> BTreeSet<u32> {
    let period = u64::from(period.max(1));
    let raw: Vec<u64> = sequence.iter().map(|&v| u64::from(v)).collect();
    let unwrapped = if is_monotonic(&raw) {
        raw
    } else {
        let rotated: Vec<u64> = raw
            .iter()
            .map(|&v| if v < period / 2 { v + period } else { v })
            .collect();
        if !is_monotonic(&rotated) {
            return BTreeSet::new();
        }
        rotated
    };
    let (Some(&first), Some(&last)) = (unwrapped.first(), unwrapped.last()) else {
        return BTreeSet::new();
    };
    unwrapped
        .iter()
        .filter(|&&v| v != first && v != last)
        .filter_map(|&v| u32::try_from(v % period).ok())
        .collect()
}

fn is_monotonic(values: &[u64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// Transposes `medians[setting][channel]` into one sequence per channel
pub(crate) fn per_channel(medians: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let channels = medians.iter().map(Vec::len).min().unwrap_or(0);
    (0..channels)
        .map(|ch| medians.iter().map(|row| row[ch]).collect())
        .collect()
}
