//! Iterative reset alignment of serial input channels
//!
//! Channels report "aligned" as one bit each of a status word. Channels share reset domains (for
//! example the QPLL feeding a group of fibers), so a misaligned channel can only be fixed by
//! resetting its whole domain. Each round samples the status word, pulses the reset of every domain
//! holding a channel that missed any sample, and starts over until no domain needs a reset.

use super::AlignmentOutcome;
use crate::{
    config::AlignmentSettings,
    core::snooze,
    devices::Device,
    error::Result,
};
use std::{
    collections::BTreeSet,
    time::Duration,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetAlignment {
    /// Status register with one "aligned" bit per channel
    pub alignment_register: u32,
    /// Register taking a mask of domains to reset
    pub reset_register: u32,
    /// Written to the reset register to end the pulse
    pub reset_idle: u32,
    pub channels: usize,
    /// Consecutive channels sharing one reset
    pub domain_size: usize,
    /// Status reads per round
    pub samples: usize,
    /// Resets issued before giving up
    pub max_attempts: usize,
    pub settle: Duration,
    /// Channels that are never inspected
    pub skip: BTreeSet<u32>,
}

impl ResetAlignment {
    /// A plan using the shared alignment tunables
    #[must_use]
    pub fn new(alignment_register: u32, reset_register: u32, settings: &AlignmentSettings) -> Self {
        Self {
            alignment_register,
            reset_register,
            reset_idle: 0,
            channels: 32,
            domain_size: 4,
            samples: settings.samples,
            max_attempts: settings.max_attempts,
            settle: settings.settle,
            skip: BTreeSet::new(),
        }
    }

    fn is_skipped(&self, channel: usize) -> bool {
        u32::try_from(channel).map_or(true, |ch| self.skip.contains(&ch))
    }

    /// Count for each channel how many of `words` report it aligned
    #[must_use]
    pub fn count_aligned(&self, words: &[u32]) -> Vec<usize> {
        (0..self.channels)
            .map(|ch| {
                words
                    .iter()
                    .filter(|&&word| ch < 32 && (word >> ch) & 1 == 1)
                    .count()
            })
            .collect()
    }

    /// Mask of the domains holding a non-skipped channel that missed any of `samples`
    #[must_use]
    pub fn reset_mask(&self, aligned: &[usize], samples: usize) -> u32 {
        let domain_size = self.domain_size.max(1);
        aligned
            .iter()
            .enumerate()
            .filter(|&(ch, &count)| !self.is_skipped(ch) && count < samples)
            .map(|(ch, _)| ch / domain_size)
            .filter(|&domain| domain < 32)
            .fold(0, |mask, domain| mask | (1 << domain))
    }

    /// Sample the status register [`samples`](Self::samples) times
    /// # Errors
    /// Returns an error if a read fails after retries
    pub fn read_alignment<D: Device + ?Sized>(&self, device: &D, samples: usize) -> Result<Vec<usize>> {
        let words = (0..samples)
            .map(|_| device.read_register(self.alignment_register))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.count_aligned(&words))
    }

    /// Run the procedure on `device`
    /// # Errors
    /// Returns an error if a register access fails after retries. Not converging is not an error.
    pub fn run<D: Device + ?Sized>(&self, device: &D) -> Result<AlignmentOutcome> {
        let name = device.name();
        if (0..self.channels).all(|ch| self.is_skipped(ch)) {
            debug!(device = %name, "Every channel is skipped, nothing to align");
            return Ok(AlignmentOutcome {
                converged: true,
                attempts: 0,
            });
        }
        let _lease = device.connection()?;
        info!(device = %name, "Checking input alignment");
        let mut resets = 0;
        loop {
            snooze(self.settle);
            let aligned = self.read_alignment(device, self.samples)?;
            for (channel, &count) in aligned.iter().enumerate() {
                if self.is_skipped(channel) {
                    continue;
                }
                if count < self.samples {
                    info!(device = %name, channel, aligned = count, samples = self.samples, "Channel misaligned");
                } else {
                    debug!(device = %name, channel, aligned = count, samples = self.samples, "Channel aligned");
                }
            }
            let mask = self.reset_mask(&aligned, self.samples);
            info!(device = %name, "Reset word {mask:#x}");
            if mask == 0 {
                info!(device = %name, resets, "Input alignment succeeded");
                return Ok(AlignmentOutcome {
                    converged: true,
                    attempts: resets,
                });
            }
            if resets >= self.max_attempts {
                warn!(device = %name, resets, "Failed to stabilize inputs, giving up");
                return Ok(AlignmentOutcome {
                    converged: false,
                    attempts: resets,
                });
            }
            device.write_register(self.reset_register, mask)?;
            device.write_register(self.reset_register, self.reset_idle)?;
            resets += 1;
        }
    }
}
