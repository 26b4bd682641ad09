use super::xmap;
use crate::error::{PslError, Result};
use crate::sinc::HistogramData;
use crate::stats::Stats;
use log::warn;

/// Words of statistics appended after the spectra.
pub const STATS_WORDS: usize = xmap::pixel::STATS_PER_CHANNEL;

#[derive(Debug, Default)]
struct Slot {
    words: Vec<u32>,
    level: usize,
    stats: Stats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Readout {
    /// Accepted spectrum (if enabled), rejected spectrum (if enabled), stats words.
    pub words: Vec<u32>,
    pub stats: Stats,
}

/// Single-spectrum MCA mode.
///
/// The receive worker writes the newest frame into the next slot and flips it
/// to active; readers copy the active slot out. Reading `mca` consumes it.
#[derive(Debug)]
pub struct Mm0 {
    num_mca_channels: usize,
    accepted: bool,
    rejected: bool,
    slots: [Slot; 2],
    active: usize,
}

impl Mm0 {
    pub fn open(num_mca_channels: usize, accepted: bool, rejected: bool) -> Self {
        let len = (accepted as usize + rejected as usize) * num_mca_channels + STATS_WORDS;
        let slot = || Slot {
            words: vec![0; len],
            ..Default::default()
        };
        Self {
            num_mca_channels,
            accepted,
            rejected,
            slots: [slot(), slot()],
            active: 0,
        }
    }

    pub fn num_mca_channels(&self) -> usize {
        self.num_mca_channels
    }

    pub fn buffer_len(&self) -> usize {
        self.slots[0].words.len()
    }

    pub fn has_spectrum(&self) -> bool {
        self.slots[self.active].level > 0
    }

    pub fn update(&mut self, data: &HistogramData, stats: &Stats) {
        let n = self.num_mca_channels;
        let (accepted, rejected) = (self.accepted, self.rejected);
        let next = 1 - self.active;
        let slot = &mut self.slots[next];
        slot.words.fill(0);
        slot.level = 0;

        let mut offset = 0;
        if accepted {
            if data.accepted.len() == n {
                slot.words[..n].copy_from_slice(&data.accepted);
            } else {
                warn!(
                    "accepted spectrum has {} bins, expected {n}; skipped",
                    data.accepted.len()
                );
            }
            offset += n;
        }
        if rejected {
            if data.rejected.len() == n {
                slot.words[offset..offset + n].copy_from_slice(&data.rejected);
            } else {
                warn!(
                    "rejected spectrum has {} bins, expected {n}; skipped",
                    data.rejected.len()
                );
            }
            offset += n;
        }
        xmap::put_stats(&mut slot.words, offset, stats);
        slot.level = slot.words.len();
        slot.stats = *stats;
        self.active = next;
    }

    /// Copy out and consume the active spectrum.
    pub fn read(&mut self) -> Result<Readout> {
        let slot = &mut self.slots[self.active];
        if slot.level == 0 {
            return Err(PslError::NoSpectrum);
        }
        slot.level = 0;
        Ok(Readout {
            words: slot.words.clone(),
            stats: slot.stats,
        })
    }

    /// The accepted spectrum of the active slot, without consuming it.
    pub fn accepted(&self) -> Result<&[u32]> {
        let slot = &self.slots[self.active];
        if slot.level == 0 || !self.accepted {
            return Err(PslError::NoSpectrum);
        }
        Ok(&slot.words[..self.num_mca_channels])
    }
}
