pub mod mm0;
pub mod mm1;
pub mod xmap;

use crate::sinc::HistogramData;
use crate::stats::Stats;
use log::{debug, warn};
pub use mm0::Mm0;
pub use mm1::{Mm1, Mm1Settings, PixelAdvance};

#[derive(Debug, Default)]
pub enum MappingControl {
    #[default]
    None,
    Mca(Mm0),
    McaFsm(Mm1),
    Sca,
    List,
}

impl MappingControl {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mca(_) => "mca",
            Self::McaFsm(_) => "mca-mapping",
            Self::Sca => "sca-mapping",
            Self::List => "list-mode",
        }
    }

    pub fn mm0(&self) -> Option<&Mm0> {
        match self {
            Self::Mca(mm0) => Some(mm0),
            _ => None,
        }
    }

    pub fn mm0_mut(&mut self) -> Option<&mut Mm0> {
        match self {
            Self::Mca(mm0) => Some(mm0),
            _ => None,
        }
    }

    pub fn mm1(&self) -> Option<&Mm1> {
        match self {
            Self::McaFsm(mm1) => Some(mm1),
            _ => None,
        }
    }

    pub fn mm1_mut(&mut self) -> Option<&mut Mm1> {
        match self {
            Self::McaFsm(mm1) => Some(mm1),
            _ => None,
        }
    }

    /// Feed one histogram frame to the open buffers.
    pub fn receive(&mut self, channel: i32, data: &HistogramData, stats: &Stats) {
        match self {
            Self::Mca(mm0) => mm0.update(data, stats),
            Self::McaFsm(mm1) => {
                if let Err(e) = mm1.update(data, stats) {
                    warn!("channel {channel}: {e}");
                }
            }
            Self::None | Self::Sca | Self::List => {
                debug!(
                    "channel {channel}: histogram dropped, no {} buffers open",
                    self.name()
                );
            }
        }
    }
}
