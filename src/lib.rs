pub mod acq_values;
pub mod board_ops;
pub mod channel;
pub mod characterization;
pub mod config;
pub mod defaults;
pub mod error;
pub mod mapping;
pub mod module;
pub mod params;
pub mod psl;
pub mod run_data;
pub mod sim;
pub mod sinc;
pub mod stats;
pub mod transport;

pub use board_ops::{BoardData, BoardInfo};
pub use channel::{CalibrationState, ChannelState, Features};
pub use config::{ChannelSettings, Conf, FirmwareSettings, ModuleSettings};
pub use defaults::{Defaults, DefaultsStore};
pub use error::{PslError, Result};
pub use module::{Module, Timeouts};
pub use psl::Psl;
pub use run_data::RunData;
pub use sim::{SimOptions, SimServer};
pub use stats::Stats;
