use crate::sinc::HistogramStats;

/// Length of one channel's record in `module_statistics_2`.
pub const MODULE_STATISTICS_LEN: usize = 9;

/// Duration of one XMAP clock tick in seconds.
pub const TICK: f64 = 320e-9;

/// Run statistics for one channel, refreshed from every histogram frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    pub time_elapsed: f64,
    pub triggers: f64,
    pub trigger_livetime: f64,
    pub mca_events: f64,
    pub input_count_rate: f64,
    pub output_count_rate: f64,
    pub samples_detected: f64,
    pub samples_erased: f64,
    pub pulses_accepted: f64,
    pub pulses_rejected: f64,
    /// Fraction of the run spent dead, in `[0, 1]`.
    pub deadtime: f64,
}

impl Stats {
    pub fn from_histogram(stats: &HistogramStats) -> Self {
        let triggers = (stats.pulses_accepted + stats.pulses_rejected) as f64;
        let trigger_livetime = if stats.input_count_rate.is_normal() {
            triggers / stats.input_count_rate
        } else {
            0.0
        };
        Self {
            time_elapsed: stats.time_elapsed,
            triggers,
            trigger_livetime,
            mca_events: stats.pulses_accepted as f64,
            input_count_rate: stats.input_count_rate,
            output_count_rate: stats.output_count_rate,
            samples_detected: stats.samples_detected as f64,
            samples_erased: stats.samples_erased as f64,
            pulses_accepted: stats.pulses_accepted as f64,
            pulses_rejected: stats.pulses_rejected as f64,
            deadtime: stats.dead_time,
        }
    }

    /// Energy livetime.
    pub fn livetime(&self) -> f64 {
        self.time_elapsed * (1.0 - self.deadtime.clamp(0.0, 1.0))
    }

    pub fn realtime_ticks(&self) -> u32 {
        to_ticks(self.time_elapsed)
    }

    pub fn livetime_ticks(&self) -> u32 {
        to_ticks(self.trigger_livetime)
    }

    pub fn module_statistics(&self) -> [f64; MODULE_STATISTICS_LEN] {
        [
            self.time_elapsed,
            self.trigger_livetime,
            0.0,
            self.triggers,
            self.mca_events,
            self.input_count_rate,
            self.output_count_rate,
            0.0,
            0.0,
        ]
    }
}

fn to_ticks(seconds: f64) -> u32 {
    (seconds / TICK).round().clamp(0.0, u32::MAX as f64) as u32
}
