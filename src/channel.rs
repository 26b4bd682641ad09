use crate::error::{PslError, Result};
use crate::mapping::MappingControl;
use crate::module::Module;
use crate::sinc::{CalibrationData, CalibrationProgress, HistogramData, OscilloscopeData, Payload};
use crate::stats::Stats;
use log::{debug, info, warn};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Channel state as last reported by the device through `channel.state`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Ready,
    Adc,
    Histogram,
    ListMode,
    Characterizing,
    Error,
}

const STATE_COUNT: usize = 7;

impl ChannelState {
    pub fn from_device(value: &str) -> Option<Self> {
        let state = match value {
            "disconnected" => Self::Disconnected,
            "ready" => Self::Ready,
            "oscilloscope" | "adc" => Self::Adc,
            "histogram" => Self::Histogram,
            "listMode" => Self::ListMode,
            "calibrating" | "characterizing" => Self::Characterizing,
            "error" => Self::Error,
            _ => return None,
        };
        Some(state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Adc => "oscilloscope",
            Self::Histogram => "histogram",
            Self::ListMode => "listMode",
            Self::Characterizing => "characterizing",
            Self::Error => "error",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Whether the calibration held locally matches the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CalibrationState {
    #[default]
    None,
    Ready,
    NeedRefresh,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Features {
    pub mca_gate_veto: bool,
    pub termination_50ohm: bool,
    pub attenuation_ground: bool,
    pub risetime_optimization: bool,
    /// ADC sample rate in Hz.
    pub sample_rate: f64,
    pub max_scas: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Progress {
    pub percentage: f64,
    pub stage: String,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct ChannelInner {
    pub state: ChannelState,
    pub calibration_state: CalibrationState,
    pub features: Features,
    pub mapping: MappingControl,
    pub stats: Stats,
    pub adc_trace: Vec<u32>,
    /// Set when an oscilloscope frame has arrived since the last trace request.
    pub adc_trace_ready: bool,
    /// A caller is waiting on this channel's event.
    pub async_ready: bool,
    pub calibration: Option<CalibrationData>,
    pub progress: Progress,
    pub detector_polarity: i64,
    transitions: u64,
    entered: [u64; STATE_COUNT],
}

impl ChannelInner {
    /// Transition counter, for waiting on states entered after this point.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    fn entered_since(&self, state: ChannelState, mark: u64) -> bool {
        self.entered[state.index()] > mark
    }

    fn enter(&mut self, state: ChannelState) {
        let previous = self.state;
        if matches!(
            previous,
            ChannelState::Characterizing | ChannelState::Disconnected
        ) && state == ChannelState::Ready
        {
            self.calibration_state = CalibrationState::NeedRefresh;
        }
        if previous == ChannelState::Characterizing && state != ChannelState::Characterizing {
            self.progress.running = false;
        }
        self.state = state;
        self.transitions += 1;
        self.entered[state.index()] = self.transitions;
    }
}

#[derive(Debug)]
pub struct Channel {
    /// Index on the module, as used on the wire.
    pub index: i32,
    /// System-wide detector channel number.
    pub det_chan: i32,
    pub alias: String,
    inner: Mutex<ChannelInner>,
    event: Condvar,
}

impl Channel {
    pub fn new(index: i32, det_chan: i32, alias: impl Into<String>) -> Self {
        Self {
            index,
            det_chan,
            alias: alias.into(),
            inner: Mutex::new(ChannelInner::default()),
            event: Condvar::new(),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, ChannelInner>> {
        Ok(self.inner.lock()?)
    }

    pub fn state(&self) -> Result<ChannelState> {
        Ok(self.lock()?.state)
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(self.lock()?.stats)
    }

    pub fn features(&self) -> Result<Features> {
        Ok(self.lock()?.features)
    }

    /// Record a state reported by the device and wake waiters.
    pub fn apply_state(&self, state: ChannelState) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != state {
            debug!(
                "channel {}: {} -> {}",
                self.index,
                inner.state.as_str(),
                state.as_str()
            );
        }
        inner.enter(state);
        drop(inner);
        self.event.notify_all();
        Ok(())
    }

    pub fn on_histogram(&self, data: &HistogramData) -> Result<()> {
        let stats = Stats::from_histogram(&data.stats);
        let mut inner = self.lock()?;
        inner.stats = stats;
        inner.mapping.receive(self.index, data, &stats);
        Ok(())
    }

    pub fn on_oscilloscope(&self, data: OscilloscopeData) -> Result<()> {
        let mut inner = self.lock()?;
        inner.adc_trace = data.samples;
        inner.adc_trace_ready = true;
        let waiting = inner.async_ready;
        drop(inner);
        if waiting {
            self.event.notify_all();
        }
        Ok(())
    }

    pub fn on_progress(&self, progress: CalibrationProgress) -> Result<()> {
        let mut inner = self.lock()?;
        inner.progress.percentage = progress.progress;
        inner.progress.stage = progress.stage;
        // Running ends with the channel leaving the characterizing state.
        if progress.complete {
            debug!("channel {}: characterization complete", self.index);
        }
        drop(inner);
        self.event.notify_all();
        Ok(())
    }

    /// Wait until the channel enters `target` after transition `mark`.
    ///
    /// A channel that is already in `target` when `mark` is its current
    /// transition count also satisfies the wait.
    pub fn wait_for_state(
        &self,
        target: ChannelState,
        mark: u64,
        timeout: Duration,
    ) -> Result<()> {
        let inner = self.lock()?;
        let (mut inner, _) = self.event.wait_timeout_while(inner, timeout, |inner| {
            !(inner.state == target
                || inner.entered_since(target, mark)
                || inner.entered_since(ChannelState::Error, mark))
        })?;
        inner.async_ready = false;
        if inner.state == target || inner.entered_since(target, mark) {
            return Ok(());
        }
        if inner.entered_since(ChannelState::Error, mark) {
            return Err(PslError::InvalidState(format!(
                "channel {} reported an error while waiting for {}",
                self.index,
                target.as_str()
            )));
        }
        Err(PslError::ChannelStateTimeout {
            channel: self.index,
            state: target.as_str(),
        })
    }

    /// Wait for an oscilloscope frame and take it.
    pub fn wait_for_trace(&self, timeout: Duration) -> Result<Vec<u32>> {
        let inner = self.lock()?;
        let (mut inner, _) = self
            .event
            .wait_timeout_while(inner, timeout, |inner| !inner.adc_trace_ready)?;
        inner.async_ready = false;
        if !inner.adc_trace_ready {
            return Err(PslError::AdcTraceTimeout);
        }
        inner.adc_trace_ready = false;
        Ok(inner.adc_trace.clone())
    }

    /// Bring the channel into `target` by sending `command`.
    ///
    /// Does nothing if the channel is already there. The channel lock is not
    /// held across the transaction.
    pub fn start(
        &self,
        module: &Module,
        target: ChannelState,
        command: Payload,
        timeout: Duration,
    ) -> Result<()> {
        let mark = {
            let inner = self.lock()?;
            if inner.state == target {
                return Ok(());
            }
            inner.transitions()
        };
        module.command(self.index, command)?;
        self.lock()?.async_ready = true;
        self.wait_for_state(target, mark, timeout)?;
        info!("channel {}: {}", self.index, target.as_str());
        Ok(())
    }

    /// Stop whatever the channel is doing and wait for it to be ready.
    pub fn stop(&self, module: &Module, skip: bool, timeout: Duration) -> Result<()> {
        let mark = self.lock()?.transitions();
        module.command(self.index, Payload::StopDataAcquisition { skip })?;
        self.lock()?.async_ready = true;
        let inner = self.lock()?;
        let (mut inner, _) = self.event.wait_timeout_while(inner, timeout, |inner| {
            inner.state != ChannelState::Ready
                && !inner.entered_since(ChannelState::Error, mark)
        })?;
        inner.async_ready = false;
        match inner.state {
            ChannelState::Ready => Ok(()),
            state => {
                warn!(
                    "channel {}: still {} after stop",
                    self.index,
                    state.as_str()
                );
                Err(PslError::ChannelStateTimeout {
                    channel: self.index,
                    state: ChannelState::Ready.as_str(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn device_strings_map_to_states() {
        assert_eq!(ChannelState::from_device("adc"), Some(ChannelState::Adc));
        assert_eq!(
            ChannelState::from_device("oscilloscope"),
            Some(ChannelState::Adc)
        );
        assert_eq!(
            ChannelState::from_device("calibrating"),
            Some(ChannelState::Characterizing)
        );
        assert_eq!(
            ChannelState::from_device("listMode"),
            Some(ChannelState::ListMode)
        );
        assert_eq!(ChannelState::from_device("sleeping"), None);
    }

    #[test]
    fn ready_after_characterizing_needs_refresh() {
        let channel = Channel::new(0, 0, "det0");
        channel.apply_state(ChannelState::Ready).unwrap();
        // Disconnected -> Ready also counts.
        assert_eq!(
            channel.lock().unwrap().calibration_state,
            CalibrationState::NeedRefresh
        );

        channel.lock().unwrap().calibration_state = CalibrationState::Ready;
        channel.apply_state(ChannelState::Histogram).unwrap();
        channel.apply_state(ChannelState::Ready).unwrap();
        assert_eq!(
            channel.lock().unwrap().calibration_state,
            CalibrationState::Ready
        );

        channel.apply_state(ChannelState::Characterizing).unwrap();
        channel.apply_state(ChannelState::Ready).unwrap();
        assert_eq!(
            channel.lock().unwrap().calibration_state,
            CalibrationState::NeedRefresh
        );
    }

    #[test]
    fn wait_sees_a_state_that_came_and_went() {
        let channel = Channel::new(0, 0, "det0");
        channel.apply_state(ChannelState::Ready).unwrap();
        let mark = channel.lock().unwrap().transitions();
        channel.apply_state(ChannelState::Histogram).unwrap();
        channel.apply_state(ChannelState::Ready).unwrap();
        channel
            .wait_for_state(ChannelState::Histogram, mark, Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn wait_times_out_with_typed_error() {
        let channel = Channel::new(2, 0, "det0");
        let mark = channel.lock().unwrap().transitions();
        let err = channel
            .wait_for_state(ChannelState::Histogram, mark, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(
            err,
            PslError::ChannelStateTimeout {
                channel: 2,
                state: "histogram"
            }
        ));
    }

    #[test]
    fn trace_wakes_waiter() {
        let channel = Arc::new(Channel::new(0, 0, "det0"));
        channel.lock().unwrap().async_ready = true;
        let producer = Arc::clone(&channel);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer
                .on_oscilloscope(OscilloscopeData {
                    samples: vec![1, 2, 3],
                })
                .unwrap();
        });
        let trace = channel.wait_for_trace(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(trace, vec![1, 2, 3]);
        assert!(matches!(
            channel.wait_for_trace(Duration::from_millis(10)),
            Err(PslError::AdcTraceTimeout)
        ));
    }
}
