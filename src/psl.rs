use crate::acq_values::{self, ScaBound, HAS_DEFAULT, LOCAL, MAX_MCA_CHANNELS};
use crate::board_ops::{self, BoardData};
use crate::channel::{CalibrationState, Channel, ChannelState};
use crate::characterization;
use crate::config::{ChannelSettings, FirmwareSettings, ModuleSettings};
use crate::defaults::{Defaults, DefaultsStore};
use crate::error::{PslError, Result};
use crate::mapping::{MappingControl, Mm0, Mm1, Mm1Settings, PixelAdvance};
use crate::module::{Module, Timeouts};
use crate::params::Params;
use crate::run_data::{self, RunData, RunDataContext};
use crate::sinc::{CalibrationData, ParamValue, Payload, Waveform};
use crate::stats::Stats;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct ModuleEntry {
    module: Module,
    settings: ModuleSettings,
}

struct Target<'a> {
    module: &'a Module,
    channel: &'a Arc<Channel>,
    settings: &'a ChannelSettings,
}

// Lock order: defaults store, module send-lock, module mutex, channel mutex.
pub struct Psl {
    modules: Vec<ModuleEntry>,
    defaults: Mutex<DefaultsStore>,
    defaults_path: Option<PathBuf>,
    timeouts: Timeouts,
}

impl Psl {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            modules: Vec::new(),
            defaults: Mutex::new(DefaultsStore::new()),
            defaults_path: None,
            timeouts,
        }
    }

    /// A PSL whose defaults store is loaded from, and saved to, `path`.
    pub fn with_defaults_file(timeouts: Timeouts, path: &Path) -> Result<Self> {
        let store = DefaultsStore::load(path)?;
        Ok(Self {
            modules: Vec::new(),
            defaults: Mutex::new(store),
            defaults_path: Some(path.to_path_buf()),
            timeouts,
        })
    }

    fn store(&self) -> Result<MutexGuard<'_, DefaultsStore>> {
        Ok(self.defaults.lock()?)
    }

    fn locate(&self, det_chan: i32) -> Result<Target<'_>> {
        for entry in &self.modules {
            let found = entry
                .module
                .channels()
                .iter()
                .zip(&entry.settings.channels)
                .find(|(channel, _)| channel.det_chan == det_chan);
            if let Some((channel, settings)) = found {
                if !entry.module.is_active(channel.index) {
                    return Err(PslError::NotActive(det_chan));
                }
                return Ok(Target {
                    module: &entry.module,
                    channel,
                    settings,
                });
            }
        }
        Err(PslError::UnknownChannel(det_chan))
    }

    pub fn module(&self, alias: &str) -> Result<&Module> {
        self.modules
            .iter()
            .find(|e| e.module.alias == alias)
            .map(|e| &e.module)
            .ok_or_else(|| PslError::UnknownModule(alias.to_string()))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter().map(|e| &e.module)
    }

    pub fn channel(&self, det_chan: i32) -> Result<&Arc<Channel>> {
        Ok(self.locate(det_chan)?.channel)
    }

    pub fn det_chans(&self) -> Vec<i32> {
        self.modules
            .iter()
            .flat_map(|e| e.module.channels().iter().map(|c| c.det_chan))
            .collect()
    }

    pub fn defaults(&self, alias: &str) -> Result<Option<Defaults>> {
        Ok(self.store()?.section(alias).cloned())
    }

    // --- module and channel setup ---

    /// Connect a module, bring up each of its channels and write their
    /// stored defaults to the device.
    pub fn setup_module(&mut self, settings: ModuleSettings) -> Result<()> {
        if self.modules.iter().any(|e| e.settings.alias == settings.alias) {
            return Err(PslError::BadArgument(format!(
                "module '{}' is already set up",
                settings.alias
            )));
        }
        if let Some(c) = settings
            .channels
            .iter()
            .find(|c| self.det_chans().contains(&c.det_chan))
        {
            return Err(PslError::BadArgument(format!(
                "detector channel {} is already in use",
                c.det_chan
            )));
        }

        let mut timeouts = self.timeouts;
        if let Some(ms) = settings.timeout_ms {
            timeouts.request = Duration::from_millis(ms);
        }
        let module = Module::connect(
            &settings.alias,
            &settings.host,
            settings.port,
            timeouts,
            &settings.channel_specs(),
        )?;
        let saved: Vec<Option<String>> = {
            let store = self.store()?;
            module
                .channels()
                .iter()
                .map(|c| store.section(&c.alias).and_then(|d| d.characterization.clone()))
                .collect()
        };
        for ((channel, channel_settings), saved) in module.channels().iter().zip(&settings.channels).zip(saved) {
            module.set_active(channel.index, true)?;
            if let Err(e) = setup_channel(&module, channel, channel_settings, saved.as_deref()) {
                warn!("{}: channel {} setup failed: {e}", module.alias, channel.index);
                if let Err(e) = module.shutdown() {
                    warn!("{}: shutdown after failed setup: {e}", module.alias);
                }
                return Err(e);
            }
        }
        info!(
            "module '{}' set up with {} channel(s)",
            settings.alias,
            settings.channels.len()
        );
        let det_chans: Vec<i32> = settings.channels.iter().map(|c| c.det_chan).collect();
        self.modules.push(ModuleEntry { module, settings });
        for det_chan in det_chans {
            self.user_setup(det_chan)?;
        }
        Ok(())
    }

    /// Write every stored acquisition value of `det_chan` to the device.
    pub fn user_setup(&self, det_chan: i32) -> Result<()> {
        let target = self.locate(det_chan)?;
        let channel = target.channel;
        let params = Params::new(target.module, channel.index);
        let mut store = self.store()?;
        let mut defaults = store.section(&channel.alias).cloned().unwrap_or_default();

        acq_values::sync_all(channel, &mut defaults)?;
        let features = channel.features()?;
        acq_values::fill_defaults(&mut defaults, &features);
        for entry in acq_values::TABLE.iter() {
            if !entry.has(HAS_DEFAULT) || entry.has(LOCAL) || !entry.is_supported(&features) {
                continue;
            }
            let value = defaults
                .get(entry.name)
                .or(entry.default)
                .unwrap_or_default();
            acq_values::set_value(params, channel, &mut defaults, entry.name, value)?;
        }

        let scas = defaults.get("number_of_scas").unwrap_or(0.0).max(0.0) as usize;
        for index in 0..scas {
            for bound in [ScaBound::Lo, ScaBound::Hi] {
                let name = sca_name(index, bound);
                if let Some(value) = defaults.get(&name) {
                    acq_values::set_value(params, channel, &mut defaults, &name, value)?;
                }
            }
        }
        *store.section_mut(&channel.alias) = defaults;
        debug!("channel {det_chan}: user setup done");
        Ok(())
    }

    pub fn end_module(&mut self, alias: &str) -> Result<()> {
        let index = self
            .modules
            .iter()
            .position(|e| e.module.alias == alias)
            .ok_or_else(|| PslError::UnknownModule(alias.to_string()))?;
        let entry = self.modules.remove(index);
        for channel in entry.module.channels() {
            entry.module.set_active(channel.index, false)?;
        }
        entry.module.shutdown()
    }

    pub fn end_all(&mut self) -> Result<()> {
        let aliases: Vec<String> = self.modules.iter().map(|e| e.module.alias.clone()).collect();
        let mut result = Ok(());
        for alias in aliases {
            if let Err(e) = self.end_module(&alias) {
                warn!("{alias}: {e}");
                result = result.and(Err(e));
            }
        }
        result
    }

    // --- acquisition values ---

    pub fn set_acquisition_value(&self, det_chan: i32, name: &str, value: f64) -> Result<f64> {
        let target = self.locate(det_chan)?;
        let mut store = self.store()?;
        let defaults = store.section_mut(&target.channel.alias);
        acq_values::set_value(
            Params::new(target.module, target.channel.index),
            target.channel,
            defaults,
            name,
            value,
        )
    }

    pub fn get_acquisition_value(&self, det_chan: i32, name: &str) -> Result<f64> {
        let target = self.locate(det_chan)?;
        let mut store = self.store()?;
        let defaults = store.section_mut(&target.channel.alias);
        acq_values::get_value(
            Params::new(target.module, target.channel.index),
            target.channel,
            defaults,
            name,
        )
    }

    pub fn save_defaults(&self) -> Result<()> {
        let path = self
            .defaults_path
            .as_deref()
            .ok_or_else(|| PslError::BadArgument("no defaults file configured".into()))?;
        self.save_defaults_to(path)
    }

    /// Write the defaults store to `path`, carrying each channel's current
    /// characterization along in its section.
    pub fn save_defaults_to(&self, path: &Path) -> Result<()> {
        let mut characterizations = Vec::new();
        for module in self.modules() {
            for channel in module.active_channels() {
                match characterization::refresh(module, &channel) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!("channel {}: characterization not saved: {e}", channel.det_chan);
                        continue;
                    }
                }
                if let Some(calibration) = &channel.lock()?.calibration {
                    characterizations.push((channel.alias.clone(), characterization::to_text(calibration)));
                }
            }
        }

        let mut store = self.store()?;
        for (alias, text) in characterizations {
            store.section_mut(&alias).characterization = Some(text);
        }
        store.save(path)?;
        info!("defaults saved to {}", path.display());
        Ok(())
    }

    // --- board operations ---

    pub fn board_operation(&self, det_chan: i32, name: &str, arg: Option<&str>) -> Result<BoardData> {
        let target = self.locate(det_chan)?;
        board_ops::run(target.module, target.channel, name, arg)
    }

    // --- run control ---

    /// Start a run on every active channel of the module holding `det_chan`.
    ///
    /// On any failure all channels are stopped and the first error returned.
    pub fn start_run(&self, det_chan: i32) -> Result<()> {
        let module = self.locate(det_chan)?.module;
        let channels = module.active_channels();
        let sections: Vec<Defaults> = {
            let store = self.store()?;
            channels
                .iter()
                .map(|c| store.section(&c.alias).cloned().unwrap_or_default())
                .collect()
        };
        let run_number = module.run_number().wrapping_add(1);

        let started = channels
            .iter()
            .zip(&sections)
            .try_for_each(|(channel, defaults)| start_channel(module, channel, defaults, run_number));
        if let Err(e) = started {
            warn!("{}: run start failed: {e}", module.alias);
            for channel in &channels {
                if let Err(stop) = channel.stop(module, false, module.timeouts.channel_state) {
                    warn!("channel {}: stop after failed start: {stop}", channel.index);
                }
            }
            return Err(e);
        }
        module.next_run();
        info!("{}: run {} started", module.alias, module.run_number());
        Ok(())
    }

    /// Stop every active channel of the module holding `det_chan`.
    pub fn stop_run(&self, det_chan: i32) -> Result<()> {
        let module = self.locate(det_chan)?.module;
        let mut result = Ok(());
        for channel in module.active_channels() {
            if let Err(e) = channel.stop(module, false, module.timeouts.channel_state) {
                warn!("channel {}: {e}", channel.index);
                result = result.and(Err(e));
            }
        }
        info!("{}: run {} stopped", module.alias, module.run_number());
        result
    }

    pub fn get_run_data(&self, det_chan: i32, name: &str) -> Result<RunData> {
        let target = self.locate(det_chan)?;
        let defaults = self
            .store()?
            .section(&target.channel.alias)
            .cloned()
            .unwrap_or_default();
        let mode = defaults.get("mapping_mode").unwrap_or(0.0).max(0.0).round() as u32;
        let ctx = RunDataContext {
            module: target.module,
            channel: target.channel,
            defaults: &defaults,
        };
        run_data::get(&ctx, mode, name)
    }

    // --- special runs ---

    /// `adc_trace` takes the number of samples in `info[0]`, if given.
    pub fn do_special_run(&self, det_chan: i32, name: &str, info: &[f64]) -> Result<()> {
        let target = self.locate(det_chan)?;
        let (module, channel) = (target.module, target.channel);
        match name {
            "adc_trace" => {
                if channel.state()? == ChannelState::Histogram {
                    return Err(PslError::InvalidState(format!(
                        "channel {det_chan} is acquiring a histogram"
                    )));
                }
                if let Some(&samples) = info.first() {
                    if samples.is_nan() || samples < 1.0 {
                        return Err(PslError::out_of_range("adc_trace samples", samples));
                    }
                    Params::new(module, channel.index)
                        .set("oscilloscope.samples", ParamValue::Int(samples.round() as i64))?;
                }
                {
                    let mut inner = channel.lock()?;
                    inner.adc_trace_ready = false;
                    inner.async_ready = true;
                }
                module.command(channel.index, Payload::StartOscilloscope)?;
                let trace = channel.wait_for_trace(module.timeouts.adc_trace)?;
                debug!("channel {det_chan}: {} trace samples", trace.len());
                Ok(())
            }
            "detc-start" => {
                let firmware = target.settings.firmware.as_ref().ok_or_else(|| {
                    PslError::BadArgument(format!("channel {det_chan} has no firmware set"))
                })?;
                debug!("channel {det_chan}: characterizing with firmware '{}'", firmware.alias);
                characterization::start(module, channel)
            }
            "detc-stop" => characterization::stop(module, channel, module.timeouts.channel_state),
            other => Err(PslError::UnknownSpecialRun(other.to_string())),
        }
    }

    pub fn get_special_run_data(&self, det_chan: i32, name: &str) -> Result<RunData> {
        let target = self.locate(det_chan)?;
        let (module, channel) = (target.module, target.channel);
        let data = match name {
            "adc_trace_length" => RunData::UInt(channel.lock()?.adc_trace.len() as u64),
            "adc_trace" => RunData::Words(channel.lock()?.adc_trace.clone()),
            "detc-running" => RunData::Bool(channel.lock()?.progress.running),
            "detc-percentage" => RunData::Float(channel.lock()?.progress.percentage),
            "detc-progress-text-size" => RunData::UInt(channel.lock()?.progress.stage.len() as u64),
            "detc-progress-text" => RunData::Text(channel.lock()?.progress.stage.clone()),
            "detc-successful" => RunData::Bool(characterization::refresh(module, channel)?),
            "detc-string-size" => {
                RunData::UInt(characterization::to_text(&calibration(module, channel)?).len() as u64)
            }
            "detc-string" => RunData::Text(characterization::to_text(&calibration(module, channel)?)),
            other => pulse_data(&calibration(module, channel)?, other)?,
        };
        Ok(data)
    }

    // --- characterization ---

    pub fn calibration_state(&self, det_chan: i32) -> Result<CalibrationState> {
        Ok(self.locate(det_chan)?.channel.lock()?.calibration_state)
    }

    pub fn save_characterization(&self, det_chan: i32, path: &Path) -> Result<()> {
        let target = self.locate(det_chan)?;
        characterization::save(path, &calibration(target.module, target.channel)?)
    }

    pub fn load_characterization(&self, det_chan: i32, path: &Path) -> Result<()> {
        let target = self.locate(det_chan)?;
        let data = characterization::load(path)?;
        characterization::restore(target.module, target.channel, data)
    }
}

fn setup_channel(module: &Module, channel: &Channel, settings: &ChannelSettings, saved: Option<&str>) -> Result<()> {
    let params = Params::new(module, channel.index);
    let features = params.discover_features()?;
    let polarity = match settings.detector_polarity {
        Some(polarity) => polarity,
        None => !params.get_bool("afe.invert")? as i64,
    };
    {
        let mut inner = channel.lock()?;
        inner.features = features;
        inner.detector_polarity = polarity;
    }
    let state = params.get_string("channel.state")?;
    match ChannelState::from_device(&state) {
        Some(state) => channel.apply_state(state)?,
        None => warn!("channel {}: unknown initial state '{state}'", channel.index),
    }

    let path = settings
        .firmware
        .as_ref()
        .and_then(FirmwareSettings::characterization_path);
    if let Some(text) = saved {
        debug!("channel {}: restoring characterization from defaults", channel.index);
        characterization::restore(module, channel, characterization::from_text(text)?)?;
    } else if let Some(path) = path {
        if path.exists() {
            characterization::restore(module, channel, characterization::load(&path)?)?;
        } else {
            info!(
                "channel {}: no characterization at {} yet",
                channel.index,
                path.display()
            );
        }
    }
    debug!(
        "channel {} ({}): {:?}",
        channel.index, channel.alias, features
    );
    Ok(())
}

fn sca_name(index: usize, bound: ScaBound) -> String {
    match bound {
        ScaBound::Lo => format!("sca{index}_lo"),
        ScaBound::Hi => format!("sca{index}_hi"),
    }
}

fn flag(defaults: &Defaults, name: &str, fallback: f64) -> bool {
    defaults.get(name).unwrap_or(fallback).round() as i64 != 0
}

fn serial_word(serial: &str) -> u16 {
    serial
        .chars()
        .filter_map(|c| c.to_digit(10))
        .fold(0u32, |acc, d| (acc * 10 + d) % 65536) as u16
}

fn start_channel(module: &Module, channel: &Channel, defaults: &Defaults, run_number: u16) -> Result<()> {
    if channel.state()? == ChannelState::Histogram {
        return Err(PslError::InvalidState(format!(
            "channel {} is already acquiring",
            channel.index
        )));
    }
    let params = Params::new(module, channel.index);
    let features = channel.features()?;
    let bins = defaults
        .get("number_mca_channels")
        .unwrap_or(MAX_MCA_CHANNELS)
        .max(0.0) as usize;
    let mut settings = acq_values::gate_params(
        &features,
        defaults.get("input_logic_polarity").unwrap_or(0.0),
        defaults.get("gate_ignore").unwrap_or(1.0),
    );

    let mode = defaults.get("mapping_mode").unwrap_or(0.0).round() as i64;
    let control = match mode {
        0 => {
            settings.extend(acq_values::preset_params(
                defaults.get("preset_type").unwrap_or(0.0),
                defaults.get("preset_value").unwrap_or(0.0),
            )?);
            MappingControl::Mca(Mm0::open(
                bins,
                flag(defaults, "mca_spectrum_accepted", 1.0),
                flag(defaults, "mca_spectrum_rejected", 0.0),
            ))
        }
        1 => {
            let advance_value = defaults.get("pixel_advance_mode").unwrap_or(0.0);
            let pixel_advance = PixelAdvance::from_value(advance_value)
                .ok_or_else(|| PslError::out_of_range("pixel_advance_mode", advance_value))?;
            settings.extend(acq_values::mapping_params(
                pixel_advance,
                defaults.get("sync_count").unwrap_or(0.0),
            ));
            let serial = params.get_string("instrument.serialNumber")?;
            MappingControl::McaFsm(Mm1::open(Mm1Settings {
                pixel_advance,
                run_number,
                num_map_pixels: defaults.get("num_map_pixels").unwrap_or(0.0).max(0.0) as u32,
                num_mca_channels: bins,
                pixels_per_buffer: acq_values::effective_pixels_per_buffer(
                    defaults.get("num_map_pixels_per_buffer").unwrap_or(-1.0),
                ),
                serial_number: serial_word(&serial),
                det_chan: channel.det_chan as u16,
                det_element: channel.index as u16,
            }))
        }
        2 => return Err(PslError::NotSupported("SCA mapping mode".into())),
        _ => return Err(PslError::NotSupported("list mapping mode".into())),
    };
    params.set_many(settings)?;

    {
        let mut inner = channel.lock()?;
        debug!("channel {}: opening {} buffers", channel.index, control.name());
        inner.mapping = control;
        inner.stats = Stats::default();
    }
    channel.start(
        module,
        ChannelState::Histogram,
        Payload::StartHistogram,
        module.timeouts.channel_state,
    )
}

fn calibration(module: &Module, channel: &Channel) -> Result<CalibrationData> {
    characterization::refresh(module, channel)?;
    let inner = channel.lock()?;
    match (&inner.calibration, inner.calibration_state) {
        (Some(calibration), CalibrationState::Ready) => Ok(calibration.clone()),
        _ => Err(PslError::NoCalibration),
    }
}

fn pulse_data(calibration: &CalibrationData, name: &str) -> Result<RunData> {
    let unknown = || PslError::UnknownSpecialRun(name.to_string());
    let rest = name.strip_prefix("detc-").ok_or_else(unknown)?;
    let (which, field) = rest.split_once("-pulse-").ok_or_else(unknown)?;
    let wave: &Waveform = match which {
        "example" => &calibration.example,
        "model" => &calibration.model,
        "final" => &calibration.final_pulse,
        _ => return Err(unknown()),
    };
    match field {
        "size" => Ok(RunData::UInt(wave.x.len() as u64)),
        "x" => Ok(RunData::Floats(wave.x.clone())),
        "y" => Ok(RunData::Floats(wave.y.clone())),
        _ => Err(unknown()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_digits_fold_into_a_word() {
        assert_eq!(serial_word("SN1234"), 1234);
        assert_eq!(serial_word("no digits"), 0);
        assert_eq!(serial_word("65537"), 1);
    }

    #[test]
    fn pulse_names_select_waveforms() {
        let calibration = CalibrationData {
            data: vec![1],
            example: Waveform {
                x: vec![0.0, 1.0],
                y: vec![0.5, 0.25],
            },
            model: Waveform {
                x: vec![0.0],
                y: vec![1.0],
            },
            final_pulse: Waveform::default(),
        };
        assert_eq!(
            pulse_data(&calibration, "detc-example-pulse-size").unwrap(),
            RunData::UInt(2)
        );
        assert_eq!(
            pulse_data(&calibration, "detc-model-pulse-y").unwrap(),
            RunData::Floats(vec![1.0])
        );
        assert!(matches!(
            pulse_data(&calibration, "detc-other-pulse-x"),
            Err(PslError::UnknownSpecialRun(_))
        ));
        assert!(pulse_data(&calibration, "adc_trace_bogus").is_err());
    }

    #[test]
    fn sca_names() {
        assert_eq!(sca_name(2, ScaBound::Hi), "sca2_hi");
        assert_eq!(
            acq_values::parse_sca_name(&sca_name(11, ScaBound::Lo)),
            Some((11, ScaBound::Lo))
        );
    }
}
