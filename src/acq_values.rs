use crate::channel::{Channel, Features};
use crate::defaults::Defaults;
use crate::error::{PslError, Result};
use crate::mapping::mm1::{PixelAdvance, MAX_PIXELS_PER_BUFFER};
use crate::params::Params;
use crate::sinc::{KeyValue, ParamValue};
use log::debug;

/// Names accepted in old defaults files but refused from callers.
pub const DEPRECATED: &[&str] = &[
    "coarse_bin_scale",
    "pulse_scale_factor",
    "mca_end_channel",
    "adc_trace_length",
];

/// Value is persisted in the defaults store and written at user setup.
pub const HAS_DEFAULT: u8 = 0x01;
pub const READ_ONLY: u8 = 0x02;
/// Value only lives in the defaults store; it takes effect at run start.
pub const LOCAL: u8 = 0x04;
/// Table entry is a prefix for a family of indexed names (`sca0_lo`, ...).
pub const EMPTY: u8 = 0x08;

pub const DAC_OFFSET_MIN: f64 = -32768.0;
pub const DAC_OFFSET_MAX: f64 = 32767.0;
pub const SCALE_MIN: f64 = 1.0;
pub const SCALE_MAX: f64 = 181.0;
pub const MIN_MCA_CHANNELS: f64 = 128.0;
pub const MAX_MCA_CHANNELS: f64 = 4096.0;

const GAIN_BASE: f64 = 409.6;
const GAIN_SPAN: f64 = 8.0 * 409.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Float,
    Int,
    Bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

pub struct AcqContext<'a> {
    pub params: Params<'a>,
    pub channel: &'a Channel,
    pub features: Features,
    pub defaults: &'a Defaults,
    /// The name as the caller gave it.
    pub name: &'a str,
    updates: Vec<(String, f64)>,
}

impl<'a> AcqContext<'a> {
    pub fn new(params: Params<'a>, channel: &'a Channel, defaults: &'a Defaults, name: &'a str) -> Result<Self> {
        Ok(Self {
            params,
            channel,
            features: channel.features()?,
            defaults,
            name,
            updates: Vec::new(),
        })
    }

    fn default_or(&self, name: &str, fallback: f64) -> f64 {
        self.defaults.get(name).unwrap_or(fallback)
    }

    fn also_update(&mut self, name: &str, value: f64) {
        self.updates.push((name.to_string(), value));
    }
}

type Handler = fn(&mut AcqContext<'_>, &mut f64, Access) -> Result<()>;
type SyncFn = fn(&Channel, &mut Defaults) -> Result<()>;
type Supported = fn(&Features) -> bool;

pub struct AcqValue {
    pub name: &'static str,
    pub kind: ValueType,
    pub default: Option<f64>,
    pub flags: u8,
    handler: Handler,
    sync: Option<SyncFn>,
    supported: Option<Supported>,
}

impl AcqValue {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_supported(&self, features: &Features) -> bool {
        self.supported.map_or(true, |f| f(features))
    }
}

macro_rules! entry {
    ($name:literal, $kind:ident, $default:expr, $flags:expr, $handler:ident) => {
        AcqValue {
            name: $name,
            kind: ValueType::$kind,
            default: $default,
            flags: $flags,
            handler: $handler,
            sync: None,
            supported: None,
        }
    };
}

pub static TABLE: [AcqValue; 37] = [
    entry!("analog_gain", Float, Some(1.0), HAS_DEFAULT, analog_gain),
    entry!("analog_offset", Float, Some(0.0), HAS_DEFAULT, analog_offset),
    AcqValue {
        sync: Some(sync_detector_polarity),
        ..entry!("detector_polarity", Int, Some(1.0), HAS_DEFAULT, detector_polarity)
    },
    entry!("termination", Int, Some(0.0), HAS_DEFAULT, termination),
    entry!("attenuation", Int, Some(0.0), HAS_DEFAULT, attenuation),
    entry!("coupling", Int, Some(1.0), HAS_DEFAULT, coupling),
    entry!("decay_time", Int, Some(0.0), HAS_DEFAULT, decay_time),
    entry!("reset_blanking_enable", Bool, Some(1.0), HAS_DEFAULT, reset_blanking_enable),
    entry!("reset_blanking_threshold", Float, Some(-0.05), HAS_DEFAULT, reset_blanking_threshold),
    entry!("reset_blanking_presamples", Int, Some(50.0), HAS_DEFAULT, reset_blanking_presamples),
    entry!("reset_blanking_postsamples", Int, Some(50.0), HAS_DEFAULT, reset_blanking_postsamples),
    entry!("detection_threshold", Float, Some(0.01), HAS_DEFAULT, detection_threshold),
    entry!("min_pulse_pair_separation", Int, Some(25.0), HAS_DEFAULT, min_pulse_pair_separation),
    entry!("detection_filter", Int, Some(3.0), HAS_DEFAULT, detection_filter),
    AcqValue {
        supported: Some(supports_risetime),
        ..entry!("risetime_optimization", Float, Some(0.0), HAS_DEFAULT, risetime_optimization)
    },
    entry!("scale_factor", Float, Some(2.0), HAS_DEFAULT, scale_factor),
    entry!("clock_speed", Float, None, READ_ONLY, clock_speed),
    entry!("adc_trace_decimation", Float, None, READ_ONLY, adc_trace_decimation),
    entry!("mca_spectrum_accepted", Bool, Some(1.0), HAS_DEFAULT | LOCAL, local_bool),
    entry!("mca_spectrum_rejected", Bool, Some(0.0), HAS_DEFAULT | LOCAL, local_bool),
    entry!("mca_start_channel", Int, Some(0.0), HAS_DEFAULT, mca_start_channel),
    entry!("number_mca_channels", Int, Some(4096.0), HAS_DEFAULT, number_mca_channels),
    entry!("mca_refresh", Float, Some(0.1), HAS_DEFAULT, mca_refresh),
    entry!("preset_type", Int, Some(0.0), HAS_DEFAULT | LOCAL, preset_type),
    entry!("preset_value", Float, Some(0.0), HAS_DEFAULT | LOCAL, local_non_negative),
    entry!("sca_trigger_mode", Int, Some(1.0), HAS_DEFAULT, sca_trigger_mode),
    entry!("sca_pulse_duration", Int, Some(400.0), HAS_DEFAULT, sca_pulse_duration),
    entry!("number_of_scas", Int, Some(0.0), HAS_DEFAULT, number_of_scas),
    entry!("sca", Float, None, EMPTY, sca),
    entry!("num_map_pixels", Int, Some(0.0), HAS_DEFAULT | LOCAL, local_non_negative),
    entry!("num_map_pixels_per_buffer", Int, Some(-1.0), HAS_DEFAULT | LOCAL, pixels_per_buffer),
    entry!("pixel_advance_mode", Int, Some(0.0), HAS_DEFAULT | LOCAL, pixel_advance_mode),
    entry!("input_logic_polarity", Int, Some(0.0), HAS_DEFAULT | LOCAL, local_bool),
    entry!("gate_ignore", Int, Some(1.0), HAS_DEFAULT | LOCAL, local_bool),
    entry!("sync_count", Int, Some(0.0), HAS_DEFAULT | LOCAL, local_non_negative),
    entry!("mapping_mode", Int, Some(0.0), HAS_DEFAULT | LOCAL, mapping_mode),
    entry!("list_mode_variant", Int, Some(0.0), HAS_DEFAULT | LOCAL, local_non_negative),
];

/// Look up a table entry by exact name, then by prefix in table order.
pub fn find(name: &str) -> Result<&'static AcqValue> {
    if DEPRECATED.contains(&name) {
        return Err(PslError::DeprecatedValue(name.to_string()));
    }
    TABLE
        .iter()
        .find(|v| v.name == name)
        .or_else(|| TABLE.iter().find(|v| name.starts_with(v.name)))
        .ok_or_else(|| PslError::UnknownValue(name.to_string()))
}

fn check_supported(entry: &AcqValue, features: &Features) -> Result<()> {
    if entry.is_supported(features) {
        Ok(())
    } else {
        Err(PslError::NotSupported(entry.name.to_string()))
    }
}

fn persist(entry: &AcqValue, name: &str, value: f64, updates: Vec<(String, f64)>, defaults: &mut Defaults) {
    if entry.has(HAS_DEFAULT) {
        defaults.set(entry.name, value);
    } else if entry.has(EMPTY) {
        defaults.set(name, value);
    }
    for (name, value) in updates {
        defaults.set(&name, value);
    }
}

/// Write an acquisition value. Returns the value the device settled on.
pub fn set_value(params: Params<'_>, channel: &Channel, defaults: &mut Defaults, name: &str, value: f64) -> Result<f64> {
    let entry = find(name)?;
    if entry.has(READ_ONLY) {
        return Err(PslError::ReadOnly(entry.name.to_string()));
    }
    let mut value = value;
    let updates = {
        let mut ctx = AcqContext::new(params, channel, defaults, name)?;
        check_supported(entry, &ctx.features)?;
        (entry.handler)(&mut ctx, &mut value, Access::Write)?;
        ctx.updates
    };
    debug!("channel {}: {name} = {value}", channel.index);
    persist(entry, name, value, updates, defaults);
    Ok(value)
}

/// Read an acquisition value from the device (or the store, for local ones).
pub fn get_value(params: Params<'_>, channel: &Channel, defaults: &mut Defaults, name: &str) -> Result<f64> {
    let entry = find(name)?;
    let mut value = 0.0;
    let updates = {
        let mut ctx = AcqContext::new(params, channel, defaults, name)?;
        check_supported(entry, &ctx.features)?;
        if entry.has(LOCAL) {
            value = ctx.default_or(entry.name, entry.default.unwrap_or(0.0));
        } else {
            (entry.handler)(&mut ctx, &mut value, Access::Read)?;
        }
        ctx.updates
    };
    if !entry.has(READ_ONLY) {
        persist(entry, name, value, updates, defaults);
    }
    Ok(value)
}

/// Run every entry's sync step. Happens once per user setup, before any
/// value is written to the device.
pub fn sync_all(channel: &Channel, defaults: &mut Defaults) -> Result<()> {
    for entry in TABLE.iter() {
        if let Some(sync) = entry.sync {
            sync(channel, defaults)?;
        }
    }
    Ok(())
}

/// Give every supported value with a default an entry in the store.
pub fn fill_defaults(defaults: &mut Defaults, features: &Features) {
    for entry in TABLE.iter() {
        if !entry.has(HAS_DEFAULT) || !entry.is_supported(features) {
            continue;
        }
        if let (None, Some(default)) = (defaults.get(entry.name), entry.default) {
            defaults.set(entry.name, default);
        }
    }
}

// --- validation helpers ---

fn in_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<f64> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(PslError::out_of_range(name, value));
    }
    Ok(value)
}

fn int_in(name: &str, value: f64, lo: i64, hi: i64) -> Result<i64> {
    let v = in_range(name, value, lo as f64, hi as f64)?;
    Ok(v.round() as i64)
}

fn bool_of(name: &str, value: f64) -> Result<bool> {
    Ok(int_in(name, value, 0, 1)? == 1)
}

// --- generic device mappings ---

fn option_param(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access, key: &str, options: &[&str]) -> Result<()> {
    if access == Access::Write {
        let index = int_in(ctx.name, *value, 0, options.len() as i64 - 1)?;
        ctx.params.set(key, ParamValue::Option(options[index as usize].to_string()))?;
    }
    let current = ctx.params.get_option(key)?;
    let index = options
        .iter()
        .position(|o| *o == current)
        .ok_or_else(|| PslError::Protocol(format!("{key} has unexpected option '{current}'")))?;
    *value = index as f64;
    Ok(())
}

fn float_param(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access, key: &str, lo: f64, hi: f64) -> Result<()> {
    if access == Access::Write {
        in_range(ctx.name, *value, lo, hi)?;
        ctx.params.set(key, ParamValue::Float(*value))?;
    }
    *value = ctx.params.get_float(key)?;
    Ok(())
}

fn int_param(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access, key: &str, lo: i64, hi: i64) -> Result<()> {
    if access == Access::Write {
        let v = int_in(ctx.name, *value, lo, hi)?;
        ctx.params.set(key, ParamValue::Int(v))?;
    }
    *value = ctx.params.get_int(key)? as f64;
    Ok(())
}

fn bool_param(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access, key: &str) -> Result<()> {
    if access == Access::Write {
        let v = bool_of(ctx.name, *value)?;
        ctx.params.set(key, ParamValue::Bool(v))?;
    }
    *value = if ctx.params.get_bool(key)? { 1.0 } else { 0.0 };
    Ok(())
}

// --- analog front end ---

pub fn gain_to_dac(gain: f64) -> f64 {
    GAIN_BASE + GAIN_SPAN * gain.log(16.0)
}

pub fn dac_to_gain(dac: f64) -> f64 {
    16f64.powf((dac - GAIN_BASE) / GAIN_SPAN)
}

fn analog_gain(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let gain = in_range(ctx.name, *value, 1.0, 16.0)?;
        ctx.params.set("afe.dacGain", ParamValue::Float(gain_to_dac(gain)))?;
    }
    *value = dac_to_gain(ctx.params.get_float("afe.dacGain")?);
    Ok(())
}

fn analog_offset(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let offset = int_in(ctx.name, *value, DAC_OFFSET_MIN as i64, DAC_OFFSET_MAX as i64)?;
        ctx.params
            .set("afe.dacOffset", ParamValue::Int(offset - DAC_OFFSET_MIN as i64))?;
    }
    *value = ctx.params.get_int("afe.dacOffset")? as f64 + DAC_OFFSET_MIN;
    Ok(())
}

fn detector_polarity(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let positive = bool_of(ctx.name, *value)?;
        ctx.params.set("afe.invert", ParamValue::Bool(!positive))?;
    }
    let polarity = !ctx.params.get_bool("afe.invert")? as i64;
    ctx.channel.lock()?.detector_polarity = polarity;
    *value = polarity as f64;
    Ok(())
}

fn sync_detector_polarity(channel: &Channel, defaults: &mut Defaults) -> Result<()> {
    let polarity = channel.lock()?.detector_polarity;
    defaults.set("detector_polarity", polarity as f64);
    Ok(())
}

fn termination(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    let options: &[&str] = if ctx.features.termination_50ohm {
        &["1kohm", "50ohm"]
    } else {
        &["1kohm"]
    };
    option_param(ctx, value, access, "afe.termination", options)
}

fn attenuation(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    let third = if ctx.features.attenuation_ground {
        "ground"
    } else {
        "-12dB"
    };
    option_param(ctx, value, access, "afe.attn", &["0dB", "-6dB", third])
}

fn coupling(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    option_param(ctx, value, access, "afe.coupling", &["ac", "dc"])
}

fn decay_time(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    option_param(
        ctx,
        value,
        access,
        "afe.decayTime",
        &["long", "medium", "short", "veryShort"],
    )
}

// --- pulse detection ---

fn reset_blanking_enable(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    bool_param(ctx, value, access, "pulse.resetBlanking.enable")
}

fn reset_blanking_threshold(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    float_param(ctx, value, access, "pulse.resetBlanking.threshold", -1.0, 1.0)
}

fn reset_blanking_presamples(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    int_param(ctx, value, access, "pulse.resetBlanking.preSamples", 0, 65535)
}

fn reset_blanking_postsamples(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    int_param(ctx, value, access, "pulse.resetBlanking.postSamples", 0, 65535)
}

fn detection_threshold(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    float_param(ctx, value, access, "pulse.detection.threshold", 0.0, 1.0)
}

fn min_pulse_pair_separation(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    int_param(ctx, value, access, "pulse.minPulsePairSeparation", 0, 1023)
}

fn detection_filter(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    option_param(
        ctx,
        value,
        access,
        "pulse.sourceType",
        &["lowEnergy", "lowRate", "midRate", "highRate", "maxThroughput"],
    )
}

pub fn ns_to_samples(ns: f64, sample_rate: f64) -> i64 {
    (ns * sample_rate / 1e9).round() as i64
}

pub fn samples_to_ns(samples: i64, sample_rate: f64) -> f64 {
    samples as f64 * 1e9 / sample_rate
}

fn supports_risetime(features: &Features) -> bool {
    features.risetime_optimization
}

fn risetime_optimization(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    let rate = ctx.features.sample_rate;
    if rate <= 0.0 {
        return Err(PslError::InvalidState("sample rate unknown".into()));
    }
    if access == Access::Write {
        let ns = in_range(ctx.name, *value, 0.0, 1e6)?;
        ctx.params
            .set("pulse.riseTimeParameter", ParamValue::Int(ns_to_samples(ns, rate)))?;
    }
    *value = samples_to_ns(ctx.params.get_int("pulse.riseTimeParameter")?, rate);
    Ok(())
}

/// Split a scale factor into the coarse bin scaling and the fine factor.
pub fn split_scale_factor(scale: f64) -> (i64, f64) {
    let coarse = 2f64.powf(scale.log2().round()).clamp(2.0, 128.0);
    (coarse as i64, scale / coarse)
}

fn scale_factor(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let scale = in_range(ctx.name, *value, SCALE_MIN, SCALE_MAX)?;
        let (coarse, fine) = split_scale_factor(scale);
        ctx.params.set_many(vec![
            KeyValue::new("histogram.binning.coarseBinScaling", ParamValue::Int(coarse)),
            KeyValue::new("pulse.scaleFactor", ParamValue::Float(fine)),
        ])?;
    }
    let coarse = ctx.params.get_int("histogram.binning.coarseBinScaling")?;
    let fine = ctx.params.get_float("pulse.scaleFactor")?;
    *value = coarse as f64 * fine;
    Ok(())
}

fn clock_speed(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    *value = ctx.features.sample_rate / 1e6;
    Ok(())
}

fn adc_trace_decimation(_ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    *value = 1.0;
    Ok(())
}

// --- histogram ---

const LOW_INDEX: &str = "histogram.binning.binSubRegion.lowIndex";
const HIGH_INDEX: &str = "histogram.binning.binSubRegion.highIndex";

fn write_bin_region(ctx: &mut AcqContext<'_>, start: i64, count: i64) -> Result<()> {
    ctx.params.set_many(vec![
        KeyValue::new(LOW_INDEX, ParamValue::Int(start)),
        KeyValue::new(HIGH_INDEX, ParamValue::Int(start + count - 1)),
    ])
}

fn mca_start_channel(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let count = ctx.default_or("number_mca_channels", MAX_MCA_CHANNELS) as i64;
        let start = int_in(ctx.name, *value, 0, MAX_MCA_CHANNELS as i64 - count)?;
        write_bin_region(ctx, start, count)?;
    }
    let low = ctx.params.get_int(LOW_INDEX)?;
    let high = ctx.params.get_int(HIGH_INDEX)?;
    ctx.also_update("number_mca_channels", (high - low + 1) as f64);
    *value = low as f64;
    Ok(())
}

fn number_mca_channels(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let count = int_in(ctx.name, *value, MIN_MCA_CHANNELS as i64, MAX_MCA_CHANNELS as i64)?;
        let start = ctx.default_or("mca_start_channel", 0.0) as i64;
        if start + count > MAX_MCA_CHANNELS as i64 {
            return Err(PslError::out_of_range(ctx.name, *value));
        }
        write_bin_region(ctx, start, count)?;
    }
    let low = ctx.params.get_int(LOW_INDEX)?;
    let high = ctx.params.get_int(HIGH_INDEX)?;
    ctx.also_update("mca_start_channel", low as f64);
    *value = (high - low + 1) as f64;
    Ok(())
}

fn mca_refresh(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let seconds = in_range(ctx.name, *value, 0.001, 3600.0)?;
        ctx.params
            .set("histogram.refreshRate", ParamValue::Int((seconds * 1000.0).round() as i64))?;
    }
    *value = ctx.params.get_int("histogram.refreshRate")? as f64 / 1000.0;
    Ok(())
}

pub const PRESET_NONE: i64 = 0;
pub const PRESET_FIXED_REAL: i64 = 1;
pub const PRESET_FIXED_LIVE: i64 = 2;
pub const PRESET_FIXED_EVENTS: i64 = 3;
pub const PRESET_FIXED_TRIGGERS: i64 = 4;

fn preset_type(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    let preset = int_in(ctx.name, *value, PRESET_NONE, PRESET_FIXED_TRIGGERS)?;
    if preset == PRESET_FIXED_LIVE {
        return Err(PslError::NotSupported("fixed livetime preset".into()));
    }
    *value = preset as f64;
    Ok(())
}

/// Device parameters selecting the histogram mode for an MCA run.
pub fn preset_params(preset: f64, preset_value: f64) -> Result<Vec<KeyValue>> {
    let mode = |m: &str| KeyValue::new("histogram.mode", ParamValue::Option(m.to_string()));
    let params = match preset.round() as i64 {
        PRESET_NONE => vec![mode("continuous")],
        PRESET_FIXED_REAL => vec![
            mode("fixedTime"),
            KeyValue::new("histogram.fixedTime.duration", ParamValue::Float(preset_value)),
        ],
        PRESET_FIXED_EVENTS => vec![
            mode("fixedOutputCount"),
            KeyValue::new(
                "histogram.fixedOutputCount.count",
                ParamValue::Int(preset_value.round() as i64),
            ),
        ],
        PRESET_FIXED_TRIGGERS => vec![
            mode("fixedInputCount"),
            KeyValue::new(
                "histogram.fixedInputCount.count",
                ParamValue::Int(preset_value.round() as i64),
            ),
        ],
        PRESET_FIXED_LIVE => return Err(PslError::NotSupported("fixed livetime preset".into())),
        _ => return Err(PslError::out_of_range("preset_type", preset)),
    };
    Ok(params)
}

/// Device parameters selecting the histogram mode for a mapping run.
pub fn mapping_params(advance: PixelAdvance, sync_count: f64) -> Vec<KeyValue> {
    let mode = |m: &str| KeyValue::new("histogram.mode", ParamValue::Option(m.to_string()));
    match advance {
        PixelAdvance::User => vec![mode("continuous")],
        PixelAdvance::Gate => vec![mode("gated")],
        PixelAdvance::Sync => vec![
            mode("spatialSync"),
            KeyValue::new("sync.count", ParamValue::Int(sync_count.round() as i64)),
        ],
    }
}

/// `gate.statsCollectionMode` and `gate.veto` for the GATE input settings.
pub fn gate_settings(input_logic_polarity: f64, gate_ignore: f64) -> (&'static str, &'static str) {
    let high = input_logic_polarity.round() as i64 == 0;
    if gate_ignore.round() as i64 == 1 {
        (if high { "risingEdge" } else { "fallingEdge" }, "off")
    } else if high {
        ("whenHigh", "whenLow")
    } else {
        ("whenLow", "whenHigh")
    }
}

pub fn gate_params(features: &Features, input_logic_polarity: f64, gate_ignore: f64) -> Vec<KeyValue> {
    let (collection, veto) = gate_settings(input_logic_polarity, gate_ignore);
    let mut params = vec![KeyValue::new(
        "gate.statsCollectionMode",
        ParamValue::Option(collection.to_string()),
    )];
    if features.mca_gate_veto {
        params.push(KeyValue::new("gate.veto", ParamValue::Option(veto.to_string())));
    }
    params
}

// --- SCAs ---

fn sca_trigger_mode(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    option_param(ctx, value, access, "sca.trigger", &["off", "high", "low", "always"])
}

fn sca_pulse_duration(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    int_param(ctx, value, access, "sca.pulseDuration", 0, 1_000_000)
}

pub fn sca_key(index: usize, bound: ScaBound) -> String {
    let field = match bound {
        ScaBound::Lo => "startBin",
        ScaBound::Hi => "endBin",
    };
    format!("sca.region_{:02}.{field}", index + 1)
}

fn number_of_scas(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    if access == Access::Write {
        let count = int_in(ctx.name, *value, 0, ctx.features.max_scas as i64)? as usize;
        let current = ctx.params.get_int("sca.numRegions")?.max(0) as usize;
        for index in count..current {
            ctx.params.set_many(vec![
                KeyValue::new(sca_key(index, ScaBound::Lo), ParamValue::Int(0)),
                KeyValue::new(sca_key(index, ScaBound::Hi), ParamValue::Int(0)),
            ])?;
        }
        ctx.params.set("sca.numRegions", ParamValue::Int(count as i64))?;
    }
    *value = ctx.params.get_int("sca.numRegions")? as f64;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaBound {
    Lo,
    Hi,
}

pub fn parse_sca_name(name: &str) -> Option<(usize, ScaBound)> {
    let rest = name.strip_prefix("sca")?;
    let (index, bound) = rest.split_once('_')?;
    let bound = match bound {
        "lo" => ScaBound::Lo,
        "hi" => ScaBound::Hi,
        _ => return None,
    };
    Some((index.parse().ok()?, bound))
}

fn sca(ctx: &mut AcqContext<'_>, value: &mut f64, access: Access) -> Result<()> {
    let (index, bound) =
        parse_sca_name(ctx.name).ok_or_else(|| PslError::UnknownValue(ctx.name.to_string()))?;
    let count = ctx.params.get_int("sca.numRegions")?.max(0) as usize;
    if index >= count {
        return Err(PslError::out_of_range(ctx.name, index as f64));
    }
    let key = sca_key(index, bound);
    if access == Access::Write {
        let bins = ctx.default_or("number_mca_channels", MAX_MCA_CHANNELS) as i64;
        let bin = int_in(ctx.name, *value, 0, bins - 1)?;
        ctx.params.set(&key, ParamValue::Int(bin))?;
    }
    *value = ctx.params.get_int(&key)? as f64;
    Ok(())
}

// --- local values ---

fn local_bool(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    *value = bool_of(ctx.name, *value)? as i64 as f64;
    Ok(())
}

fn local_non_negative(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    in_range(ctx.name, *value, 0.0, f64::MAX)?;
    Ok(())
}

fn pixels_per_buffer(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    let pixels = int_in(ctx.name, *value, -1, i64::MAX)?;
    let max = MAX_PIXELS_PER_BUFFER as i64;
    *value = (if pixels <= 0 { max } else { pixels.min(max) }) as f64;
    Ok(())
}

fn pixel_advance_mode(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    int_in(ctx.name, *value, 0, 2)?;
    Ok(())
}

fn mapping_mode(ctx: &mut AcqContext<'_>, value: &mut f64, _access: Access) -> Result<()> {
    match int_in(ctx.name, *value, 0, 3)? {
        0 | 1 => Ok(()),
        2 => Err(PslError::NotSupported("SCA mapping mode".into())),
        _ => Err(PslError::NotSupported("list mapping mode".into())),
    }
}

/// Resolve `num_map_pixels_per_buffer` as stored to the buffer size used.
pub fn effective_pixels_per_buffer(stored: f64) -> u32 {
    let pixels = stored.round() as i64;
    if pixels <= 0 {
        MAX_PIXELS_PER_BUFFER
    } else {
        pixels.min(MAX_PIXELS_PER_BUFFER as i64) as u32
    }
}
