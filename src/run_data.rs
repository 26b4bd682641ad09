use crate::acq_values::parse_sca_name;
use crate::acq_values::ScaBound;
use crate::channel::{Channel, ChannelState};
use crate::defaults::Defaults;
use crate::error::{PslError, Result};
use crate::module::Module;
use crate::stats::MODULE_STATISTICS_LEN;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub enum RunData {
    Bool(bool),
    UInt(u64),
    Float(f64),
    Words(Vec<u32>),
    Floats(Vec<f64>),
    Text(String),
}

impl RunData {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(*b as u8 as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn into_words(self) -> Option<Vec<u32>> {
        match self {
            Self::Words(w) => Some(w),
            _ => None,
        }
    }

    pub fn into_floats(self) -> Option<Vec<f64>> {
        match self {
            Self::Floats(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

pub struct RunDataContext<'a> {
    pub module: &'a Module,
    pub channel: &'a Channel,
    pub defaults: &'a Defaults,
}

type RunDataFn = fn(&RunDataContext<'_>) -> Result<RunData>;

const MCA: &str = "mca";
const MAPPING: &str = "mca mapping";

static TABLE: [(&str, [Option<RunDataFn>; 2]); 28] = [
    ("mca_length", [Some(mca_length), None]),
    ("mca", [Some(mca), None]),
    ("baseline_length", [Some(baseline_length), None]),
    ("runtime", [Some(runtime), Some(runtime)]),
    ("realtime", [Some(runtime), Some(runtime)]),
    ("trigger_livetime", [Some(trigger_livetime), Some(trigger_livetime)]),
    ("livetime", [Some(livetime), Some(livetime)]),
    ("input_count_rate", [Some(input_count_rate), Some(input_count_rate)]),
    ("output_count_rate", [Some(output_count_rate), Some(output_count_rate)]),
    ("max_sca_length", [Some(max_sca_length), None]),
    ("sca_length", [Some(sca_length), None]),
    ("sca", [Some(sca), None]),
    ("run_active", [Some(run_active), Some(run_active)]),
    ("buffer_len", [None, Some(buffer_len)]),
    ("buffer_done", [None, Some(buffer_done)]),
    ("buffer_full_a", [None, Some(buffer_full_a)]),
    ("buffer_full_b", [None, Some(buffer_full_b)]),
    ("buffer_a", [None, Some(buffer_a)]),
    ("buffer_b", [None, Some(buffer_b)]),
    ("current_pixel", [None, Some(current_pixel)]),
    ("buffer_overrun", [None, Some(buffer_overrun)]),
    ("module_statistics_2", [Some(module_statistics), Some(module_statistics)]),
    ("module_mca", [Some(module_mca), None]),
    ("mca_events", [Some(mca_events), Some(mca_events)]),
    ("total_output_events", [Some(total_output_events), Some(total_output_events)]),
    ("list_buffer_len_a", [None, None]),
    ("list_buffer_len_b", [None, None]),
    ("mapping_pixel_next", [None, Some(mapping_pixel_next)]),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|(name, _)| *name)
}

pub fn get(ctx: &RunDataContext<'_>, mapping_mode: u32, name: &str) -> Result<RunData> {
    let unknown = || PslError::UnknownRunData {
        name: name.to_string(),
        mode: mapping_mode,
    };
    let readers = TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, readers)| readers)
        .ok_or_else(unknown)?;
    let reader = readers
        .get(mapping_mode as usize)
        .copied()
        .flatten()
        .ok_or_else(unknown)?;
    reader(ctx)
}

fn wrong_mode(expected: &'static str) -> PslError {
    PslError::WrongMode { expected }
}

// --- mode 0 ---

fn mca_length(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let inner = ctx.channel.lock()?;
    let mm0 = inner.mapping.mm0().ok_or_else(|| wrong_mode(MCA))?;
    Ok(RunData::UInt(mm0.buffer_len() as u64))
}

fn mca(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let mut inner = ctx.channel.lock()?;
    let mm0 = inner.mapping.mm0_mut().ok_or_else(|| wrong_mode(MCA))?;
    let readout = mm0.read()?;
    inner.stats = readout.stats;
    Ok(RunData::Words(readout.words))
}

fn baseline_length(_ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::UInt(0))
}

fn max_sca_length(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::UInt(ctx.channel.features()?.max_scas as u64))
}

fn sca_length(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::UInt(
        ctx.defaults.get("number_of_scas").unwrap_or(0.0).max(0.0) as u64,
    ))
}

/// SCA regions `[lo, hi)` as configured in the defaults store.
pub fn sca_regions(defaults: &Defaults) -> Vec<(usize, usize)> {
    let count = defaults.get("number_of_scas").unwrap_or(0.0).max(0.0) as usize;
    let mut bounds: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (name, value) in &defaults.values {
        if let Some((index, bound)) = parse_sca_name(name) {
            let entry = bounds.entry(index).or_default();
            let value = value.max(0.0) as usize;
            match bound {
                ScaBound::Lo => entry.0 = value,
                ScaBound::Hi => entry.1 = value,
            }
        }
    }
    (0..count)
        .map(|i| bounds.get(&i).copied().unwrap_or_default())
        .collect()
}

/// Sum `spectrum` over each `[lo, hi)` region.
pub fn sca_sums(spectrum: &[u32], regions: &[(usize, usize)]) -> Vec<f64> {
    regions
        .iter()
        .map(|&(lo, hi)| {
            let hi = hi.min(spectrum.len());
            let lo = lo.min(hi);
            spectrum[lo..hi].iter().map(|&c| c as f64).sum()
        })
        .collect()
}

fn sca(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let regions = sca_regions(ctx.defaults);
    let inner = ctx.channel.lock()?;
    let mm0 = inner.mapping.mm0().ok_or_else(|| wrong_mode(MCA))?;
    Ok(RunData::Floats(sca_sums(mm0.accepted()?, &regions)))
}

fn module_mca(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let mut words = Vec::new();
    for channel in ctx.module.active_channels() {
        let inner = channel.lock()?;
        let mm0 = inner.mapping.mm0().ok_or_else(|| wrong_mode(MCA))?;
        words.extend_from_slice(mm0.accepted()?);
    }
    Ok(RunData::Words(words))
}

// --- both modes ---

fn runtime(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.time_elapsed))
}

fn trigger_livetime(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.trigger_livetime))
}

fn livetime(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.livetime()))
}

fn input_count_rate(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.input_count_rate))
}

fn output_count_rate(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.output_count_rate))
}

fn mca_events(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.mca_events))
}

fn total_output_events(ctx: &RunDataContext<'_>) -> Result<RunData> {
    Ok(RunData::Float(ctx.channel.stats()?.pulses_accepted))
}

fn run_active(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let inner = ctx.channel.lock()?;
    let acquiring = inner.state == ChannelState::Histogram;
    let done = inner
        .mapping
        .mm1()
        .is_some_and(|mm1| mm1.all_pixels_received());
    Ok(RunData::Bool(acquiring && !done))
}

fn module_statistics(ctx: &RunDataContext<'_>) -> Result<RunData> {
    let channels = ctx.module.channels();
    let mut values = vec![0.0; channels.len() * MODULE_STATISTICS_LEN];
    for channel in ctx.module.active_channels() {
        let at = channel.index as usize * MODULE_STATISTICS_LEN;
        values[at..at + MODULE_STATISTICS_LEN]
            .copy_from_slice(&channel.stats()?.module_statistics());
    }
    Ok(RunData::Floats(values))
}

// --- mode 1 ---

fn with_mm1<T>(
    ctx: &RunDataContext<'_>,
    f: impl FnOnce(&mut crate::mapping::Mm1) -> Result<T>,
) -> Result<T> {
    let mut inner = ctx.channel.lock()?;
    let mm1 = inner.mapping.mm1_mut().ok_or_else(|| wrong_mode(MAPPING))?;
    f(mm1)
}

fn buffer_len(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::UInt(mm1.buffers.buffer_len() as u64)))
}

fn buffer_done(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| {
        mm1.buffers.done(None)?;
        Ok(RunData::Bool(true))
    })
}

fn buffer_full_a(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::Bool(mm1.buffers.is_full('a')?)))
}

fn buffer_full_b(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::Bool(mm1.buffers.is_full('b')?)))
}

fn buffer_a(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::Words(mm1.buffers.read('a')?)))
}

fn buffer_b(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::Words(mm1.buffers.read('b')?)))
}

fn current_pixel(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::UInt(mm1.buffers.current_pixel() as u64)))
}

fn buffer_overrun(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| Ok(RunData::UInt(mm1.buffers.overruns() as u64)))
}

fn mapping_pixel_next(ctx: &RunDataContext<'_>) -> Result<RunData> {
    with_mm1(ctx, |mm1| {
        mm1.pixel_next();
        Ok(RunData::Bool(true))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_name() {
        let names: Vec<_> = names().collect();
        assert_eq!(names.len(), 28);
        for name in ["mca", "buffer_a", "module_statistics_2", "mapping_pixel_next"] {
            assert!(names.contains(&name));
        }
        let (_, list) = TABLE.iter().find(|(n, _)| *n == "list_buffer_len_a").unwrap();
        assert!(list.iter().all(Option::is_none));
    }

    #[test]
    fn sca_sums_use_half_open_regions() {
        let spectrum: Vec<u32> = (0..10).collect();
        let sums = sca_sums(&spectrum, &[(0, 3), (3, 5), (8, 20), (6, 4)]);
        assert_eq!(sums, vec![3.0, 7.0, 17.0, 0.0]);
    }

    #[test]
    fn sca_regions_follow_number_of_scas() {
        let mut defaults = Defaults::default();
        defaults.set("number_of_scas", 2.0);
        defaults.set("sca0_lo", 10.0);
        defaults.set("sca0_hi", 20.0);
        defaults.set("sca1_lo", 30.0);
        defaults.set("sca1_hi", 40.0);
        defaults.set("sca2_lo", 50.0);
        assert_eq!(sca_regions(&defaults), vec![(10, 20), (30, 40)]);
    }

    #[test]
    fn run_data_conversions() {
        assert_eq!(RunData::Bool(true).as_f64(), Some(1.0));
        assert_eq!(RunData::UInt(0).as_bool(), Some(false));
        assert_eq!(RunData::Words(vec![1]).into_words(), Some(vec![1]));
        assert_eq!(RunData::Float(1.0).into_floats(), None);
    }
}
