//! Detector characterization: the device-computed pulse-shape calibration,
//! its sanity check, and a human-editable text form for saving it.
//!
//! ```text
//! data=<N>
//! <hex bytes, comma separated>
//! example-x=<L>[,start=<s>,incr=<d>]
//! <floats, comma separated; omitted when start/incr are given>
//! example-y=<L>
//! <floats>
//! model-x=... model-y=... final-x=... final-y=...
//! ```

use crate::channel::{CalibrationState, Channel, ChannelState, Progress};
use crate::defaults::write_atomic;
use crate::error::{PslError, Result};
use crate::module::Module;
use crate::params::Params;
use crate::sinc::{CalibrationData, KeyValue, MessageType, ParamValue, Payload, Waveform};
use log::{debug, info, warn};
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::time::Duration;

const WRAP_COLUMN: usize = 60;

const Y_LIMIT: f64 = 100.0;

fn waveform_is_sane(waveform: &Waveform) -> bool {
    waveform.x.len() == waveform.y.len()
        && waveform.x.iter().enumerate().all(|(i, &x)| x == i as f64)
        && waveform.y.iter().all(|y| (-Y_LIMIT..=Y_LIMIT).contains(y))
}

/// Accept a calibration only if every waveform is indexed 0..n with bounded Y.
pub fn is_sane(calibration: &CalibrationData) -> bool {
    [
        &calibration.example,
        &calibration.model,
        &calibration.final_pulse,
    ]
    .into_iter()
    .all(waveform_is_sane)
}

fn push_wrapped<T: Display>(out: &mut String, items: impl IntoIterator<Item = T>) {
    let mut line = String::new();
    for item in items {
        let item = item.to_string();
        if !line.is_empty() && line.len() + 1 + item.len() > WRAP_COLUMN {
            out.push_str(&line);
            out.push('\n');
            line.clear();
        }
        if !line.is_empty() {
            line.push(',');
        }
        line.push_str(&item);
    }
    if !line.is_empty() {
        out.push_str(&line);
        out.push('\n');
    }
}

fn progression(x: &[f64]) -> Option<(f64, f64)> {
    let start = *x.first()?;
    let incr = if x.len() > 1 { x[1] - start } else { 0.0 };
    x.iter()
        .enumerate()
        .all(|(i, &v)| v == start + i as f64 * incr)
        .then_some((start, incr))
}

fn push_waveform(out: &mut String, name: &str, waveform: &Waveform) {
    match progression(&waveform.x) {
        Some((start, incr)) => {
            out.push_str(&format!(
                "{name}-x={},start={start},incr={incr}\n",
                waveform.x.len()
            ));
        }
        None => {
            out.push_str(&format!("{name}-x={}\n", waveform.x.len()));
            push_wrapped(out, &waveform.x);
        }
    }
    out.push_str(&format!("{name}-y={}\n", waveform.y.len()));
    push_wrapped(out, &waveform.y);
}

pub fn to_text(calibration: &CalibrationData) -> String {
    let mut out = format!("data={}\n", calibration.data.len());
    push_wrapped(
        &mut out,
        calibration.data.iter().map(|b| format!("{b:02x}")),
    );
    push_waveform(&mut out, "example", &calibration.example);
    push_waveform(&mut out, "model", &calibration.model);
    push_waveform(&mut out, "final", &calibration.final_pulse);
    out
}

struct Section {
    name: String,
    len: usize,
    start: Option<f64>,
    incr: Option<f64>,
    items: Vec<String>,
}

fn bad(message: impl Into<String>) -> PslError {
    PslError::BadCharacterization(message.into())
}

fn parse_number<T: std::str::FromStr>(what: &str, text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| bad(format!("{what}: '{text}' is not a number")))
}

fn parse_sections(text: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.contains('=') {
            let mut fields = line.split(',');
            let (name, len) = fields
                .next()
                .and_then(|f| f.split_once('='))
                .ok_or_else(|| bad(format!("bad header '{line}'")))?;
            let mut section = Section {
                name: name.trim().to_string(),
                len: parse_number(name, len)?,
                start: None,
                incr: None,
                items: Vec::new(),
            };
            for field in fields {
                match field.split_once('=') {
                    Some(("start", v)) => section.start = Some(parse_number(name, v)?),
                    Some(("incr", v)) => section.incr = Some(parse_number(name, v)?),
                    _ => return Err(bad(format!("bad field '{field}' in '{name}'"))),
                }
            }
            sections.push(section);
        } else {
            let section = sections
                .last_mut()
                .ok_or_else(|| bad("values before the first header"))?;
            section.items.extend(
                line.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }
    }
    Ok(sections)
}

fn take<'a>(sections: &'a [Section], name: &str) -> Result<&'a Section> {
    sections
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| bad(format!("missing '{name}'")))
}

fn floats(section: &Section) -> Result<Vec<f64>> {
    if let (Some(start), Some(incr)) = (section.start, section.incr) {
        if !section.items.is_empty() {
            return Err(bad(format!("'{}' has both start/incr and values", section.name)));
        }
        return Ok((0..section.len).map(|i| start + i as f64 * incr).collect());
    }
    let values = section
        .items
        .iter()
        .map(|v| parse_number::<f64>(&section.name, v))
        .collect::<Result<Vec<_>>>()?;
    if values.len() != section.len {
        return Err(bad(format!(
            "'{}' declares {} values but has {}",
            section.name,
            section.len,
            values.len()
        )));
    }
    Ok(values)
}

fn waveform(sections: &[Section], name: &str) -> Result<Waveform> {
    Ok(Waveform {
        x: floats(take(sections, &format!("{name}-x"))?)?,
        y: floats(take(sections, &format!("{name}-y"))?)?,
    })
}

pub fn from_text(text: &str) -> Result<CalibrationData> {
    let sections = parse_sections(text)?;
    let data_section = take(&sections, "data")?;
    let data = data_section
        .items
        .iter()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| bad(format!("bad data byte '{b}'"))))
        .collect::<Result<Vec<u8>>>()?;
    if data.len() != data_section.len {
        return Err(bad(format!(
            "data declares {} bytes but has {}",
            data_section.len,
            data.len()
        )));
    }
    Ok(CalibrationData {
        data,
        example: waveform(&sections, "example")?,
        model: waveform(&sections, "model")?,
        final_pulse: waveform(&sections, "final")?,
    })
}

pub fn save(path: &Path, calibration: &CalibrationData) -> Result<()> {
    write_atomic(path, &to_text(calibration))?;
    info!("characterization saved to {}", path.display());
    Ok(())
}

pub fn load(path: &Path) -> Result<CalibrationData> {
    let text = fs::read_to_string(path).map_err(|source| PslError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    from_text(&text)
}

pub fn start(module: &Module, channel: &Channel) -> Result<()> {
    let params = Params::new(module, channel.index);
    let mut settings = vec![KeyValue::new(
        "pulse.calibration.optimize",
        ParamValue::Bool(true),
    )];
    if channel.features()?.mca_gate_veto {
        settings.push(KeyValue::new("gate.veto", ParamValue::Option("off".into())));
    }
    params.set_many(settings)?;

    // The device may report ready again before the command returns.
    let (state, calibration, calibration_state) = {
        let mut inner = channel.lock()?;
        let previous = (
            inner.state,
            inner.calibration.take(),
            inner.calibration_state,
        );
        inner.calibration_state = CalibrationState::None;
        inner.progress = Progress {
            percentage: 0.0,
            stage: "Starting".to_string(),
            running: true,
        };
        previous
    };
    channel.apply_state(ChannelState::Characterizing)?;

    if let Err(e) = module.command(channel.index, Payload::StartCalibration) {
        channel.apply_state(state)?;
        let mut inner = channel.lock()?;
        inner.calibration = calibration;
        inner.calibration_state = calibration_state;
        inner.progress.running = false;
        return Err(e);
    }
    info!("channel {}: characterization started", channel.index);
    Ok(())
}

/// Stop characterizing, keeping whatever the device has so far.
pub fn stop(module: &Module, channel: &Channel, timeout: Duration) -> Result<()> {
    channel.stop(module, true, timeout)
}

/// Fetch the calibration from the device if the channel says it changed.
/// Returns whether a calibration is ready afterwards.
pub fn refresh(module: &Module, channel: &Channel) -> Result<bool> {
    match channel.lock()?.calibration_state {
        CalibrationState::Ready => return Ok(true),
        CalibrationState::None => return Ok(false),
        CalibrationState::NeedRefresh => {}
    }
    let params = Params::new(module, channel.index);
    if !params.get_bool("pulse.calibrated")? {
        debug!("channel {}: device holds no calibration", channel.index);
        channel.lock()?.calibration_state = CalibrationState::None;
        return Ok(false);
    }
    let reply = module.request(
        channel.index,
        Payload::GetCalibration,
        MessageType::GetCalibrationResponse,
    )?;
    let calibration = match reply {
        Payload::GetCalibrationResponse { calibration, .. } => calibration,
        other => {
            return Err(PslError::Protocol(format!(
                "calibration request answered with {:?}",
                other.message_type()
            )))
        }
    };

    let mut inner = channel.lock()?;
    if !is_sane(&calibration) {
        warn!("channel {}: rejecting insane calibration", channel.index);
        inner.calibration = None;
        inner.calibration_state = CalibrationState::None;
        return Err(bad("device calibration failed the sanity check"));
    }
    inner.calibration = Some(calibration);
    inner.calibration_state = CalibrationState::Ready;
    Ok(true)
}

/// Send a saved calibration to the device and treat it as current.
pub fn restore(module: &Module, channel: &Channel, calibration: CalibrationData) -> Result<()> {
    if !is_sane(&calibration) {
        return Err(bad("saved calibration failed the sanity check"));
    }
    module.command(channel.index, Payload::SetCalibration(calibration.clone()))?;
    let mut inner = channel.lock()?;
    inner.calibration = Some(calibration);
    inner.calibration_state = CalibrationState::Ready;
    info!("channel {}: characterization restored", channel.index);
    Ok(())
}
