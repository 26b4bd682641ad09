use crate::error::{PslError, Result};
use crate::sinc::{
    self, CalibrationData, CalibrationProgress, ConsistencyReport, HistogramData, HistogramStats,
    KeyValue, Message, OscilloscopeData, ParamDetails, ParamValue, Payload, Status, Waveform,
};
use crate::transport::{FrameReader, RECEIVE_POLL};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ERR_NO_CHANNEL: i32 = 2;
const ERR_BAD_KEY: i32 = 3;
const ERR_BUSY: i32 = 4;
const ERR_NOT_CALIBRATED: i32 = 5;
const ERR_UNSUPPORTED: i32 = 6;

const RUNNING: u8 = 0;
const STOP: u8 = 1;

const CALIBRATION_STAGES: [&str; 4] = ["Acquiring pulses", "Fitting model", "Optimizing", "Done"];
const CALIBRATION_STEPS: u32 = 10;
const PULSE_POINTS: usize = 64;

#[derive(Clone, Debug)]
pub struct SimOptions {
    pub channels: usize,
    pub gate_veto: bool,
    pub termination_50ohm: bool,
    pub attenuation_ground: bool,
    pub risetime_optimization: bool,
    /// ADC sample rate in Hz.
    pub sample_rate: f64,
    pub max_scas: usize,
    /// Wall-clock time between streamed frames.
    pub frame_interval: Duration,
    /// Pulses added to the spectrum per histogram frame.
    pub counts_per_frame: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            channels: 2,
            gate_veto: true,
            termination_50ohm: true,
            attenuation_ground: true,
            risetime_optimization: true,
            sample_rate: 250e6,
            max_scas: 16,
            frame_interval: Duration::from_millis(5),
            counts_per_frame: 2000,
        }
    }
}

#[derive(Debug)]
struct SimChannel {
    params: BTreeMap<String, ParamValue>,
    options: BTreeMap<String, Vec<String>>,
    state: &'static str,
    calibration: Option<CalibrationData>,
    run: Option<Arc<AtomicU8>>,
}

#[derive(Debug)]
struct Device {
    options: SimOptions,
    channels: Vec<SimChannel>,
    inconsistency: Option<ConsistencyReport>,
}

type Shared = Arc<Mutex<Device>>;

fn lock(device: &Shared) -> MutexGuard<'_, Device> {
    // A panicking stream thread must not take the simulator down with it.
    device.lock().unwrap_or_else(|e| e.into_inner())
}

fn status(code: i32, message: impl Into<String>) -> Status {
    Status {
        error_code: code,
        message: message.into(),
    }
}

fn ok() -> Status {
    Status::default()
}

fn option(value: &str) -> ParamValue {
    ParamValue::Option(value.to_string())
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl SimChannel {
    fn new(index: usize, options: &SimOptions) -> Self {
        let mut params: BTreeMap<String, ParamValue> = [
            ("afe.dacGain", ParamValue::Float(409.6)),
            ("afe.dacOffset", ParamValue::Int(32768)),
            ("afe.invert", ParamValue::Bool(false)),
            ("afe.termination", option("1kohm")),
            ("afe.attn", option("0dB")),
            ("afe.coupling", option("dc")),
            ("afe.decayTime", option("long")),
            ("afe.sampleRate", ParamValue::Float(options.sample_rate)),
            ("afe.serialNumber", ParamValue::Str(format!("AFE-{index:04}"))),
            ("pulse.resetBlanking.enable", ParamValue::Bool(true)),
            ("pulse.resetBlanking.threshold", ParamValue::Float(-0.05)),
            ("pulse.resetBlanking.preSamples", ParamValue::Int(50)),
            ("pulse.resetBlanking.postSamples", ParamValue::Int(50)),
            ("pulse.detection.threshold", ParamValue::Float(0.01)),
            ("pulse.minPulsePairSeparation", ParamValue::Int(25)),
            ("pulse.sourceType", option("highRate")),
            ("pulse.scaleFactor", ParamValue::Float(1.0)),
            ("pulse.calibration.optimize", ParamValue::Bool(false)),
            ("histogram.binning.coarseBinScaling", ParamValue::Int(2)),
            ("histogram.binning.binSubRegion.lowIndex", ParamValue::Int(0)),
            ("histogram.binning.binSubRegion.highIndex", ParamValue::Int(4095)),
            ("histogram.refreshRate", ParamValue::Int(100)),
            ("histogram.mode", option("continuous")),
            ("histogram.fixedTime.duration", ParamValue::Float(0.0)),
            ("histogram.fixedInputCount.count", ParamValue::Int(0)),
            ("histogram.fixedOutputCount.count", ParamValue::Int(0)),
            ("gate.statsCollectionMode", option("risingEdge")),
            ("sync.count", ParamValue::Int(0)),
            ("sca.trigger", option("high")),
            ("sca.pulseDuration", ParamValue::Int(400)),
            ("sca.numRegions", ParamValue::Int(0)),
            ("oscilloscope.samples", ParamValue::Int(8192)),
            ("instrument.productName", ParamValue::Str("FalconXn".into())),
            ("instrument.protocolVersion", ParamValue::Int(0x0001_0004)),
            ("instrument.firmwareVersion", ParamValue::Str("sim-1.0.0".into())),
            ("instrument.serialNumber", ParamValue::Str("SIM0042".into())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let mut choices: BTreeMap<String, Vec<String>> = [
            ("afe.coupling", strings(&["ac", "dc"])),
            ("afe.decayTime", strings(&["long", "medium", "short", "veryShort"])),
            (
                "pulse.sourceType",
                strings(&["lowEnergy", "lowRate", "midRate", "highRate", "maxThroughput"]),
            ),
            (
                "histogram.mode",
                strings(&[
                    "continuous",
                    "fixedTime",
                    "fixedInputCount",
                    "fixedOutputCount",
                    "gated",
                    "spatialSync",
                ]),
            ),
            (
                "gate.statsCollectionMode",
                strings(&["risingEdge", "fallingEdge", "whenHigh", "whenLow"]),
            ),
            ("sca.trigger", strings(&["off", "high", "low", "always"])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        choices.insert(
            "afe.termination".into(),
            if options.termination_50ohm {
                strings(&["1kohm", "50ohm"])
            } else {
                strings(&["1kohm"])
            },
        );
        choices.insert(
            "afe.attn".into(),
            if options.attenuation_ground {
                strings(&["0dB", "-6dB", "ground"])
            } else {
                strings(&["0dB", "-6dB", "-12dB"])
            },
        );
        if options.gate_veto {
            params.insert("gate.veto".into(), option("off"));
            choices.insert("gate.veto".into(), strings(&["off", "whenHigh", "whenLow"]));
        }
        if options.risetime_optimization {
            params.insert("pulse.riseTimeParameter".into(), ParamValue::Int(0));
        }
        for region in 1..=options.max_scas {
            params.insert(format!("sca.region_{region:02}.startBin"), ParamValue::Int(0));
            params.insert(format!("sca.region_{region:02}.endBin"), ParamValue::Int(0));
        }

        Self {
            params,
            options: choices,
            state: "ready",
            calibration: None,
            run: None,
        }
    }

    fn get(&self, key: &str) -> Option<ParamValue> {
        match key {
            "channel.state" => Some(option(self.state)),
            "pulse.calibrated" => Some(ParamValue::Bool(self.calibration.is_some())),
            _ => self.params.get(key).cloned(),
        }
    }

    fn set(&mut self, kv: KeyValue) -> std::result::Result<(), String> {
        if !self.params.contains_key(&kv.key) {
            return Err(format!("unknown key '{}'", kv.key));
        }
        if let (Some(choices), Some(value)) = (self.options.get(&kv.key), kv.value.as_str()) {
            if !choices.iter().any(|c| c == value) {
                return Err(format!("'{value}' is not an option of {}", kv.key));
            }
        }
        self.params.insert(kv.key, kv.value);
        Ok(())
    }

    fn int(&self, key: &str) -> i64 {
        self.params.get(key).and_then(ParamValue::as_i64).unwrap_or(0)
    }

    fn float(&self, key: &str) -> f64 {
        self.params.get(key).and_then(ParamValue::as_f64).unwrap_or(0.0)
    }

    fn details(&self, prefix: &str, max_scas: usize) -> Vec<ParamDetails> {
        self.params
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| ParamDetails {
                key: key.clone(),
                value: Some(value.clone()),
                options: self.options.get(key).cloned().unwrap_or_default(),
                min: None,
                max: (key == "sca.numRegions").then_some(max_scas as f64),
                read_only: key.starts_with("instrument.") || key == "afe.sampleRate",
            })
            .collect()
    }

    fn stop_stream(&mut self) {
        if let Some(run) = self.run.take() {
            run.store(STOP, Ordering::SeqCst);
        }
    }
}

struct Link {
    writer: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl Link {
    fn send(&self, channel: i32, payload: Payload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let frame = match sinc::encode(&Message::new(channel, payload)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("sim: cannot encode reply: {e}");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(&frame) {
            debug!("sim: client gone: {e}");
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn state(&self, channel: i32, state: &str) {
        self.send(
            channel,
            Payload::ParamUpdated(vec![KeyValue::new("channel.state", option(state))]),
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct SimServer {
    addr: SocketAddr,
    device: Shared,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl SimServer {
    /// Start listening on an ephemeral loopback port.
    pub fn start(options: SimOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let device = Arc::new(Mutex::new(Device {
            channels: (0..options.channels)
                .map(|i| SimChannel::new(i, &options))
                .collect(),
            options,
            inconsistency: None,
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let device = Arc::clone(&device);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("sim-accept".into())
                .spawn(move || accept_loop(listener, device, shutdown))
                .map_err(|e| PslError::Thread(format!("cannot start simulator: {e}")))?
        };
        info!("simulated FalconXN listening on {addr}");
        Ok(Self {
            addr,
            device,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Make the next consistency checks report `bad_key`.
    pub fn set_inconsistent(&self, bad_key: &str, message: &str) {
        lock(&self.device).inconsistency = Some(ConsistencyReport {
            healthy: false,
            bad_key: bad_key.to_string(),
            message: message.to_string(),
        });
    }

    pub fn clear_inconsistent(&self) {
        lock(&self.device).inconsistency = None;
    }

    pub fn param(&self, channel: usize, key: &str) -> Option<ParamValue> {
        lock(&self.device).channels.get(channel)?.get(key)
    }

    /// Replace the calibration the device holds, sane or not.
    pub fn set_calibration(&self, channel: usize, calibration: CalibrationData) {
        if let Some(channel) = lock(&self.device).channels.get_mut(channel) {
            channel.calibration = Some(calibration);
        }
    }

    pub fn is_calibrated(&self, channel: usize) -> bool {
        lock(&self.device)
            .channels
            .get(channel)
            .is_some_and(|c| c.calibration.is_some())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for channel in lock(&self.device).channels.iter_mut() {
            channel.stop_stream();
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("sim: acceptor panicked");
            }
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, device: Shared, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("sim: client {peer} connected");
                let device = Arc::clone(&device);
                let shutdown = Arc::clone(&shutdown);
                let spawned = thread::Builder::new()
                    .name(format!("sim-{peer}"))
                    .spawn(move || {
                        if let Err(e) = session(stream, device, shutdown) {
                            debug!("sim: session ended: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("sim: cannot serve {peer}: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(10)),
            Err(e) => {
                warn!("sim: accept failed: {e}");
                break;
            }
        }
    }
}

fn session(stream: TcpStream, device: Shared, shutdown: Arc<AtomicBool>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let link = Arc::new(Link {
        writer: Mutex::new(stream.try_clone()?),
        closed: AtomicBool::new(false),
    });
    let mut reader = FrameReader::new(stream, RECEIVE_POLL, Duration::from_secs(1))?;
    let result = loop {
        if shutdown.load(Ordering::SeqCst) || link.is_closed() {
            break Ok(());
        }
        match reader.read_message() {
            Ok(Some(message)) => handle(&device, &link, message),
            Ok(None) => {}
            Err(PslError::Decode(e)) => warn!("sim: bad frame: {e}"),
            Err(e) => break Err(e),
        }
    };
    link.closed.store(true, Ordering::SeqCst);
    for channel in lock(&device).channels.iter_mut() {
        channel.stop_stream();
        if channel.state != "ready" {
            channel.state = "ready";
        }
    }
    result
}

fn handle(device: &Shared, link: &Arc<Link>, message: Message) {
    let ch = message.channel;
    let index = usize::try_from(ch).ok();
    let kind = message.message_type();
    if !kind.is_request() {
        warn!("sim: ignoring {kind:?} from client");
        return;
    }
    if let Payload::Ping = message.payload {
        link.send(ch, Payload::Success(ok()));
        return;
    }
    let valid = index.is_some_and(|i| i < lock(device).channels.len());
    let Some(index) = index.filter(|_| valid) else {
        let reply = status(ERR_NO_CHANNEL, format!("no channel {ch}"));
        link.send(ch, error_reply(&message.payload, reply));
        return;
    };

    match message.payload {
        Payload::Ping => {}
        Payload::GetParam(keys) => {
            let dev = lock(device);
            let channel = &dev.channels[index];
            let mut results = Vec::with_capacity(keys.len());
            let mut reply = ok();
            for key in keys {
                match channel.get(&key) {
                    Some(value) => results.push(KeyValue::new(key, value)),
                    None => {
                        reply = status(ERR_BAD_KEY, format!("unknown key '{key}'"));
                        results.clear();
                        break;
                    }
                }
            }
            drop(dev);
            link.send(
                ch,
                Payload::GetParamResponse {
                    status: reply,
                    results,
                },
            );
        }
        Payload::SetParam(params) => {
            let mut dev = lock(device);
            let channel = &mut dev.channels[index];
            let mut reply = ok();
            for kv in params {
                if let Err(message) = channel.set(kv) {
                    reply = status(ERR_BAD_KEY, message);
                    break;
                }
            }
            drop(dev);
            link.send(ch, Payload::Success(reply));
        }
        Payload::ListParamDetails { prefix } => {
            let dev = lock(device);
            let details = dev.channels[index].details(&prefix, dev.options.max_scas);
            drop(dev);
            link.send(
                ch,
                Payload::ListParamDetailsResponse {
                    status: ok(),
                    details,
                },
            );
        }
        Payload::CheckParamConsistency => {
            let report = lock(device).inconsistency.clone().unwrap_or(ConsistencyReport {
                healthy: true,
                ..Default::default()
            });
            link.send(ch, Payload::CheckParamConsistencyResponse(report));
        }
        Payload::StartHistogram => start_stream(device, link, index, "histogram", stream_histograms),
        Payload::StartOscilloscope => {
            start_stream(device, link, index, "oscilloscope", stream_oscilloscope)
        }
        Payload::StartCalibration => {
            start_stream(device, link, index, "calibrating", stream_calibration)
        }
        Payload::StopDataAcquisition { skip } => {
            let mut dev = lock(device);
            let channel = &mut dev.channels[index];
            channel.stop_stream();
            if channel.state == "calibrating" && skip {
                channel.calibration = Some(generate_calibration());
            }
            channel.state = "ready";
            drop(dev);
            link.send(ch, Payload::Success(ok()));
            link.state(ch, "ready");
        }
        Payload::GetCalibration => {
            let calibration = lock(device).channels[index].calibration.clone();
            let reply = match calibration {
                Some(calibration) => Payload::GetCalibrationResponse {
                    status: ok(),
                    calibration,
                },
                None => Payload::GetCalibrationResponse {
                    status: status(ERR_NOT_CALIBRATED, "channel is not characterized"),
                    calibration: CalibrationData::default(),
                },
            };
            link.send(ch, reply);
        }
        Payload::SetCalibration(calibration) => {
            lock(device).channels[index].calibration = Some(calibration);
            link.send(ch, Payload::Success(ok()));
        }
        Payload::CalculateDcOffset => {
            let dc_offset = rand::rng().random_range(-0.05..0.05);
            link.send(
                ch,
                Payload::CalculateDcOffsetResponse {
                    status: ok(),
                    dc_offset,
                },
            );
        }
        Payload::StartListMode => link.send(
            ch,
            Payload::Success(status(ERR_UNSUPPORTED, "list mode is not simulated")),
        ),
        other => warn!("sim: unexpected {:?}", other.message_type()),
    }
}

fn error_reply(request: &Payload, status: Status) -> Payload {
    match request {
        Payload::GetParam(_) => Payload::GetParamResponse {
            status,
            results: Vec::new(),
        },
        Payload::GetCalibration => Payload::GetCalibrationResponse {
            status,
            calibration: CalibrationData::default(),
        },
        Payload::ListParamDetails { .. } => Payload::ListParamDetailsResponse {
            status,
            details: Vec::new(),
        },
        Payload::CalculateDcOffset => Payload::CalculateDcOffsetResponse {
            status,
            dc_offset: 0.0,
        },
        Payload::CheckParamConsistency => Payload::CheckParamConsistencyResponse(ConsistencyReport {
            healthy: false,
            bad_key: String::new(),
            message: status.message,
        }),
        _ => Payload::Success(status),
    }
}

type StreamFn = fn(Shared, Arc<Link>, usize, Arc<AtomicU8>);

fn start_stream(device: &Shared, link: &Arc<Link>, index: usize, state: &'static str, body: StreamFn) {
    let ch = index as i32;
    let run = Arc::new(AtomicU8::new(RUNNING));
    {
        let mut dev = lock(device);
        let channel = &mut dev.channels[index];
        if channel.state != "ready" {
            let busy = status(ERR_BUSY, format!("channel is {}", channel.state));
            drop(dev);
            link.send(ch, Payload::Success(busy));
            return;
        }
        channel.state = state;
        channel.run = Some(Arc::clone(&run));
    }
    link.send(ch, Payload::Success(ok()));
    link.state(ch, state);

    let (device, link) = (Arc::clone(device), Arc::clone(link));
    let spawned = thread::Builder::new()
        .name(format!("sim-{state}-{index}"))
        .spawn(move || body(device, link, index, run));
    if let Err(e) = spawned {
        warn!("sim: cannot start {state} on channel {index}: {e}");
    }
}

fn finish(device: &Shared, link: &Link, index: usize, run: &Arc<AtomicU8>) {
    let mut dev = lock(device);
    let channel = &mut dev.channels[index];
    let ours = channel.run.as_ref().is_some_and(|r| Arc::ptr_eq(r, run));
    if ours {
        channel.run = None;
        channel.state = "ready";
        link.state(index as i32, "ready");
    }
}

fn stopped(run: &AtomicU8, link: &Link) -> bool {
    run.load(Ordering::SeqCst) != RUNNING || link.is_closed()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Preset {
    None,
    Time(f64),
    InputCount(u64),
    OutputCount(u64),
}

fn stream_histograms(device: Shared, link: Arc<Link>, index: usize, run: Arc<AtomicU8>) {
    let (bins, preset, accumulate, frame_seconds, interval, counts) = {
        let dev = lock(&device);
        let channel = &dev.channels[index];
        let low = channel.int("histogram.binning.binSubRegion.lowIndex");
        let high = channel.int("histogram.binning.binSubRegion.highIndex");
        let mode = channel
            .params
            .get("histogram.mode")
            .and_then(ParamValue::as_str)
            .unwrap_or("continuous")
            .to_string();
        let preset = match mode.as_str() {
            "fixedTime" => Preset::Time(channel.float("histogram.fixedTime.duration")),
            "fixedInputCount" => {
                Preset::InputCount(channel.int("histogram.fixedInputCount.count").max(0) as u64)
            }
            "fixedOutputCount" => {
                Preset::OutputCount(channel.int("histogram.fixedOutputCount.count").max(0) as u64)
            }
            _ => Preset::None,
        };
        let accumulate = !matches!(mode.as_str(), "gated" | "spatialSync");
        (
            (high - low + 1).max(1) as usize,
            preset,
            accumulate,
            channel.int("histogram.refreshRate").max(1) as f64 / 1000.0,
            dev.options.frame_interval,
            dev.options.counts_per_frame,
        )
    };

    let mut rng = rand::rng();
    let mut accepted = vec![0u32; bins];
    let mut rejected = vec![0u32; bins];
    let mut totals = HistogramStats::default();
    let mut triggers: u64 = 0;
    loop {
        thread::sleep(interval);
        if stopped(&run, &link) {
            return;
        }
        if !accumulate {
            accepted.fill(0);
            rejected.fill(0);
            totals = HistogramStats::default();
            triggers = 0;
        }
        let pulses = add_pulses(&mut rng, &mut accepted, counts);
        let piled_up = add_pulses(&mut rng, &mut rejected, counts / 20);
        let erased = rng.random_range(0..=counts as u64 / 50);
        triggers += pulses + piled_up;
        totals.time_elapsed += frame_seconds;
        totals.samples_detected = triggers + erased;
        totals.samples_erased += erased;
        totals.pulses_accepted += pulses;
        totals.pulses_rejected += piled_up;
        totals.input_count_rate = triggers as f64 / totals.time_elapsed;
        totals.output_count_rate = totals.pulses_accepted as f64 / totals.time_elapsed;
        totals.dead_time = if triggers > 0 {
            100.0 * totals.pulses_rejected as f64 / triggers as f64
        } else {
            0.0
        };

        let done = match preset {
            Preset::None => false,
            Preset::Time(seconds) => totals.time_elapsed >= seconds - 1e-9,
            Preset::InputCount(count) => triggers >= count,
            Preset::OutputCount(count) => totals.pulses_accepted >= count,
        };
        link.send(
            index as i32,
            Payload::HistogramData(HistogramData {
                accepted: accepted.clone(),
                rejected: rejected.clone(),
                stats: totals.clone(),
            }),
        );
        if done {
            finish(&device, &link, index, &run);
            return;
        }
    }
}

fn add_pulses(rng: &mut impl Rng, spectrum: &mut [u32], pulses: u32) -> u64 {
    let bins = spectrum.len();
    if bins == 0 {
        return 0;
    }
    let peaks = [(0.3 * bins as f64, 0.015 * bins as f64), (0.6 * bins as f64, 0.02 * bins as f64)];
    for _ in 0..pulses {
        let bin = if rng.random_range(0..10) == 0 {
            rng.random_range(0..bins)
        } else {
            let (centre, width) = peaks[rng.random_range(0..peaks.len())];
            // Box-Muller
            let u1: f64 = rng.random_range(f64::EPSILON..1.0);
            let u2: f64 = rng.random();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            (centre + z * width).round().clamp(0.0, bins as f64 - 1.0) as usize
        };
        spectrum[bin] = spectrum[bin].saturating_add(1);
    }
    pulses as u64
}

fn stream_oscilloscope(device: Shared, link: Arc<Link>, index: usize, run: Arc<AtomicU8>) {
    let (samples, interval) = {
        let dev = lock(&device);
        (
            dev.channels[index].int("oscilloscope.samples").max(1) as usize,
            dev.options.frame_interval,
        )
    };
    thread::sleep(interval);
    if stopped(&run, &link) {
        return;
    }
    let mut rng = rand::rng();
    let mut level = 8192.0;
    let trace = (0..samples)
        .map(|i| {
            if i % 512 == 256 {
                level += rng.random_range(20.0..200.0);
            }
            if level > 60000.0 {
                level = 8192.0;
            }
            (level + rng.random_range(-8.0..8.0)) as u32
        })
        .collect();
    link.send(
        index as i32,
        Payload::OscilloscopeData(OscilloscopeData { samples: trace }),
    );
    finish(&device, &link, index, &run);
}

fn stream_calibration(device: Shared, link: Arc<Link>, index: usize, run: Arc<AtomicU8>) {
    let interval = lock(&device).options.frame_interval;
    for step in 1..=CALIBRATION_STEPS {
        thread::sleep(interval);
        if stopped(&run, &link) {
            return;
        }
        let stage = CALIBRATION_STAGES
            [(step as usize * CALIBRATION_STAGES.len() - 1) / CALIBRATION_STEPS as usize];
        if step == CALIBRATION_STEPS {
            let mut dev = lock(&device);
            if dev.channels[index]
                .run
                .as_ref()
                .is_some_and(|r| Arc::ptr_eq(r, &run))
            {
                dev.channels[index].calibration = Some(generate_calibration());
            }
        }
        link.send(
            index as i32,
            Payload::CalibrationProgress(CalibrationProgress {
                progress: 100.0 * step as f64 / CALIBRATION_STEPS as f64,
                complete: step == CALIBRATION_STEPS,
                stage: stage.to_string(),
            }),
        );
    }
    finish(&device, &link, index, &run);
}

fn generate_calibration() -> CalibrationData {
    let mut rng = rand::rng();
    let pulse = |rise: f64, decay: f64, noise: f64, rng: &mut rand::rngs::ThreadRng| Waveform {
        x: (0..PULSE_POINTS).map(|i| i as f64).collect(),
        y: (0..PULSE_POINTS)
            .map(|i| {
                let t = i as f64;
                let shape = (1.0 - (-t / rise).exp()) * (-t / decay).exp();
                shape + rng.random_range(-noise..=noise)
            })
            .collect(),
    };
    CalibrationData {
        data: (0..256).map(|_| rng.random()).collect(),
        example: pulse(2.0, 20.0, 0.02, &mut rng),
        model: pulse(2.5, 18.0, 0.0, &mut rng),
        final_pulse: pulse(2.2, 19.0, 0.0, &mut rng),
    }
}
