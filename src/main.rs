use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use confique::Config;
use falconxn::acq_values::{self, PRESET_FIXED_REAL};
use falconxn::config::LoggingSettings;
use falconxn::{
    BoardData, BoardInfo, ChannelSettings, Conf, FirmwareSettings, ModuleSettings, Psl, RunData,
    SimOptions, SimServer,
};
use log::{error, info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use time::macros::format_description;

#[derive(Parser, Debug)]
#[command(version, about = "Drive FalconXN pulse processors over SINC", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "falconxn.toml")]
    config: PathBuf,
    /// Talk to a simulated FalconXN instead of the configured hosts
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Log level, overriding the configuration
    #[arg(short, long)]
    log_level: Option<LevelFilter>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Board information and acquisition values of every channel
    Info,
    /// Acquire one spectrum for a fixed real time
    Mca {
        #[arg(short, long, default_value_t = 0)]
        det_chan: i32,
        /// Run length in seconds
        #[arg(short, long, default_value_t = 1.0)]
        seconds: f64,
        /// Write the spectrum as little-endian u32 words
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Acquire a map, advancing pixels from the host
    Map {
        #[arg(short, long, default_value_t = 0)]
        det_chan: i32,
        #[arg(short, long, default_value_t = 16)]
        pixels: u32,
        #[arg(long, default_value_t = 4)]
        pixels_per_buffer: u32,
        /// Buffers are appended here as little-endian u32 words
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Capture an ADC trace
    Trace {
        #[arg(short, long, default_value_t = 0)]
        det_chan: i32,
        #[arg(short, long, default_value_t = 8192)]
        samples: u32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Characterize a channel and save the calibration
    Characterize {
        #[arg(short, long, default_value_t = 0)]
        det_chan: i32,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Conf::builder()
        .file(&args.config)
        .load()
        .with_context(|| format!("cannot load {}", args.config.display()))?;
    init_logging(&config.logging, args.log_level)?;

    let _sim = if args.simulate {
        Some(simulate(&mut config)?)
    } else {
        None
    };
    if config.modules.is_empty() {
        bail!("no modules configured in {}", args.config.display());
    }

    let mut psl = Psl::with_defaults_file(config.timeouts.timeouts(), &config.defaults_file)?;
    for module in config.modules.clone() {
        let alias = module.alias.clone();
        psl.setup_module(module)
            .with_context(|| format!("cannot set up module '{alias}'"))?;
    }

    let result = run(&psl, args.command);
    if let Err(e) = &result {
        error!("{e:#}");
    }
    if let Err(e) = psl.save_defaults() {
        warn!("defaults not saved: {e}");
    }
    psl.end_all()?;
    result
}

fn init_logging(settings: &LoggingSettings, level: Option<LevelFilter>) -> Result<()> {
    let level = match level {
        Some(level) => level,
        None => settings
            .level
            .parse()
            .with_context(|| format!("bad log level '{}'", settings.level))?,
    };
    let log_config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &settings.file {
        let file = File::create(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, log_config, file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

/// Start a simulator and point every configured module at it.
fn simulate(config: &mut Conf) -> Result<SimServer> {
    if config.modules.is_empty() {
        config.modules.push(ModuleSettings {
            alias: "sim".into(),
            host: String::new(),
            port: 0,
            timeout_ms: None,
            channels: vec![ChannelSettings {
                det_chan: 0,
                alias: "det0".into(),
                detector_polarity: None,
                firmware: Some(FirmwareSettings {
                    alias: "fw0".into(),
                    characterization: None,
                }),
            }],
        });
    }
    let channels = config
        .modules
        .iter()
        .map(|m| m.channels.len())
        .max()
        .unwrap_or(1);
    let sim = SimServer::start(SimOptions {
        channels,
        ..Default::default()
    })?;
    if config.modules.len() > 1 {
        warn!("all {} modules share one simulated device", config.modules.len());
    }
    for module in &mut config.modules {
        module.host = sim.host();
        module.port = sim.port();
    }
    info!("simulating on {}:{}", sim.host(), sim.port());
    Ok(sim)
}

fn run(psl: &Psl, command: Command) -> Result<()> {
    match command {
        Command::Info => info_command(psl),
        Command::Mca {
            det_chan,
            seconds,
            output,
        } => mca_command(psl, det_chan, seconds, output.as_deref()),
        Command::Map {
            det_chan,
            pixels,
            pixels_per_buffer,
            output,
        } => map_command(psl, det_chan, pixels, pixels_per_buffer, &output),
        Command::Trace {
            det_chan,
            samples,
            output,
        } => trace_command(psl, det_chan, samples, output.as_deref()),
        Command::Characterize { det_chan, output } => characterize_command(psl, det_chan, &output),
    }
}

fn info_command(psl: &Psl) -> Result<()> {
    for det_chan in psl.det_chans() {
        let info = match psl.board_operation(det_chan, "get_board_info", None)? {
            BoardData::Bytes(bytes) => {
                let record = bytes
                    .try_into()
                    .map_err(|_| anyhow!("short board info record"))?;
                BoardInfo::from_bytes(&record)
            }
            other => bail!("board info came back as {other:?}"),
        };
        println!("detector channel {det_chan}");
        println!("  product:\t{}", info.product_name);
        println!("  serial:\t{}", info.serial_number);
        println!("  firmware:\t{}", info.firmware_version);
        println!("  protocol:\t{:#x}", info.protocol_version);
        println!("  AFE serial:\t{}", info.afe_serial_number);
        if let BoardData::UInt(bits) = psl.board_operation(det_chan, "get_board_features", None)? {
            println!("  features:\t{bits:#06b}");
        }
        for entry in acq_values::TABLE.iter() {
            if entry.has(acq_values::EMPTY) {
                continue;
            }
            match psl.get_acquisition_value(det_chan, entry.name) {
                Ok(value) => println!("  {:<32}{value}", entry.name),
                Err(e) => println!("  {:<32}({e})", entry.name),
            }
        }
    }
    Ok(())
}

fn mca_command(psl: &Psl, det_chan: i32, seconds: f64, output: Option<&Path>) -> Result<()> {
    psl.set_acquisition_value(det_chan, "mapping_mode", 0.0)?;
    psl.set_acquisition_value(det_chan, "preset_type", PRESET_FIXED_REAL as f64)?;
    psl.set_acquisition_value(det_chan, "preset_value", seconds)?;
    psl.board_operation(det_chan, "apply", None)?;

    psl.start_run(det_chan)?;
    let deadline = Instant::now() + Duration::from_secs_f64(seconds * 2.0 + 5.0);
    while run_active(psl, det_chan)? {
        if Instant::now() > deadline {
            warn!("run did not end on its own; stopping");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    psl.stop_run(det_chan)?;

    let spectrum = words(psl.get_run_data(det_chan, "mca")?)?;
    let realtime = float(psl.get_run_data(det_chan, "realtime")?)?;
    let livetime = float(psl.get_run_data(det_chan, "livetime")?)?;
    let icr = float(psl.get_run_data(det_chan, "input_count_rate")?)?;
    let ocr = float(psl.get_run_data(det_chan, "output_count_rate")?)?;
    println!(
        "{} bins, {} counts, realtime {realtime:.3} s, livetime {livetime:.3} s, ICR {icr:.1}/s, OCR {ocr:.1}/s",
        spectrum.len(),
        spectrum.iter().map(|&c| c as u64).sum::<u64>()
    );
    if let Some(path) = output {
        let mut out = create(path)?;
        write_words(&mut out, &spectrum)?;
        out.flush()?;
        info!("spectrum written to {}", path.display());
    }
    Ok(())
}

fn map_command(psl: &Psl, det_chan: i32, pixels: u32, per_buffer: u32, output: &Path) -> Result<()> {
    psl.set_acquisition_value(det_chan, "mapping_mode", 1.0)?;
    psl.set_acquisition_value(det_chan, "pixel_advance_mode", 0.0)?;
    psl.set_acquisition_value(det_chan, "num_map_pixels", pixels as f64)?;
    psl.set_acquisition_value(det_chan, "num_map_pixels_per_buffer", per_buffer as f64)?;
    psl.board_operation(det_chan, "apply", None)?;

    let mut out = create(output)?;
    psl.start_run(det_chan)?;
    let mut advanced = 0;
    let mut buffers = 0;
    let deadline = Instant::now() + Duration::from_secs(30 + pixels as u64);
    loop {
        let current = uint(psl.get_run_data(det_chan, "current_pixel")?)?;
        let mut drained = false;
        for id in ['a', 'b'] {
            if bool_of(psl.get_run_data(det_chan, &format!("buffer_full_{id}"))?)? {
                write_words(&mut out, &words(psl.get_run_data(det_chan, &format!("buffer_{id}"))?)?)?;
                psl.board_operation(det_chan, "buffer_done", Some(&id.to_string()))?;
                buffers += 1;
                drained = true;
            }
        }
        if current >= pixels as u64 && !drained {
            break;
        }
        if current == advanced && advanced < pixels as u64 {
            psl.board_operation(det_chan, "mapping_pixel_next", None)?;
            advanced += 1;
        }
        if Instant::now() > deadline {
            warn!("map stalled at pixel {current}");
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    psl.stop_run(det_chan)?;
    out.flush()?;

    let overruns = uint(psl.get_run_data(det_chan, "buffer_overrun")?)?;
    println!("{buffers} buffers written to {}, {overruns} overrun(s)", output.display());
    Ok(())
}

fn trace_command(psl: &Psl, det_chan: i32, samples: u32, output: Option<&Path>) -> Result<()> {
    psl.do_special_run(det_chan, "adc_trace", &[samples as f64])?;
    let trace = words(psl.get_special_run_data(det_chan, "adc_trace")?)?;
    let (lo, hi) = trace
        .iter()
        .fold((u32::MAX, 0), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    println!("{} samples, min {lo}, max {hi}", trace.len());
    if let Some(path) = output {
        let mut out = create(path)?;
        write_words(&mut out, &trace)?;
        out.flush()?;
    }
    Ok(())
}

fn characterize_command(psl: &Psl, det_chan: i32, output: &Path) -> Result<()> {
    psl.do_special_run(det_chan, "detc-start", &[])?;
    let mut last = String::new();
    loop {
        let running = bool_of(psl.get_special_run_data(det_chan, "detc-running")?)?;
        let percentage = float(psl.get_special_run_data(det_chan, "detc-percentage")?)?;
        let stage = psl
            .get_special_run_data(det_chan, "detc-progress-text")?
            .into_text()
            .unwrap_or_default();
        if stage != last {
            info!("{percentage:5.1}% {stage}");
            last = stage;
        }
        if !running {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    if !bool_of(psl.get_special_run_data(det_chan, "detc-successful")?)? {
        bail!("characterization of channel {det_chan} failed");
    }
    psl.save_characterization(det_chan, output)?;
    println!("characterization saved to {}", output.display());
    Ok(())
}

fn run_active(psl: &Psl, det_chan: i32) -> Result<bool> {
    bool_of(psl.get_run_data(det_chan, "run_active")?)
}

fn words(data: RunData) -> Result<Vec<u32>> {
    data.into_words().ok_or_else(|| anyhow!("expected a word array"))
}

fn float(data: RunData) -> Result<f64> {
    data.as_f64().ok_or_else(|| anyhow!("expected a number, got {data:?}"))
}

fn uint(data: RunData) -> Result<u64> {
    Ok(float(data)? as u64)
}

fn bool_of(data: RunData) -> Result<bool> {
    data.as_bool().ok_or_else(|| anyhow!("expected a flag, got {data:?}"))
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn write_words(out: &mut impl Write, words: &[u32]) -> Result<()> {
    for word in words {
        out.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}
