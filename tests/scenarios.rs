use falconxn::acq_values::{PRESET_FIXED_REAL, SCALE_MAX};
use falconxn::mapping::mm0::STATS_WORDS;
use falconxn::run_data::sca_sums;
use falconxn::characterization;
use falconxn::sinc::{CalibrationData, ParamValue, Waveform};
use falconxn::{
    BoardData, CalibrationState, ChannelSettings, ChannelState, DefaultsStore, FirmwareSettings,
    ModuleSettings, Psl, PslError, RunData, SimOptions, SimServer, Timeouts,
};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

fn timeouts() -> Timeouts {
    Timeouts {
        request: Duration::from_secs(5),
        channel_state: Duration::from_secs(5),
        adc_trace: Duration::from_secs(5),
    }
}

fn module_settings(sim: &SimServer, alias: &str, characterization: Option<&Path>) -> ModuleSettings {
    ModuleSettings {
        alias: alias.into(),
        host: sim.host(),
        port: sim.port(),
        timeout_ms: Some(5000),
        channels: vec![ChannelSettings {
            det_chan: 0,
            alias: format!("{alias}-det0"),
            detector_polarity: None,
            firmware: Some(FirmwareSettings {
                alias: "fw0".into(),
                characterization: characterization.map(|p| p.display().to_string()),
            }),
        }],
    }
}

fn rig(options: SimOptions) -> (SimServer, Psl) {
    let sim = SimServer::start(options).unwrap();
    let mut psl = Psl::new(timeouts());
    psl.setup_module(module_settings(&sim, "falcon0", None)).unwrap();
    (sim, psl)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn run_active(psl: &Psl) -> bool {
    psl.get_run_data(0, "run_active").unwrap().as_bool().unwrap()
}

fn acquire_fixed_real(psl: &Psl, seconds: f64) {
    psl.set_acquisition_value(0, "preset_type", PRESET_FIXED_REAL as f64)
        .unwrap();
    psl.set_acquisition_value(0, "preset_value", seconds).unwrap();
    psl.start_run(0).unwrap();
    wait_until("the preset run to end", || !run_active(psl));
    psl.stop_run(0).unwrap();
}

#[test]
fn connect_setup_ping_teardown() {
    let (_sim, mut psl) = rig(SimOptions::default());
    assert_eq!(
        psl.board_operation(0, "get_connected", None).unwrap(),
        BoardData::Bool(true)
    );
    assert_eq!(
        psl.board_operation(0, "get_channel_count", None).unwrap(),
        BoardData::UInt(1)
    );
    assert_eq!(
        psl.board_operation(0, "get_serial_number", None).unwrap(),
        BoardData::Text("SIM0042".into())
    );
    let module = psl.module("falcon0").unwrap();
    assert!(module.is_connected());

    psl.end_module("falcon0").unwrap();
    assert!(matches!(
        psl.board_operation(0, "get_connected", None),
        Err(PslError::UnknownChannel(0))
    ));
    assert!(psl.det_chans().is_empty());
}

#[test]
fn duplicate_module_alias_is_rejected() {
    let (sim, mut psl) = rig(SimOptions::default());
    let again = module_settings(&sim, "falcon0", None);
    assert!(matches!(
        psl.setup_module(again),
        Err(PslError::BadArgument(_))
    ));
}

#[test]
fn gain_is_coerced_and_range_checked() {
    let (sim, psl) = rig(SimOptions::default());
    let gain = psl.set_acquisition_value(0, "analog_gain", 4.0).unwrap();
    assert!((gain - 4.0).abs() < 1e-3);
    let read = psl.get_acquisition_value(0, "analog_gain").unwrap();
    assert!((read - 4.0).abs() < 1e-3);
    let dac = sim.param(0, "afe.dacGain").unwrap().as_f64().unwrap();
    assert!((dac - (409.6 + 8.0 * 409.6 * 0.5)).abs() < 1e-6);

    assert!(matches!(
        psl.set_acquisition_value(0, "analog_gain", 20.0),
        Err(PslError::OutOfRange { .. })
    ));
    let kept = psl.defaults("falcon0-det0").unwrap().unwrap();
    assert!((kept.get("analog_gain").unwrap() - 4.0).abs() < 1e-3);
}

#[test]
fn termination_follows_the_feature() {
    let (_sim, psl) = rig(SimOptions {
        termination_50ohm: false,
        ..Default::default()
    });
    assert!(matches!(
        psl.set_acquisition_value(0, "termination", 1.0),
        Err(PslError::OutOfRange { .. })
    ));
    assert_eq!(psl.set_acquisition_value(0, "termination", 0.0).unwrap(), 0.0);
    assert_eq!(psl.get_acquisition_value(0, "termination").unwrap(), 0.0);

    let (sim, psl) = rig(SimOptions::default());
    assert_eq!(psl.set_acquisition_value(0, "termination", 1.0).unwrap(), 1.0);
    assert_eq!(
        sim.param(0, "afe.termination"),
        Some(ParamValue::Option("50ohm".into()))
    );
    assert!(matches!(
        psl.set_acquisition_value(0, "termination", 2.0),
        Err(PslError::OutOfRange { .. })
    ));
}

#[test]
fn polarity_drives_the_invert_flag() {
    let (sim, psl) = rig(SimOptions::default());
    assert_eq!(psl.get_acquisition_value(0, "detector_polarity").unwrap(), 1.0);
    assert_eq!(sim.param(0, "afe.invert"), Some(ParamValue::Bool(false)));

    assert_eq!(psl.set_acquisition_value(0, "detector_polarity", 0.0).unwrap(), 0.0);
    assert_eq!(sim.param(0, "afe.invert"), Some(ParamValue::Bool(true)));
    assert_eq!(psl.get_acquisition_value(0, "detector_polarity").unwrap(), 0.0);
    assert_eq!(psl.channel(0).unwrap().lock().unwrap().detector_polarity, 0);

    psl.set_acquisition_value(0, "detector_polarity", 1.0).unwrap();
    assert_eq!(sim.param(0, "afe.invert"), Some(ParamValue::Bool(false)));
    assert!(psl.set_acquisition_value(0, "detector_polarity", 2.0).is_err());
}

#[test]
fn third_attenuation_depends_on_the_feature() {
    let (sim, psl) = rig(SimOptions::default());
    assert_eq!(psl.set_acquisition_value(0, "attenuation", 2.0).unwrap(), 2.0);
    assert_eq!(
        sim.param(0, "afe.attn"),
        Some(ParamValue::Option("ground".into()))
    );

    let (sim, psl) = rig(SimOptions {
        attenuation_ground: false,
        ..Default::default()
    });
    assert_eq!(psl.set_acquisition_value(0, "attenuation", 2.0).unwrap(), 2.0);
    assert_eq!(
        sim.param(0, "afe.attn"),
        Some(ParamValue::Option("-12dB".into()))
    );
    assert_eq!(psl.get_acquisition_value(0, "attenuation").unwrap(), 2.0);
    psl.set_acquisition_value(0, "attenuation", 1.0).unwrap();
    assert_eq!(
        sim.param(0, "afe.attn"),
        Some(ParamValue::Option("-6dB".into()))
    );
    assert!(matches!(
        psl.set_acquisition_value(0, "attenuation", 3.0),
        Err(PslError::OutOfRange { .. })
    ));
}

#[test]
fn analog_offset_is_stored_from_the_minimum() {
    let (sim, psl) = rig(SimOptions::default());
    assert_eq!(psl.get_acquisition_value(0, "analog_offset").unwrap(), 0.0);

    assert_eq!(psl.set_acquisition_value(0, "analog_offset", -1000.0).unwrap(), -1000.0);
    assert_eq!(sim.param(0, "afe.dacOffset"), Some(ParamValue::Int(31768)));
    assert_eq!(psl.get_acquisition_value(0, "analog_offset").unwrap(), -1000.0);

    psl.set_acquisition_value(0, "analog_offset", -32768.0).unwrap();
    assert_eq!(sim.param(0, "afe.dacOffset"), Some(ParamValue::Int(0)));
    psl.set_acquisition_value(0, "analog_offset", 32767.0).unwrap();
    assert_eq!(sim.param(0, "afe.dacOffset"), Some(ParamValue::Int(65535)));

    assert!(matches!(
        psl.set_acquisition_value(0, "analog_offset", 32768.0),
        Err(PslError::OutOfRange { .. })
    ));
    assert_eq!(sim.param(0, "afe.dacOffset"), Some(ParamValue::Int(65535)));
}

#[test]
fn decay_time_and_detection_filter_select_options() {
    let (sim, psl) = rig(SimOptions::default());
    assert_eq!(psl.set_acquisition_value(0, "decay_time", 2.0).unwrap(), 2.0);
    assert_eq!(
        sim.param(0, "afe.decayTime"),
        Some(ParamValue::Option("short".into()))
    );
    assert_eq!(psl.get_acquisition_value(0, "decay_time").unwrap(), 2.0);
    assert!(psl.set_acquisition_value(0, "decay_time", 4.0).is_err());

    assert_eq!(psl.set_acquisition_value(0, "detection_filter", 0.0).unwrap(), 0.0);
    assert_eq!(
        sim.param(0, "pulse.sourceType"),
        Some(ParamValue::Option("lowEnergy".into()))
    );
    psl.set_acquisition_value(0, "detection_filter", 4.0).unwrap();
    assert_eq!(
        sim.param(0, "pulse.sourceType"),
        Some(ParamValue::Option("maxThroughput".into()))
    );
    assert_eq!(psl.get_acquisition_value(0, "detection_filter").unwrap(), 4.0);
    assert!(matches!(
        psl.set_acquisition_value(0, "detection_filter", 5.0),
        Err(PslError::OutOfRange { .. })
    ));
}

#[test]
fn fewer_scas_clear_the_dropped_regions() {
    let (sim, psl) = rig(SimOptions::default());
    psl.set_acquisition_value(0, "number_of_scas", 3.0).unwrap();
    for i in 0..3 {
        psl.set_acquisition_value(0, &format!("sca{i}_lo"), 100.0 * (i + 1) as f64)
            .unwrap();
        psl.set_acquisition_value(0, &format!("sca{i}_hi"), 100.0 * (i + 1) as f64 + 50.0)
            .unwrap();
    }
    assert_eq!(sim.param(0, "sca.region_03.endBin"), Some(ParamValue::Int(350)));

    assert_eq!(psl.set_acquisition_value(0, "number_of_scas", 1.0).unwrap(), 1.0);
    assert_eq!(sim.param(0, "sca.numRegions"), Some(ParamValue::Int(1)));
    assert_eq!(sim.param(0, "sca.region_01.startBin"), Some(ParamValue::Int(100)));
    assert_eq!(sim.param(0, "sca.region_01.endBin"), Some(ParamValue::Int(150)));
    for region in ["02", "03"] {
        for field in ["startBin", "endBin"] {
            assert_eq!(
                sim.param(0, &format!("sca.region_{region}.{field}")),
                Some(ParamValue::Int(0))
            );
        }
    }
    assert!(matches!(
        psl.get_acquisition_value(0, "sca1_lo"),
        Err(PslError::OutOfRange { .. })
    ));
    assert!(psl.set_acquisition_value(0, "number_of_scas", 17.0).is_err());
}

#[test]
fn pixels_per_buffer_resolves_to_the_maximum() {
    let (_sim, psl) = rig(SimOptions::default());
    for stored in [0.0, -1.0] {
        assert_eq!(
            psl.set_acquisition_value(0, "num_map_pixels_per_buffer", stored)
                .unwrap(),
            1024.0
        );
        assert_eq!(
            psl.get_acquisition_value(0, "num_map_pixels_per_buffer")
                .unwrap(),
            1024.0
        );
    }
    assert_eq!(
        psl.set_acquisition_value(0, "num_map_pixels_per_buffer", 5000.0)
            .unwrap(),
        1024.0
    );
    assert_eq!(
        psl.set_acquisition_value(0, "num_map_pixels_per_buffer", 64.0)
            .unwrap(),
        64.0
    );
    assert!(psl
        .set_acquisition_value(0, "num_map_pixels_per_buffer", -2.0)
        .is_err());
}

#[test]
fn bin_region_tracks_mca_channels() {
    let (sim, psl) = rig(SimOptions::default());
    let region = |sim: &SimServer| {
        let low = sim
            .param(0, "histogram.binning.binSubRegion.lowIndex")
            .and_then(|v| v.as_i64())
            .unwrap();
        let high = sim
            .param(0, "histogram.binning.binSubRegion.highIndex")
            .and_then(|v| v.as_i64())
            .unwrap();
        (low, high)
    };

    psl.set_acquisition_value(0, "number_mca_channels", 2048.0).unwrap();
    assert_eq!(region(&sim), (0, 2047));
    psl.set_acquisition_value(0, "mca_start_channel", 100.0).unwrap();
    let (low, high) = region(&sim);
    assert_eq!(low, 100);
    assert_eq!(high - low + 1, 2048);

    assert!(psl.set_acquisition_value(0, "mca_start_channel", 3000.0).is_err());
    assert_eq!(region(&sim).0, 100);
}

#[test]
fn scale_factor_splits_into_coarse_and_fine() {
    let (sim, psl) = rig(SimOptions::default());
    for s in [1.0, 6.0, 37.5, SCALE_MAX] {
        let read = psl.set_acquisition_value(0, "scale_factor", s).unwrap();
        assert!((read - s).abs() / s < 1e-9, "{s} read back as {read}");
        let coarse = sim
            .param(0, "histogram.binning.coarseBinScaling")
            .and_then(|v| v.as_i64())
            .unwrap();
        assert!([2, 4, 8, 16, 32, 64, 128].contains(&coarse));
    }
    assert!(psl.set_acquisition_value(0, "scale_factor", 0.5).is_err());
}

#[test]
fn apply_reports_inconsistent_parameters() {
    let (sim, psl) = rig(SimOptions::default());
    psl.board_operation(0, "apply", None).unwrap();

    sim.set_inconsistent("afe.dacGain", "gain exceeds the AFE range");
    match psl.board_operation(0, "apply", None) {
        Err(PslError::Inconsistent(message)) => assert!(message.contains("afe.dacGain")),
        other => panic!("expected an inconsistency, got {other:?}"),
    }
    sim.clear_inconsistent();
    psl.board_operation(0, "apply", None).unwrap();
}

#[test]
fn unknown_and_deprecated_names_are_rejected() {
    let (_sim, psl) = rig(SimOptions::default());
    assert!(matches!(
        psl.set_acquisition_value(0, "flux_capacitance", 1.0),
        Err(PslError::UnknownValue(_))
    ));
    assert!(matches!(
        psl.set_acquisition_value(0, "mca_end_channel", 1.0),
        Err(PslError::DeprecatedValue(_))
    ));
    assert!(matches!(
        psl.get_run_data(0, "buffer_a"),
        Err(PslError::UnknownRunData { mode: 0, .. })
    ));
}

#[test]
fn mca_acquire_full_spectrum() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.set_acquisition_value(0, "number_mca_channels", 4096.0).unwrap();
    acquire_fixed_real(&psl, 1.0);

    let length = psl.get_run_data(0, "mca_length").unwrap();
    assert_eq!(length, RunData::UInt(4096 + STATS_WORDS as u64));
    let words = psl.get_run_data(0, "mca").unwrap().into_words().unwrap();
    assert_eq!(words.len(), 4096 + STATS_WORDS);
    assert!(words[..4096].iter().any(|&c| c > 0));

    let realtime = psl.get_run_data(0, "realtime").unwrap().as_f64().unwrap();
    assert!(realtime >= 1.0 - 1e-9);
    assert!(psl.get_run_data(0, "input_count_rate").unwrap().as_f64().unwrap() > 0.0);

    assert!(matches!(
        psl.get_run_data(0, "mca"),
        Err(PslError::NoSpectrum)
    ));
}

#[test]
fn start_run_twice_fails_and_stops() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.start_run(0).unwrap();
    assert!(run_active(&psl));
    assert!(matches!(psl.start_run(0), Err(PslError::InvalidState(_))));
    assert!(!run_active(&psl));
}

#[test]
fn mapping_user_advance_hundred_pixels() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.set_acquisition_value(0, "mapping_mode", 1.0).unwrap();
    psl.set_acquisition_value(0, "pixel_advance_mode", 0.0).unwrap();
    psl.set_acquisition_value(0, "num_map_pixels", 100.0).unwrap();
    psl.set_acquisition_value(0, "num_map_pixels_per_buffer", 25.0).unwrap();
    psl.start_run(0).unwrap();

    let pixels = |psl: &Psl| psl.get_run_data(0, "current_pixel").unwrap().as_f64().unwrap() as u64;
    let mut advanced = 0;
    let mut drained_pixels = 0;
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let current = pixels(&psl);
        let mut drained = false;
        for id in ['a', 'b'] {
            let full = psl
                .get_run_data(0, &format!("buffer_full_{id}"))
                .unwrap()
                .as_bool()
                .unwrap();
            if full {
                let buffer = psl
                    .get_run_data(0, &format!("buffer_{id}"))
                    .unwrap()
                    .into_words()
                    .unwrap();
                assert_eq!(&buffer[..2], &[0x55AA, 0xAA55]);
                drained_pixels += buffer[8] as u64;
                psl.board_operation(0, "buffer_done", Some(&id.to_string()))
                    .unwrap();
                drained = true;
            }
        }
        if current >= 100 && !drained {
            break;
        }
        if current == advanced && advanced < 100 {
            psl.board_operation(0, "mapping_pixel_next", None).unwrap();
            advanced += 1;
        }
        assert!(Instant::now() < deadline, "stuck at pixel {current}");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(pixels(&psl), 100);
    assert_eq!(drained_pixels, 100);
    assert!(!run_active(&psl));
    assert_eq!(
        psl.get_run_data(0, "buffer_overrun").unwrap().as_f64(),
        Some(0.0)
    );
    psl.stop_run(0).unwrap();
}

#[test]
fn adc_trace_returns_requested_samples() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.do_special_run(0, "adc_trace", &[2048.0]).unwrap();
    assert_eq!(
        psl.get_special_run_data(0, "adc_trace_length").unwrap(),
        RunData::UInt(2048)
    );
    let trace = psl
        .get_special_run_data(0, "adc_trace")
        .unwrap()
        .into_words()
        .unwrap();
    assert_eq!(trace.len(), 2048);
    assert!(matches!(
        psl.do_special_run(0, "adc_trace", &[0.0]),
        Err(PslError::OutOfRange { .. })
    ));
}

#[test]
fn characterization_save_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("det0.chr");
    {
        let (_sim, mut psl) = rig(SimOptions::default());
        assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::None);
        psl.do_special_run(0, "detc-start", &[]).unwrap();
        wait_until("characterization to finish", || {
            !psl.get_special_run_data(0, "detc-running")
                .unwrap()
                .as_bool()
                .unwrap()
        });
        let percentage = psl.get_special_run_data(0, "detc-percentage").unwrap();
        assert_eq!(percentage.as_f64(), Some(100.0));
        assert_eq!(
            psl.get_special_run_data(0, "detc-successful").unwrap(),
            RunData::Bool(true)
        );

        let text = psl
            .get_special_run_data(0, "detc-string")
            .unwrap()
            .into_text()
            .unwrap();
        let size = psl.get_special_run_data(0, "detc-string-size").unwrap();
        assert_eq!(size, RunData::UInt(text.len() as u64));
        std::fs::write(&path, &text).unwrap();
        psl.end_module("falcon0").unwrap();
    }

    let sim = SimServer::start(SimOptions::default()).unwrap();
    assert!(!sim.is_calibrated(0));
    let mut psl = Psl::new(timeouts());
    psl.setup_module(module_settings(&sim, "falcon0", Some(&path)))
        .unwrap();
    assert!(sim.is_calibrated(0));
    assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::Ready);
    let points = psl
        .get_special_run_data(0, "detc-model-pulse-size")
        .unwrap();
    assert_eq!(points, RunData::UInt(64));
}

#[test]
fn sca_sums_match_the_spectrum() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.set_acquisition_value(0, "number_mca_channels", 4096.0).unwrap();
    psl.set_acquisition_value(0, "number_of_scas", 3.0).unwrap();
    let regions = [(100, 500), (1200, 1300), (2400, 4000)];
    for (i, (lo, hi)) in regions.iter().enumerate() {
        psl.set_acquisition_value(0, &format!("sca{i}_lo"), *lo as f64)
            .unwrap();
        psl.set_acquisition_value(0, &format!("sca{i}_hi"), *hi as f64)
            .unwrap();
    }
    assert_eq!(
        psl.get_run_data(0, "sca_length").unwrap(),
        RunData::UInt(3)
    );
    acquire_fixed_real(&psl, 0.5);

    let sums = psl.get_run_data(0, "sca").unwrap().into_floats().unwrap();
    let words = psl.get_run_data(0, "mca").unwrap().into_words().unwrap();
    assert_eq!(sums, sca_sums(&words[..4096], &regions));
    assert!(sums.iter().all(|&s| s > 0.0));
}

fn characterize(psl: &Psl) {
    psl.do_special_run(0, "detc-start", &[]).unwrap();
    wait_until("characterization to finish", || {
        !psl.get_special_run_data(0, "detc-running")
            .unwrap()
            .as_bool()
            .unwrap()
    });
    assert_eq!(
        psl.get_special_run_data(0, "detc-successful").unwrap(),
        RunData::Bool(true)
    );
}

#[test]
fn characterization_travels_with_the_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaults.toml");
    let model_y = {
        let (_sim, mut psl) = rig(SimOptions::default());
        characterize(&psl);
        psl.save_defaults_to(&path).unwrap();
        let y = psl
            .get_special_run_data(0, "detc-model-pulse-y")
            .unwrap()
            .into_floats()
            .unwrap();
        psl.end_module("falcon0").unwrap();
        y
    };

    let store = DefaultsStore::load(&path).unwrap();
    let text = store
        .section("falcon0-det0")
        .and_then(|d| d.characterization.clone())
        .expect("characterization saved with the defaults");
    let saved = characterization::from_text(&text).unwrap();
    assert!(characterization::is_sane(&saved));
    assert_eq!(saved.model.y, model_y);

    let sim = SimServer::start(SimOptions::default()).unwrap();
    let mut psl = Psl::with_defaults_file(timeouts(), &path).unwrap();
    psl.setup_module(module_settings(&sim, "falcon0", None)).unwrap();
    assert!(sim.is_calibrated(0));
    assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::Ready);
    assert_eq!(
        psl.get_special_run_data(0, "detc-model-pulse-y").unwrap(),
        RunData::Floats(model_y)
    );
}

#[test]
fn uncharacterized_channels_save_no_characterization() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaults.toml");
    let (_sim, psl) = rig(SimOptions::default());
    psl.save_defaults_to(&path).unwrap();
    let store = DefaultsStore::load(&path).unwrap();
    let section = store.section("falcon0-det0").unwrap();
    assert_eq!(section.characterization, None);
    assert_eq!(section.get("number_mca_channels"), Some(4096.0));
}

#[test]
fn quick_characterization_still_completes() {
    let (_sim, psl) = rig(SimOptions {
        frame_interval: Duration::ZERO,
        ..Default::default()
    });
    for _ in 0..5 {
        characterize(&psl);
        assert_eq!(psl.channel(0).unwrap().state().unwrap(), ChannelState::Ready);
        assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::Ready);
    }
}

#[test]
fn insane_device_calibration_is_rejected() {
    let sim = SimServer::start(SimOptions::default()).unwrap();
    let wave = |n: usize| Waveform {
        x: (0..n).map(|i| i as f64).collect(),
        y: vec![0.5; n],
    };
    let mut bad = CalibrationData {
        data: vec![1, 2, 3],
        example: wave(8),
        model: wave(8),
        final_pulse: wave(8),
    };
    bad.model.y[4] = 250.0;
    sim.set_calibration(0, bad);

    let mut psl = Psl::new(timeouts());
    psl.setup_module(module_settings(&sim, "falcon0", None)).unwrap();
    assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::NeedRefresh);
    assert!(matches!(
        psl.get_special_run_data(0, "detc-successful"),
        Err(PslError::BadCharacterization(_))
    ));
    assert_eq!(psl.calibration_state(0).unwrap(), CalibrationState::None);
    assert_eq!(
        psl.get_special_run_data(0, "detc-successful").unwrap(),
        RunData::Bool(false)
    );
    assert!(matches!(
        psl.get_special_run_data(0, "detc-string"),
        Err(PslError::NoCalibration)
    ));
}

#[test]
fn refused_characterization_leaves_the_run_alone() {
    let (_sim, psl) = rig(SimOptions::default());
    psl.start_run(0).unwrap();
    let before = psl.calibration_state(0).unwrap();
    assert!(psl.do_special_run(0, "detc-start", &[]).is_err());
    assert_eq!(
        psl.channel(0).unwrap().state().unwrap(),
        ChannelState::Histogram
    );
    assert_eq!(psl.calibration_state(0).unwrap(), before);
    assert_eq!(
        psl.get_special_run_data(0, "detc-running").unwrap(),
        RunData::Bool(false)
    );
    psl.stop_run(0).unwrap();
}
