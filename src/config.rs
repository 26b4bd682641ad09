use crate::module::{ChannelSpec, Timeouts};
use crate::transport::DEFAULT_PORT;
use confique::Config;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub logging: LoggingSettings,
    #[config(nested)]
    pub timeouts: TimeoutSettings,
    /// Where acquisition values are persisted between sessions.
    #[config(default = "falconxn-defaults.toml")]
    pub defaults_file: PathBuf,
    #[config(default = [])]
    pub modules: Vec<ModuleSettings>,
}

#[derive(Config, Debug, Clone)]
pub struct LoggingSettings {
    #[config(default = "info")]
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Config, Debug, Clone)]
pub struct TimeoutSettings {
    #[config(default = 10000)]
    pub request_ms: u64,
    #[config(default = 10000)]
    pub channel_state_ms: u64,
    #[config(default = 10000)]
    pub adc_trace_ms: u64,
}

impl TimeoutSettings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            request: Duration::from_millis(self.request_ms),
            channel_state: Duration::from_millis(self.channel_state_ms),
            adc_trace: Duration::from_millis(self.adc_trace_ms),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleSettings {
    pub alias: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect timeout; the request timeout is used when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub channels: Vec<ChannelSettings>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ModuleSettings {
    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.channels
            .iter()
            .map(|c| ChannelSpec {
                det_chan: c.det_chan,
                alias: c.alias.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub det_chan: i32,
    pub alias: String,
    /// 1 for positive-going pulses, 0 for negative. Read from the device when absent.
    #[serde(default)]
    pub detector_polarity: Option<i64>,
    #[serde(default)]
    pub firmware: Option<FirmwareSettings>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FirmwareSettings {
    pub alias: String,
    /// Characterization file restored at setup; "null" means none.
    #[serde(default)]
    pub characterization: Option<String>,
}

impl FirmwareSettings {
    pub fn characterization_path(&self) -> Option<PathBuf> {
        self.characterization
            .as_deref()
            .filter(|name| !name.is_empty() && *name != "null")
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_module_with_two_channels() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
defaults_file = "run.toml"

[logging]
level = "debug"

[timeouts]
request_ms = 2500

[[modules]]
alias = "falcon0"
host = "10.0.0.42"

[[modules.channels]]
det_chan = 0
alias = "det0"
detector_polarity = 1
firmware = {{ alias = "fw0", characterization = "det0.chr" }}

[[modules.channels]]
det_chan = 1
alias = "det1"
firmware = {{ alias = "fw1", characterization = "null" }}
"#
        )
        .unwrap();
        let conf = Conf::builder().file(file.path()).load().unwrap();
        assert_eq!(conf.logging.level, "debug");
        assert_eq!(conf.timeouts.timeouts().request, Duration::from_millis(2500));
        assert_eq!(conf.timeouts.adc_trace_ms, 10000);
        assert_eq!(conf.defaults_file, PathBuf::from("run.toml"));

        let module = &conf.modules[0];
        assert_eq!(module.port, DEFAULT_PORT);
        assert_eq!(module.channel_specs()[1].alias, "det1");
        let fw0 = module.channels[0].firmware.as_ref().unwrap();
        assert_eq!(fw0.characterization_path(), Some(PathBuf::from("det0.chr")));
        let fw1 = module.channels[1].firmware.as_ref().unwrap();
        assert_eq!(fw1.characterization_path(), None);
        assert_eq!(module.channels[1].detector_polarity, None);
    }
}
