use crate::channel::Features;
use crate::error::{PslError, Result};
use crate::module::Module;
use crate::sinc::{KeyValue, MessageType, ParamDetails, ParamValue, Payload};
use log::{debug, warn};

/// Typed access to one channel's device parameters.
///
/// Every get and every set is one round-trip; nothing is cached locally.
#[derive(Clone, Copy)]
pub struct Params<'a> {
    module: &'a Module,
    channel: i32,
}

impl<'a> Params<'a> {
    pub fn new(module: &'a Module, channel: i32) -> Self {
        Self { module, channel }
    }

    pub fn module(&self) -> &'a Module {
        self.module
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn get(&self, key: &str) -> Result<ParamValue> {
        let reply = self.module.request(
            self.channel,
            Payload::GetParam(vec![key.to_string()]),
            MessageType::GetParamResponse,
        )?;
        let results = match reply {
            Payload::GetParamResponse { results, .. } => results,
            other => {
                return Err(PslError::Protocol(format!(
                    "get '{key}' answered with {:?}",
                    other.message_type()
                )))
            }
        };
        results
            .into_iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value)
            .ok_or_else(|| PslError::Protocol(format!("'{key}' missing from reply")))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        let value = self.get(key)?;
        value
            .as_i64()
            .ok_or_else(|| type_error(key, "an integer", &value))
    }

    pub fn get_float(&self, key: &str) -> Result<f64> {
        let value = self.get(key)?;
        value
            .as_f64()
            .ok_or_else(|| type_error(key, "a number", &value))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.get(key)?;
        value
            .as_bool()
            .ok_or_else(|| type_error(key, "a boolean", &value))
    }

    pub fn get_option(&self, key: &str) -> Result<String> {
        match self.get(key)? {
            ParamValue::Option(s) | ParamValue::Str(s) => Ok(s),
            value => Err(type_error(key, "an option", &value)),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.get(key)? {
            ParamValue::Str(s) | ParamValue::Option(s) => Ok(s),
            value => Ok(value.to_string()),
        }
    }

    pub fn set(&self, key: &str, value: ParamValue) -> Result<()> {
        debug!("channel {}: set {key} = {value}", self.channel);
        self.set_many(vec![KeyValue::new(key, value)])
    }

    /// Write several parameters in one message.
    pub fn set_many(&self, params: Vec<KeyValue>) -> Result<()> {
        self.module
            .command(self.channel, Payload::SetParam(params))
    }

    pub fn list_param_details(&self, prefix: &str) -> Result<Vec<ParamDetails>> {
        let reply = self.module.request(
            self.channel,
            Payload::ListParamDetails {
                prefix: prefix.to_string(),
            },
            MessageType::ListParamDetailsResponse,
        )?;
        match reply {
            Payload::ListParamDetailsResponse { details, .. } => Ok(details),
            other => Err(PslError::Protocol(format!(
                "parameter list answered with {:?}",
                other.message_type()
            ))),
        }
    }

    pub fn discover_features(&self) -> Result<Features> {
        let details = self.list_param_details("")?;
        let features = discover_features(&details);
        if features.sample_rate <= 0.0 {
            return Err(PslError::Protocol(format!(
                "channel {} reports no usable afe.sampleRate",
                self.channel
            )));
        }
        Ok(features)
    }
}

fn type_error(key: &str, wanted: &str, value: &ParamValue) -> PslError {
    PslError::Protocol(format!("'{key}' is not {wanted}: {value}"))
}

/// Derive the channel's capabilities from its parameter list.
pub fn discover_features(details: &[ParamDetails]) -> Features {
    let mut features = Features::default();
    for detail in details {
        match detail.key.as_str() {
            "gate.veto" => features.mca_gate_veto = true,
            "afe.termination" => {
                features.termination_50ohm = detail.options.iter().any(|o| o.contains("50ohm"))
            }
            "afe.attn" => {
                features.attenuation_ground = detail.options.iter().any(|o| o.contains("ground"))
            }
            "pulse.riseTimeParameter" => features.risetime_optimization = true,
            "afe.sampleRate" => match detail.value.as_ref().and_then(ParamValue::as_f64) {
                Some(rate) => features.sample_rate = rate,
                None => warn!("afe.sampleRate has no numeric value"),
            },
            "sca.numRegions" => {
                features.max_scas = detail.max.map(|m| m.max(0.0) as usize).unwrap_or(0)
            }
            _ => {}
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(key: &str, options: &[&str]) -> ParamDetails {
        ParamDetails {
            key: key.into(),
            options: options.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn full_featured_channel() {
        let details = vec![
            detail("gate.veto", &["off", "whenHigh", "whenLow"]),
            detail("afe.termination", &["1kohm", "50ohm"]),
            detail("afe.attn", &["0dB", "-6dB", "ground"]),
            detail("pulse.riseTimeParameter", &[]),
            ParamDetails {
                key: "afe.sampleRate".into(),
                value: Some(ParamValue::Int(250_000_000)),
                ..Default::default()
            },
            ParamDetails {
                key: "sca.numRegions".into(),
                max: Some(16.0),
                ..Default::default()
            },
        ];
        let features = discover_features(&details);
        assert!(features.mca_gate_veto);
        assert!(features.termination_50ohm);
        assert!(features.attenuation_ground);
        assert!(features.risetime_optimization);
        assert_eq!(features.sample_rate, 250e6);
        assert_eq!(features.max_scas, 16);
    }

    #[test]
    fn minimal_channel() {
        let details = vec![
            detail("afe.termination", &["1kohm"]),
            detail("afe.attn", &["0dB", "-6dB", "-12dB"]),
        ];
        let features = discover_features(&details);
        assert!(!features.mca_gate_veto);
        assert!(!features.termination_50ohm);
        assert!(!features.attenuation_ground);
        assert!(!features.risetime_optimization);
        assert_eq!(features.max_scas, 0);
    }
}
