//! SINC wire codec.
//!
//! A frame on the wire is
//!
//! ```text
//! | u32 LE length | u8 message type | i32 LE channel | payload ... |
//! ```
//!
//! where `length` counts every byte after the length field. The payload is the
//! JSON encoding of the per-type structure below; requests without arguments
//! carry an empty payload.

use crate::error::{PslError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

pub const LENGTH_PREFIX: usize = 4;
/// Bytes in the type byte plus channel id that follow the length prefix.
pub const FRAME_HEADER: usize = 5;
/// Longest frame body accepted from the wire.
pub const MAX_FRAME_LEN: usize = 16 << 20;
/// Channel id used for module-level messages.
pub const MODULE_CHANNEL: i32 = -1;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MessageType {
    Ping = 1,
    GetParam = 2,
    SetParam = 3,
    StartCalibration = 4,
    GetCalibration = 5,
    SetCalibration = 6,
    CalculateDcOffset = 7,
    StartOscilloscope = 8,
    StartHistogram = 9,
    StartListMode = 10,
    StopDataAcquisition = 11,
    ListParamDetails = 12,
    CheckParamConsistency = 13,
    Success = 100,
    GetParamResponse = 101,
    GetCalibrationResponse = 102,
    CalculateDcOffsetResponse = 103,
    ListParamDetailsResponse = 104,
    CheckParamConsistencyResponse = 105,
    ParamUpdated = 106,
    CalibrationProgress = 107,
    OscilloscopeData = 108,
    HistogramData = 109,
    AsyncError = 110,
}

impl TryFrom<u8> for MessageType {
    type Error = PslError;

    fn try_from(value: u8) -> Result<Self> {
        let kind = match value {
            1 => Self::Ping,
            2 => Self::GetParam,
            3 => Self::SetParam,
            4 => Self::StartCalibration,
            5 => Self::GetCalibration,
            6 => Self::SetCalibration,
            7 => Self::CalculateDcOffset,
            8 => Self::StartOscilloscope,
            9 => Self::StartHistogram,
            10 => Self::StartListMode,
            11 => Self::StopDataAcquisition,
            12 => Self::ListParamDetails,
            13 => Self::CheckParamConsistency,
            100 => Self::Success,
            101 => Self::GetParamResponse,
            102 => Self::GetCalibrationResponse,
            103 => Self::CalculateDcOffsetResponse,
            104 => Self::ListParamDetailsResponse,
            105 => Self::CheckParamConsistencyResponse,
            106 => Self::ParamUpdated,
            107 => Self::CalibrationProgress,
            108 => Self::OscilloscopeData,
            109 => Self::HistogramData,
            110 => Self::AsyncError,
            other => return Err(PslError::Decode(format!("unknown message type {other}"))),
        };
        Ok(kind)
    }
}

impl MessageType {
    /// Replies that answer a command and are handed to the waiting sender.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::GetParamResponse
                | Self::GetCalibrationResponse
                | Self::CalculateDcOffsetResponse
                | Self::ListParamDetailsResponse
                | Self::CheckParamConsistencyResponse
        )
    }

    pub fn is_request(self) -> bool {
        (self as u8) < 100
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Option(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(v.round() as i64),
            Self::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Option(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(s) | Self::Option(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: ParamValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: ParamValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Metadata for one device parameter as reported by `LIST_PARAM_DETAILS`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamDetails {
    pub key: String,
    #[serde(default)]
    pub value: Option<ParamValue>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Pulse-shape calibration as carried by `GET_CALIBRATION`/`SET_CALIBRATION`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub data: Vec<u8>,
    pub example: Waveform,
    pub model: Waveform,
    #[serde(rename = "final")]
    pub final_pulse: Waveform,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub time_elapsed: f64,
    pub samples_detected: u64,
    pub samples_erased: u64,
    pub pulses_accepted: u64,
    pub pulses_rejected: u64,
    pub input_count_rate: f64,
    pub output_count_rate: f64,
    pub dead_time: f64,
    #[serde(default)]
    pub gate_state: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramData {
    #[serde(default)]
    pub accepted: Vec<u32>,
    #[serde(default)]
    pub rejected: Vec<u32>,
    pub stats: HistogramStats,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OscilloscopeData {
    pub samples: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProgress {
    pub progress: f64,
    pub complete: bool,
    pub stage: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub healthy: bool,
    #[serde(default)]
    pub bad_key: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Ping,
    GetParam(Vec<String>),
    SetParam(Vec<KeyValue>),
    StartCalibration,
    GetCalibration,
    SetCalibration(CalibrationData),
    CalculateDcOffset,
    StartOscilloscope,
    StartHistogram,
    StartListMode,
    StopDataAcquisition { skip: bool },
    ListParamDetails { prefix: String },
    CheckParamConsistency,
    Success(Status),
    GetParamResponse { status: Status, results: Vec<KeyValue> },
    GetCalibrationResponse { status: Status, calibration: CalibrationData },
    CalculateDcOffsetResponse { status: Status, dc_offset: f64 },
    ListParamDetailsResponse { status: Status, details: Vec<ParamDetails> },
    CheckParamConsistencyResponse(ConsistencyReport),
    ParamUpdated(Vec<KeyValue>),
    CalibrationProgress(CalibrationProgress),
    OscilloscopeData(OscilloscopeData),
    HistogramData(HistogramData),
    AsyncError(Status),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::GetParam(_) => MessageType::GetParam,
            Self::SetParam(_) => MessageType::SetParam,
            Self::StartCalibration => MessageType::StartCalibration,
            Self::GetCalibration => MessageType::GetCalibration,
            Self::SetCalibration(_) => MessageType::SetCalibration,
            Self::CalculateDcOffset => MessageType::CalculateDcOffset,
            Self::StartOscilloscope => MessageType::StartOscilloscope,
            Self::StartHistogram => MessageType::StartHistogram,
            Self::StartListMode => MessageType::StartListMode,
            Self::StopDataAcquisition { .. } => MessageType::StopDataAcquisition,
            Self::ListParamDetails { .. } => MessageType::ListParamDetails,
            Self::CheckParamConsistency => MessageType::CheckParamConsistency,
            Self::Success(_) => MessageType::Success,
            Self::GetParamResponse { .. } => MessageType::GetParamResponse,
            Self::GetCalibrationResponse { .. } => MessageType::GetCalibrationResponse,
            Self::CalculateDcOffsetResponse { .. } => MessageType::CalculateDcOffsetResponse,
            Self::ListParamDetailsResponse { .. } => MessageType::ListParamDetailsResponse,
            Self::CheckParamConsistencyResponse(_) => MessageType::CheckParamConsistencyResponse,
            Self::ParamUpdated(_) => MessageType::ParamUpdated,
            Self::CalibrationProgress(_) => MessageType::CalibrationProgress,
            Self::OscilloscopeData(_) => MessageType::OscilloscopeData,
            Self::HistogramData(_) => MessageType::HistogramData,
            Self::AsyncError(_) => MessageType::AsyncError,
        }
    }

    /// Device status carried by a reply, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Success(status)
            | Self::GetParamResponse { status, .. }
            | Self::GetCalibrationResponse { status, .. }
            | Self::CalculateDcOffsetResponse { status, .. }
            | Self::ListParamDetailsResponse { status, .. } => Some(status),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub channel: i32,
    pub payload: Payload,
}

impl Message {
    pub fn new(channel: i32, payload: Payload) -> Self {
        Self { channel, payload }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

// Wire shapes for payloads that are not a single struct.

#[derive(Serialize, Deserialize)]
struct Keys {
    keys: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Params {
    params: Vec<KeyValue>,
}

#[derive(Serialize, Deserialize)]
struct Stop {
    skip: bool,
}

#[derive(Serialize, Deserialize)]
struct Prefix {
    prefix: String,
}

#[derive(Serialize, Deserialize)]
struct ParamResults {
    #[serde(flatten)]
    status: Status,
    results: Vec<KeyValue>,
}

#[derive(Serialize, Deserialize)]
struct CalibrationReply {
    #[serde(flatten)]
    status: Status,
    calibration: CalibrationData,
}

#[derive(Serialize, Deserialize)]
struct DcOffsetReply {
    #[serde(flatten)]
    status: Status,
    dc_offset: f64,
}

#[derive(Serialize, Deserialize)]
struct DetailsReply {
    #[serde(flatten)]
    status: Status,
    details: Vec<ParamDetails>,
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PslError::Encode(e.to_string()))
}

fn from_json<T: DeserializeOwned>(kind: MessageType, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| PslError::Decode(format!("{kind:?}: {e}")))
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Ping
        | Payload::StartCalibration
        | Payload::GetCalibration
        | Payload::CalculateDcOffset
        | Payload::StartOscilloscope
        | Payload::StartHistogram
        | Payload::StartListMode
        | Payload::CheckParamConsistency => Ok(Vec::new()),
        Payload::GetParam(keys) => to_json(&Keys { keys: keys.clone() }),
        Payload::SetParam(params) | Payload::ParamUpdated(params) => to_json(&Params {
            params: params.clone(),
        }),
        Payload::SetCalibration(calibration) => to_json(calibration),
        Payload::StopDataAcquisition { skip } => to_json(&Stop { skip: *skip }),
        Payload::ListParamDetails { prefix } => to_json(&Prefix {
            prefix: prefix.clone(),
        }),
        Payload::Success(status) | Payload::AsyncError(status) => to_json(status),
        Payload::GetParamResponse { status, results } => to_json(&ParamResults {
            status: status.clone(),
            results: results.clone(),
        }),
        Payload::GetCalibrationResponse {
            status,
            calibration,
        } => to_json(&CalibrationReply {
            status: status.clone(),
            calibration: calibration.clone(),
        }),
        Payload::CalculateDcOffsetResponse { status, dc_offset } => to_json(&DcOffsetReply {
            status: status.clone(),
            dc_offset: *dc_offset,
        }),
        Payload::ListParamDetailsResponse { status, details } => to_json(&DetailsReply {
            status: status.clone(),
            details: details.clone(),
        }),
        Payload::CheckParamConsistencyResponse(report) => to_json(report),
        Payload::CalibrationProgress(progress) => to_json(progress),
        Payload::OscilloscopeData(data) => to_json(data),
        Payload::HistogramData(data) => to_json(data),
    }
}

fn decode_payload(kind: MessageType, body: &[u8]) -> Result<Payload> {
    let payload = match kind {
        MessageType::Ping => Payload::Ping,
        MessageType::StartCalibration => Payload::StartCalibration,
        MessageType::GetCalibration => Payload::GetCalibration,
        MessageType::CalculateDcOffset => Payload::CalculateDcOffset,
        MessageType::StartOscilloscope => Payload::StartOscilloscope,
        MessageType::StartHistogram => Payload::StartHistogram,
        MessageType::StartListMode => Payload::StartListMode,
        MessageType::CheckParamConsistency => Payload::CheckParamConsistency,
        MessageType::GetParam => Payload::GetParam(from_json::<Keys>(kind, body)?.keys),
        MessageType::SetParam => Payload::SetParam(from_json::<Params>(kind, body)?.params),
        MessageType::ParamUpdated => Payload::ParamUpdated(from_json::<Params>(kind, body)?.params),
        MessageType::SetCalibration => Payload::SetCalibration(from_json(kind, body)?),
        MessageType::StopDataAcquisition => Payload::StopDataAcquisition {
            skip: from_json::<Stop>(kind, body)?.skip,
        },
        MessageType::ListParamDetails => Payload::ListParamDetails {
            prefix: from_json::<Prefix>(kind, body)?.prefix,
        },
        MessageType::Success => Payload::Success(from_json(kind, body)?),
        MessageType::AsyncError => Payload::AsyncError(from_json(kind, body)?),
        MessageType::GetParamResponse => {
            let reply: ParamResults = from_json(kind, body)?;
            Payload::GetParamResponse {
                status: reply.status,
                results: reply.results,
            }
        }
        MessageType::GetCalibrationResponse => {
            let reply: CalibrationReply = from_json(kind, body)?;
            Payload::GetCalibrationResponse {
                status: reply.status,
                calibration: reply.calibration,
            }
        }
        MessageType::CalculateDcOffsetResponse => {
            let reply: DcOffsetReply = from_json(kind, body)?;
            Payload::CalculateDcOffsetResponse {
                status: reply.status,
                dc_offset: reply.dc_offset,
            }
        }
        MessageType::ListParamDetailsResponse => {
            let reply: DetailsReply = from_json(kind, body)?;
            Payload::ListParamDetailsResponse {
                status: reply.status,
                details: reply.details,
            }
        }
        MessageType::CheckParamConsistencyResponse => {
            Payload::CheckParamConsistencyResponse(from_json(kind, body)?)
        }
        MessageType::CalibrationProgress => Payload::CalibrationProgress(from_json(kind, body)?),
        MessageType::OscilloscopeData => Payload::OscilloscopeData(from_json(kind, body)?),
        MessageType::HistogramData => Payload::HistogramData(from_json(kind, body)?),
    };
    Ok(payload)
}

/// Encode a message into one complete frame, length prefix included.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = encode_payload(&message.payload)?;
    let len = FRAME_HEADER + body.len();
    if len > MAX_FRAME_LEN {
        return Err(PslError::Encode(format!("frame of {len} bytes is too long")));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + len);
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.push(message.message_type() as u8);
    frame.extend_from_slice(&message.channel.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validate a length prefix read from the wire.
pub fn frame_len(prefix: [u8; LENGTH_PREFIX]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if !(FRAME_HEADER..=MAX_FRAME_LEN).contains(&len) {
        return Err(PslError::Decode(format!("invalid frame length {len}")));
    }
    Ok(len)
}

/// Decode a frame body (everything after the length prefix).
pub fn decode(frame: &[u8]) -> Result<Message> {
    if frame.len() < FRAME_HEADER {
        return Err(PslError::Decode(format!(
            "frame of {} bytes is shorter than its header",
            frame.len()
        )));
    }
    let kind = MessageType::try_from(frame[0])?;
    let channel = i32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let payload = decode_payload(kind, &frame[FRAME_HEADER..])?;
    Ok(Message { channel, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: &[u8]) -> &[u8] {
        &frame[LENGTH_PREFIX..]
    }

    #[test]
    fn length_prefix_counts_header_and_payload() {
        let frame = encode(&Message::new(2, Payload::StartHistogram)).unwrap();
        assert_eq!(frame.len(), LENGTH_PREFIX + FRAME_HEADER);
        assert_eq!(frame_len(frame[..4].try_into().unwrap()).unwrap(), FRAME_HEADER);
        assert_eq!(frame[4], MessageType::StartHistogram as u8);
        assert_eq!(i32::from_le_bytes(frame[5..9].try_into().unwrap()), 2);
    }

    #[test]
    fn get_param_response_decodes() {
        let message = Message::new(
            0,
            Payload::GetParamResponse {
                status: Status::default(),
                results: vec![
                    KeyValue::new("afe.dacGain", ParamValue::Float(1228.8)),
                    KeyValue::new("afe.coupling", ParamValue::Option("dc".into())),
                ],
            },
        );
        let frame = encode(&message).unwrap();
        assert_eq!(decode(body(&frame)).unwrap(), message);
    }

    #[test]
    fn histogram_keeps_bins_and_stats() {
        let message = Message::new(
            3,
            Payload::HistogramData(HistogramData {
                accepted: vec![1, 2, 3],
                rejected: vec![],
                stats: HistogramStats {
                    time_elapsed: 0.5,
                    pulses_accepted: 6,
                    input_count_rate: 12.0,
                    ..Default::default()
                },
            }),
        );
        let frame = encode(&message).unwrap();
        assert_eq!(decode(body(&frame)).unwrap(), message);
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let frame = [42u8, 0, 0, 0, 0];
        assert!(matches!(decode(&frame), Err(PslError::Decode(_))));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let mut frame = vec![MessageType::HistogramData as u8, 0, 0, 0, 0];
        frame.extend_from_slice(b"{not json");
        assert!(matches!(decode(&frame), Err(PslError::Decode(_))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(frame_len(prefix).is_err());
        assert!(frame_len(1u32.to_le_bytes()).is_err());
    }

    #[test]
    fn only_command_replies_are_replies() {
        assert!(MessageType::Success.is_reply());
        assert!(MessageType::CheckParamConsistencyResponse.is_reply());
        assert!(!MessageType::HistogramData.is_reply());
        assert!(!MessageType::ParamUpdated.is_reply());
        assert!(MessageType::StopDataAcquisition.is_request());
    }
}
