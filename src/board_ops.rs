use crate::channel::Channel;
use crate::error::{PslError, Result};
use crate::module::Module;
use crate::params::Params;
use crate::sinc::{MessageType, Payload};
use log::{debug, warn};

/// Bytes in the `get_board_info` record.
pub const BOARD_INFO_LEN: usize = 144;

pub const FEATURE_MCA_GATE_VETO: u32 = 1 << 0;
pub const FEATURE_TERMINATION_50OHM: u32 = 1 << 1;
pub const FEATURE_ATTENUATION_GROUND: u32 = 1 << 2;
pub const FEATURE_RISETIME_OPTIMIZATION: u32 = 1 << 3;

#[derive(Clone, Debug, PartialEq)]
pub enum BoardData {
    None,
    Bool(bool),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardOperation {
    Apply,
    BufferDone,
    MappingPixelNext,
    GetBoardInfo,
    GetBoardFeatures,
    GetConnected,
    GetChannelCount,
    GetSerialNumber,
    GetFirmwareVersion,
}

impl BoardOperation {
    pub fn from_name(name: &str) -> Result<Self> {
        let op = match name {
            "apply" => Self::Apply,
            "buffer_done" => Self::BufferDone,
            "mapping_pixel_next" => Self::MappingPixelNext,
            "get_board_info" => Self::GetBoardInfo,
            "get_board_features" => Self::GetBoardFeatures,
            "get_connected" => Self::GetConnected,
            "get_channel_count" => Self::GetChannelCount,
            "get_serial_number" => Self::GetSerialNumber,
            "get_firmware_version" => Self::GetFirmwareVersion,
            other => return Err(PslError::UnknownBoardOperation(other.to_string())),
        };
        Ok(op)
    }
}

/// Run the named operation. `arg` selects the buffer for `buffer_done`.
pub fn run(module: &Module, channel: &Channel, name: &str, arg: Option<&str>) -> Result<BoardData> {
    let op = BoardOperation::from_name(name)?;
    debug!("{}: board operation {name}", module.alias);
    match op {
        BoardOperation::Apply => apply(module, channel).map(|_| BoardData::None),
        BoardOperation::BufferDone => {
            let buffer = arg.map(parse_buffer).transpose()?;
            buffer_done(channel, buffer).map(|_| BoardData::None)
        }
        BoardOperation::MappingPixelNext => mapping_pixel_next(module).map(|_| BoardData::None),
        BoardOperation::GetBoardInfo => get_board_info(module, channel).map(BoardData::Bytes),
        BoardOperation::GetBoardFeatures => {
            Ok(BoardData::UInt(board_features(channel)? as u64))
        }
        BoardOperation::GetConnected => Ok(BoardData::Bool(get_connected(module))),
        BoardOperation::GetChannelCount => Ok(BoardData::UInt(module.channels().len() as u64)),
        BoardOperation::GetSerialNumber => Params::new(module, channel.index)
            .get_string("instrument.serialNumber")
            .map(BoardData::Text),
        BoardOperation::GetFirmwareVersion => Params::new(module, channel.index)
            .get_string("instrument.firmwareVersion")
            .map(BoardData::Text),
    }
}

fn parse_buffer(arg: &str) -> Result<char> {
    match arg.trim() {
        "a" | "A" => Ok('a'),
        "b" | "B" => Ok('b'),
        other => Err(PslError::BadArgument(format!("no buffer '{other}'"))),
    }
}

/// Ask the device whether the parameters written so far fit together.
pub fn apply(module: &Module, channel: &Channel) -> Result<()> {
    let reply = module.request(
        channel.index,
        Payload::CheckParamConsistency,
        MessageType::CheckParamConsistencyResponse,
    )?;
    let report = match reply {
        Payload::CheckParamConsistencyResponse(report) => report,
        other => {
            return Err(PslError::Protocol(format!(
                "consistency check answered with {:?}",
                other.message_type()
            )))
        }
    };
    if report.healthy && report.bad_key.is_empty() && report.message.is_empty() {
        return Ok(());
    }
    warn!(
        "{}: channel {} inconsistent at '{}': {}",
        module.alias, channel.index, report.bad_key, report.message
    );
    Err(PslError::Inconsistent(if report.bad_key.is_empty() {
        report.message
    } else {
        format!("{}: {}", report.bad_key, report.message)
    }))
}

pub fn buffer_done(channel: &Channel, buffer: Option<char>) -> Result<()> {
    let mut inner = channel.lock()?;
    let mm1 = inner.mapping.mm1_mut().ok_or(PslError::WrongMode {
        expected: "mca mapping",
    })?;
    mm1.buffers.done(buffer)
}

/// Advance the pixel on every active channel of the module.
pub fn mapping_pixel_next(module: &Module) -> Result<()> {
    for channel in module.active_channels() {
        let mut inner = channel.lock()?;
        let mm1 = inner.mapping.mm1_mut().ok_or(PslError::WrongMode {
            expected: "mca mapping",
        })?;
        mm1.pixel_next();
    }
    Ok(())
}

pub fn get_connected(module: &Module) -> bool {
    match module.ping() {
        Ok(()) => true,
        Err(e) => {
            debug!("{}: ping failed: {e}", module.alias);
            false
        }
    }
}

pub fn board_features(channel: &Channel) -> Result<u32> {
    let features = channel.features()?;
    let mut bits = 0;
    if features.mca_gate_veto {
        bits |= FEATURE_MCA_GATE_VETO;
    }
    if features.termination_50ohm {
        bits |= FEATURE_TERMINATION_50OHM;
    }
    if features.attenuation_ground {
        bits |= FEATURE_ATTENUATION_GROUND;
    }
    if features.risetime_optimization {
        bits |= FEATURE_RISETIME_OPTIMIZATION;
    }
    Ok(bits)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoardInfo {
    pub product_name: String,
    pub protocol_version: i64,
    pub firmware_version: String,
    pub serial_number: String,
    pub afe_serial_number: String,
}

impl BoardInfo {
    pub fn read(module: &Module, channel: &Channel) -> Result<Self> {
        let params = Params::new(module, channel.index);
        Ok(Self {
            product_name: params.get_string("instrument.productName")?,
            protocol_version: params.get_int("instrument.protocolVersion")?,
            firmware_version: params.get_string("instrument.firmwareVersion")?,
            serial_number: params.get_string("instrument.serialNumber")?,
            afe_serial_number: params.get_string("afe.serialNumber")?,
        })
    }

    /// Pack into the fixed 144-byte record. Strings are truncated to their
    /// 32-byte slots and zero padded.
    pub fn to_bytes(&self) -> [u8; BOARD_INFO_LEN] {
        let mut bytes = [0u8; BOARD_INFO_LEN];
        put_str(&mut bytes[0..32], &self.product_name);
        bytes[40..48].copy_from_slice(&self.protocol_version.to_be_bytes());
        put_str(&mut bytes[48..80], &self.firmware_version);
        put_str(&mut bytes[80..112], &self.serial_number);
        put_str(&mut bytes[112..144], &self.afe_serial_number);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; BOARD_INFO_LEN]) -> Self {
        let mut version = [0u8; 8];
        version.copy_from_slice(&bytes[40..48]);
        Self {
            product_name: get_str(&bytes[0..32]),
            protocol_version: i64::from_be_bytes(version),
            firmware_version: get_str(&bytes[48..80]),
            serial_number: get_str(&bytes[80..112]),
            afe_serial_number: get_str(&bytes[112..144]),
        }
    }
}

fn put_str(slot: &mut [u8], value: &str) {
    let n = value.len().min(slot.len());
    slot[..n].copy_from_slice(&value.as_bytes()[..n]);
}

fn get_str(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

pub fn get_board_info(module: &Module, channel: &Channel) -> Result<Vec<u8>> {
    Ok(BoardInfo::read(module, channel)?.to_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve() {
        assert_eq!(BoardOperation::from_name("apply").unwrap(), BoardOperation::Apply);
        assert_eq!(
            BoardOperation::from_name("get_firmware_version").unwrap(),
            BoardOperation::GetFirmwareVersion
        );
        assert!(matches!(
            BoardOperation::from_name("reboot"),
            Err(PslError::UnknownBoardOperation(_))
        ));
    }

    #[test]
    fn board_info_layout() {
        let info = BoardInfo {
            product_name: "FalconXn".into(),
            protocol_version: 0x0102_0304,
            firmware_version: "1.1.9".into(),
            serial_number: "SN1234".into(),
            afe_serial_number: "AFE-0042".into(),
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[0..8], b"FalconXn");
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[32..40], &[0; 8]);
        assert_eq!(&bytes[40..48], &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(&bytes[48..53], b"1.1.9");
        assert_eq!(&bytes[80..86], b"SN1234");
        assert_eq!(&bytes[112..120], b"AFE-0042");
        assert_eq!(BoardInfo::from_bytes(&bytes), info);
    }

    #[test]
    fn long_strings_are_truncated() {
        let info = BoardInfo {
            product_name: "x".repeat(40),
            ..Default::default()
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[0..32], "x".repeat(32).as_bytes());
        assert_eq!(&bytes[32..40], &[0; 8]);
    }

    #[test]
    fn buffer_names() {
        assert_eq!(parse_buffer("a").unwrap(), 'a');
        assert_eq!(parse_buffer("B").unwrap(), 'b');
        assert!(parse_buffer("c").is_err());
    }
}
