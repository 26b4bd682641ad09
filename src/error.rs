use std::path::PathBuf;
use std::sync::PoisonError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PslError>;

#[derive(Error, Debug)]
pub enum PslError {
    // --- argument errors ---
    #[error("unknown acquisition value '{0}'")]
    UnknownValue(String),

    #[error("acquisition value '{0}' is deprecated")]
    DeprecatedValue(String),

    #[error("unknown board operation '{0}'")]
    UnknownBoardOperation(String),

    #[error("run data '{name}' is not available in mapping mode {mode}")]
    UnknownRunData { name: String, mode: u32 },

    #[error("unknown special run '{0}'")]
    UnknownSpecialRun(String),

    #[error("'{name}' value {value} is out of range")]
    OutOfRange { name: String, value: f64 },

    #[error("'{0}' is read-only")]
    ReadOnly(String),

    #[error("'{0}' is not supported by this hardware")]
    NotSupported(String),

    #[error("unknown detector channel {0}")]
    UnknownChannel(i32),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    // --- protocol errors ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode message: {0}")]
    Decode(String),

    #[error("cannot encode message: {0}")]
    Encode(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device reported error {code}: {message}")]
    Device { code: i32, message: String },

    #[error("parameters are inconsistent: {0}")]
    Inconsistent(String),

    #[error("module '{0}' is not connected")]
    NotConnected(String),

    // --- state errors ---
    #[error("channel {0} is not active")]
    NotActive(i32),

    #[error("operation requires mapping mode {expected}")]
    WrongMode { expected: &'static str },

    #[error("no spectrum is available")]
    NoSpectrum,

    #[error("buffer '{0}' is not the active buffer")]
    BufferNotActive(char),

    #[error("no valid characterization is loaded")]
    NoCalibration,

    #[error("invalid channel state: {0}")]
    InvalidState(String),

    // --- resource errors ---
    #[error("cannot read '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot write '{}': {source}", .path.display())]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed characterization: {0}")]
    BadCharacterization(String),

    #[error("malformed defaults store: {0}")]
    BadDefaults(String),

    // --- timing errors ---
    #[error("timed out waiting for the reply to {0}")]
    TransactionTimeout(&'static str),

    #[error("timed out waiting for channel {channel} to reach {state}")]
    ChannelStateTimeout { channel: i32, state: &'static str },

    #[error("timed out waiting for the ADC trace")]
    AdcTraceTimeout,

    // --- thread errors ---
    #[error("thread error: {0}")]
    Thread(String),
}

impl PslError {
    /// Numeric status code. Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            Self::UnknownValue(_) => 101,
            Self::DeprecatedValue(_) => 102,
            Self::UnknownBoardOperation(_) => 103,
            Self::UnknownRunData { .. } => 104,
            Self::UnknownSpecialRun(_) => 105,
            Self::OutOfRange { .. } => 106,
            Self::ReadOnly(_) => 107,
            Self::NotSupported(_) => 108,
            Self::UnknownChannel(_) => 109,
            Self::UnknownModule(_) => 110,
            Self::BadArgument(_) => 111,
            Self::Io(_) => 201,
            Self::Decode(_) => 202,
            Self::Encode(_) => 203,
            Self::Protocol(_) => 204,
            Self::Device { .. } => 205,
            Self::Inconsistent(_) => 206,
            Self::NotConnected(_) => 207,
            Self::NotActive(_) => 301,
            Self::WrongMode { .. } => 302,
            Self::NoSpectrum => 303,
            Self::BufferNotActive(_) => 304,
            Self::NoCalibration => 305,
            Self::InvalidState(_) => 306,
            Self::FileRead { .. } => 401,
            Self::FileWrite { .. } => 402,
            Self::BadCharacterization(_) => 403,
            Self::BadDefaults(_) => 404,
            Self::TransactionTimeout(_) => 501,
            Self::ChannelStateTimeout { .. } => 502,
            Self::AdcTraceTimeout => 503,
            Self::Thread(_) => 601,
        }
    }

    pub(crate) fn out_of_range(name: &str, value: f64) -> Self {
        Self::OutOfRange {
            name: name.to_string(),
            value,
        }
    }
}

impl<T> From<PoisonError<T>> for PslError {
    fn from(err: PoisonError<T>) -> Self {
        Self::Thread(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_category() {
        assert_eq!(PslError::NoSpectrum.code() / 100, 3);
        assert_eq!(PslError::AdcTraceTimeout.code() / 100, 5);
        assert_eq!(PslError::out_of_range("analog_gain", 20.0).code() / 100, 1);
        assert_eq!(
            PslError::Device {
                code: 3,
                message: "bad key".into()
            }
            .code()
                / 100,
            2
        );
    }

    #[test]
    fn poisoned_lock_becomes_thread_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();
        let err: PslError = lock.lock().unwrap_err().into();
        assert!(matches!(err, PslError::Thread(_)));
    }
}
