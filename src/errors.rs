use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("post-processing error: {0}")]
    Cleaner(#[from] CleanerError),
}

/// Failures of a single command exchange. Fatal to that call only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected response opcode: expected {expected:#04X}, got {actual:#04X}")]
    UnexpectedOpcode { expected: u8, actual: u8 },
    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("invalid error-register packet framing (head={head:#04X}, tail={tail:#04X})")]
    BadRegisterFraming { head: u8, tail: u8 },
    #[error("invalid system state ordinal: {0}")]
    InvalidSystemState(u8),
    #[error("payload {value} does not fit into {width} data bytes")]
    PayloadOverflow { value: u32, width: usize },
    #[error("echo response is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid PGA gain {0}, must be one of [1, 2, 4, 8]")]
    PgaGain(u8),
    #[error("invalid SDO driver strength {0}, must be one of [0, 1, 2, 3]")]
    DriverStrength(u8),
    #[error("invalid sampling rate {0}, must be between 0 and 160000 SPS")]
    SamplingRate(u32),
    #[error("sampling rate {0} SPS cannot be encoded into the 16-bit command payload")]
    SamplingRateNotEncodable(u32),
    #[error("invalid amplifier gain {0}, must be at least 1")]
    AmplifierGain(f64),
    #[error("no device with USB VID {vid:#06X} / PID {pid:#06X} found (available: {available})")]
    DeviceNotFound { vid: u16, pid: u16, available: String },
    #[error("failed to read session file: {0}")]
    Source(String),
}

/// Why a streaming frame was rejected by the codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("wrong frame length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("bad frame head {0:#04X}")]
    BadHead(u8),
    #[error("bad frame tail {0:#04X}")]
    BadTail(u8),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("acquisition already running")]
    AlreadyRunning,
    #[error("acquisition not running")]
    NotRunning,
    #[error("no bus subscriber appeared within {0:?}")]
    NoSubscriber(std::time::Duration),
    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CleanerError {
    #[error("rolling-median window must be odd and non-zero, got {0}")]
    EvenWindow(usize),
    #[error("measurement rows ({measurements}) and alert rows ({alerts}) differ")]
    ShapeMismatch { measurements: usize, alerts: usize },
}

impl From<csv::Error> for DriverError {
    fn from(e: csv::Error) -> Self {
        DriverError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
