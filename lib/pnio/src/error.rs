use crate::rpc::connect::ModuleDiff;
use crate::rpc::PnioStatus;
use std::error;
use std::fmt;
use std::io;

/// Coarse classification used to decide how far a failure propagates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    /// Single-attempt failure; retry with the next strategy or after backoff.
    Recoverable,
    /// Partial function; the system continues with reduced coverage.
    Degraded,
    /// The AR cannot progress and moves to its terminal error state.
    FatalPerAr,
    /// Expected catalogue inconsistent with the RTU; needs operator action.
    Configuration,
    /// Malformed input; discarded and counted, no state transition.
    ProtocolViolation,
}

/// Buffer-level failures raised by the frame codec.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CodecError {
    /// A read or write at `offset..offset + len` fell outside a buffer of
    /// `capacity` bytes.
    RangeViolation {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// The frame ended before a complete structure could be read.
    TruncatedFrame,
}

impl CodecError {
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::RangeViolation { .. } => "codec.range",
            CodecError::TruncatedFrame => "codec.truncated",
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::RangeViolation {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "Access of {} bytes at offset {} outside buffer of {} bytes",
                len, offset, capacity
            ),
            CodecError::TruncatedFrame => write!(f, "Frame truncated"),
        }
    }
}

impl error::Error for CodecError {}

/// Failures raised by the RPC connect engine and its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The request datagram could not be handed to the network stack.
    SendFailed(io::ErrorKind),
    /// No matching response arrived within the strategy deadline.
    TransportTimeout,
    /// The response ended mid-structure.
    TruncatedResponse,
    /// The RTU answered with a PNIO status the engine does not accept.
    UnexpectedPnioError(PnioStatus),
    /// The RTU reported that no AR session slots are free.
    SessionExhausted,
    /// The Connect response carried differences on application slots.
    ModuleDiffNeedsAction(ModuleDiff),
    /// A structurally valid frame carried a value the parser rejects.
    MalformedResponse(&'static str),
    Codec(CodecError),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::SendFailed(_) => "rpc.send",
            RpcError::TransportTimeout => "rpc.timeout",
            RpcError::TruncatedResponse => "rpc.truncated",
            RpcError::UnexpectedPnioError(_) => "rpc.pnio_status",
            RpcError::SessionExhausted => "rpc.session_exhausted",
            RpcError::ModuleDiffNeedsAction(_) => "rpc.module_diff",
            RpcError::MalformedResponse(_) => "rpc.malformed",
            RpcError::Codec(_) => "rpc.codec",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RpcError::SendFailed(_) => ErrorClass::Recoverable,
            RpcError::TransportTimeout => ErrorClass::Recoverable,
            RpcError::TruncatedResponse => ErrorClass::ProtocolViolation,
            RpcError::UnexpectedPnioError(_) => ErrorClass::Recoverable,
            RpcError::SessionExhausted => ErrorClass::FatalPerAr,
            RpcError::ModuleDiffNeedsAction(_) => ErrorClass::Configuration,
            RpcError::MalformedResponse(_) => ErrorClass::ProtocolViolation,
            RpcError::Codec(_) => ErrorClass::ProtocolViolation,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::SendFailed(kind) => write!(f, "Request send failed: {:?}", kind),
            RpcError::TransportTimeout => write!(f, "No response before deadline"),
            RpcError::TruncatedResponse => write!(f, "Response truncated"),
            RpcError::UnexpectedPnioError(status) => {
                write!(f, "RTU rejected the operation with {}", status)
            }
            RpcError::SessionExhausted => write!(f, "RTU has no free AR sessions"),
            RpcError::ModuleDiffNeedsAction(diff) => write!(
                f,
                "Module configuration differs on {} application submodule(s)",
                diff.entries.len()
            ),
            RpcError::MalformedResponse(what) => write!(f, "Malformed response: {}", what),
            RpcError::Codec(err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for RpcError {}

impl From<CodecError> for RpcError {
    #[inline]
    fn from(err: CodecError) -> Self {
        RpcError::Codec(err)
    }
}

/// Failures raised by the acyclic record payload codecs. None of these
/// release the AR; the RTU keeps its previous state.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecordError {
    VersionMismatch { expected: u8, got: u8 },
    ChecksumError { expected: u16, got: u16 },
    /// Enrollment payload did not start with the ENRL magic.
    InvalidMagic { got: u32 },
    TooManyUsers { count: usize },
    FieldTooLong { field: &'static str, max: usize },
    Malformed(&'static str),
    Codec(CodecError),
}

impl RecordError {
    pub fn code(&self) -> &'static str {
        match self {
            RecordError::VersionMismatch { .. } => "record.version",
            RecordError::ChecksumError { .. } => "record.checksum",
            RecordError::InvalidMagic { .. } => "record.magic",
            RecordError::TooManyUsers { .. } => "record.user_count",
            RecordError::FieldTooLong { .. } => "record.field_len",
            RecordError::Malformed(_) => "record.malformed",
            RecordError::Codec(_) => "record.codec",
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::ProtocolViolation
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordError::VersionMismatch { expected, got } => {
                write!(f, "Record version {} where {} was expected", got, expected)
            }
            RecordError::ChecksumError { expected, got } => write!(
                f,
                "Record CRC {:#06X} does not match computed {:#06X}",
                got, expected
            ),
            RecordError::InvalidMagic { got } => {
                write!(f, "Enrollment magic {:#010X} is not ENRL", got)
            }
            RecordError::TooManyUsers { count } => {
                write!(f, "User sync with {} users exceeds the table limit", count)
            }
            RecordError::FieldTooLong { field, max } => {
                write!(f, "Field {} exceeds {} bytes", field, max)
            }
            RecordError::Malformed(what) => write!(f, "Malformed record: {}", what),
            RecordError::Codec(err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for RecordError {}

impl From<CodecError> for RecordError {
    #[inline]
    fn from(err: CodecError) -> Self {
        RecordError::Codec(err)
    }
}

/// Configuration-time failures: catalogue and layout validation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    OverlappingPlacements {
        slot: u16,
        subslot: u16,
        offset: u16,
    },
    FrameTooLarge {
        bytes: usize,
        limit: usize,
    },
    InvalidStationName(String),
    InvalidDiscoveryTimeout(u64),
    EmptyCatalogue,
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::OverlappingPlacements { .. } => "config.overlap",
            ConfigError::FrameTooLarge { .. } => "config.frame_size",
            ConfigError::InvalidStationName(_) => "config.station_name",
            ConfigError::InvalidDiscoveryTimeout(_) => "config.discovery_timeout",
            ConfigError::EmptyCatalogue => "config.empty_catalogue",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::OverlappingPlacements {
                slot,
                subslot,
                offset,
            } => write!(
                f,
                "Submodule {}/{} overlaps a prior placement at frame offset {}",
                slot, subslot, offset
            ),
            ConfigError::FrameTooLarge { bytes, limit } => {
                write!(f, "C-SDU of {} bytes exceeds the {} byte limit", bytes, limit)
            }
            ConfigError::InvalidStationName(name) => {
                write!(f, "Station name {:?} is not a valid DNS label sequence", name)
            }
            ConfigError::InvalidDiscoveryTimeout(ms) => {
                write!(f, "Discovery timeout {} ms outside 100..10000", ms)
            }
            ConfigError::EmptyCatalogue => write!(f, "Expected catalogue has no submodules"),
        }
    }
}

impl error::Error for ConfigError {}

/// Failures surfaced to command submitters through the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The command queue is full; the caller must retry.
    Backpressure,
    /// The target RTU is in the terminal error state.
    RtuOffline { station: String },
    UnknownStation { station: String },
    UnknownSlot { station: String, slot: u16 },
    InvalidDuty { duty: u8 },
    /// The command was dispatched but the operation did not complete.
    OperationFailed { station: String, reason: String },
    Config(ConfigError),
    Rpc(RpcError),
    Record(RecordError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Backpressure => "command.backpressure",
            CommandError::RtuOffline { .. } => "command.rtu_offline",
            CommandError::UnknownStation { .. } => "command.unknown_station",
            CommandError::UnknownSlot { .. } => "command.unknown_slot",
            CommandError::InvalidDuty { .. } => "command.invalid_duty",
            CommandError::OperationFailed { .. } => "command.operation_failed",
            CommandError::Config(err) => err.code(),
            CommandError::Rpc(err) => err.code(),
            CommandError::Record(err) => err.code(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::Backpressure => write!(f, "Command queue full"),
            CommandError::RtuOffline { station } => {
                write!(f, "RTU {} is offline; reset it before issuing commands", station)
            }
            CommandError::UnknownStation { station } => {
                write!(f, "No RTU registered under station name {}", station)
            }
            CommandError::UnknownSlot { station, slot } => {
                write!(f, "RTU {} has no slot {}", station, slot)
            }
            CommandError::InvalidDuty { duty } => {
                write!(f, "PWM duty {} outside 0..=100", duty)
            }
            CommandError::OperationFailed { station, reason } => {
                write!(f, "Operation on {} failed: {}", station, reason)
            }
            CommandError::Config(err) => write!(f, "{}", err),
            CommandError::Rpc(err) => write!(f, "{}", err),
            CommandError::Record(err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for CommandError {}

impl From<RpcError> for CommandError {
    #[inline]
    fn from(err: RpcError) -> Self {
        CommandError::Rpc(err)
    }
}

impl From<RecordError> for CommandError {
    #[inline]
    fn from(err: RecordError) -> Self {
        CommandError::Record(err)
    }
}

impl From<ConfigError> for CommandError {
    #[inline]
    fn from(err: ConfigError) -> Self {
        CommandError::Config(err)
    }
}

/// Failures on the raw-Ethernet link.
#[derive(Debug)]
pub enum LinkError {
    InterfaceNotFound(String),
    UnhandledInterfaceType,
    Closed,
    Io(io::Error),
}

impl LinkError {
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::InterfaceNotFound(_) => "link.interface",
            LinkError::UnhandledInterfaceType => "link.channel_type",
            LinkError::Closed => "link.closed",
            LinkError::Io(_) => "link.io",
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::InterfaceNotFound(name) => write!(f, "Interface {} not found", name),
            LinkError::UnhandledInterfaceType => write!(f, "Interface is not an Ethernet channel"),
            LinkError::Closed => write!(f, "Link closed"),
            LinkError::Io(err) => write!(f, "Link I/O error: {}", err),
        }
    }
}

impl error::Error for LinkError {}

impl From<io::Error> for LinkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        LinkError::Io(err)
    }
}
