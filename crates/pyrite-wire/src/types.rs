use std::{fmt, io};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WireError>;

pub type ThreadId = u64;
pub type FrameId = u64;
/// Reference to an expandable value on the debug server. `0` means the value
/// has no children.
pub type VariableRef = u64;

pub const CMD_SET_DEBUG_OPTIONS: u16 = 1;
pub const CMD_SET_BREAKPOINTS: u16 = 2;
pub const CMD_SET_EXCEPTION_MODE: u16 = 3;
pub const CMD_CONFIGURATION_DONE: u16 = 4;
pub const CMD_RESUME: u16 = 5;
pub const CMD_STEP: u16 = 6;
pub const CMD_THREADS: u16 = 7;
pub const CMD_FRAMES: u16 = 8;
pub const CMD_FRAME_VARIABLES: u16 = 9;
pub const CMD_CHILDREN: u16 = 10;
pub const CMD_DETACH: u16 = 11;

pub const EVENT_THREAD_CREATED: u16 = 1;
pub const EVENT_THREAD_EXITED: u16 = 2;
pub const EVENT_BREAKPOINT_HIT: u16 = 3;
pub const EVENT_STEP_COMPLETE: u16 = 4;
pub const EVENT_EXCEPTION_RAISED: u16 = 5;
pub const EVENT_OUTPUT: u16 = 6;
pub const EVENT_PROCESS_EXITED: u16 = 7;

pub const ERROR_INVALID_REFERENCE: u16 = 1;
pub const ERROR_NOT_SUSPENDED: u16 = 2;
pub const ERROR_UNKNOWN_COMMAND: u16 = 3;
pub const ERROR_INVALID_ARGUMENT: u16 = 4;

/// Error code carried by a reply packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    InvalidReference,
    NotSuspended,
    UnknownCommand,
    InvalidArgument,
    Other(u16),
}

impl ServerErrorCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            ERROR_INVALID_REFERENCE => Self::InvalidReference,
            ERROR_NOT_SUSPENDED => Self::NotSuspended,
            ERROR_UNKNOWN_COMMAND => Self::UnknownCommand,
            ERROR_INVALID_ARGUMENT => Self::InvalidArgument,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::InvalidReference => ERROR_INVALID_REFERENCE,
            Self::NotSuspended => ERROR_NOT_SUSPENDED,
            Self::UnknownCommand => ERROR_UNKNOWN_COMMAND,
            Self::InvalidArgument => ERROR_INVALID_ARGUMENT,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidReference => f.write_str("invalid reference"),
            Self::NotSuspended => f.write_str("thread is not suspended"),
            Self::UnknownCommand => f.write_str("unknown command"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::Other(code) => write!(f, "error code {code}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("timed out waiting for the debug server")]
    Timeout,
    #[error("debug server connection closed")]
    ConnectionClosed,
    #[error("request cancelled")]
    Cancelled,
    #[error("debug server handshake failed: {0}")]
    Handshake(String),
    #[error("debug protocol error: {0}")]
    Protocol(String),
    #[error("debug server rejected command: {0}")]
    Server(ServerErrorCode),
}

impl WireError {
    /// Whether a fresh connection attempt could plausibly succeed (nothing
    /// listening yet, network hiccup). Handshake and protocol failures mean the
    /// peer is not a debug server and retrying will not help.
    pub fn is_retryable_connect_error(&self) -> bool {
        match self {
            WireError::Timeout => true,
            WireError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ),
            _ => false,
        }
    }

    pub fn server_code(&self) -> Option<ServerErrorCode> {
        match self {
            WireError::Server(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub name: String,
    /// Source path as seen by the debuggee.
    pub path: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub value: String,
    pub type_name: String,
    pub children: VariableRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub line: u32,
    pub column: Option<u32>,
}

/// Server acknowledgment for one requested breakpoint, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointAck {
    pub id: u32,
    pub line: u32,
    pub verified: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    pub fn as_u8(self) -> u8 {
        match self {
            StepKind::Over => 0,
            StepKind::Into => 1,
            StepKind::Out => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StepKind::Over),
            1 => Some(StepKind::Into),
            2 => Some(StepKind::Out),
            _ => None,
        }
    }
}

/// Which exceptions suspend the debuggee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionMode {
    pub raised: bool,
    pub uncaught: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    ThreadCreated {
        thread: ThreadInfo,
    },
    ThreadExited {
        thread_id: ThreadId,
    },
    BreakpointHit {
        thread_id: ThreadId,
        breakpoint_id: u32,
    },
    StepComplete {
        thread_id: ThreadId,
    },
    ExceptionRaised {
        thread_id: ThreadId,
        description: String,
    },
    Output {
        category: String,
        text: String,
    },
    ProcessExited {
        exit_code: i32,
    },
    /// Synthesized by the client when the connection ends; always the last
    /// event delivered.
    Disconnected {
        reason: String,
    },
}

impl WireEvent {
    /// Events after which the debuggee is suspended.
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            WireEvent::BreakpointHit { .. }
                | WireEvent::StepComplete { .. }
                | WireEvent::ExceptionRaised { .. }
        )
    }
}
