use std::io;

use pyrite_wire::{ServerErrorCode, WireError};
use thiserror::Error;

use crate::dap::DapError;
use crate::state::SessionState;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Errors scoped to a single DAP request. Each one becomes a `success: false`
/// response carrying its display text.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("`{command}` is not valid while the session is {state}")]
    InvalidState {
        command: String,
        state: SessionState,
    },

    #[error("not stopped")]
    NotStopped,

    #[error("invalid reference {0}")]
    InvalidReference(i64),

    #[error("already attached to {0}")]
    AlreadyAttached(String),

    #[error("session terminated")]
    Terminated,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unsupported request `{0}`")]
    Unsupported(String),

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("could not reserve a port for the debug server: {0}")]
    PortReservation(#[source] io::Error),

    #[error("debuggee exited{} before its debug server was reachable{}", exit_suffix(.code), stderr_suffix(.stderr))]
    EarlyExit { code: Option<i32>, stderr: String },

    #[error("could not connect to debug server at {host}:{port} within {timeout_ms} ms")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_ms: u128,
    },

    #[error("could not connect to debug server at {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: WireError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Wire(#[from] WireError),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

impl SessionError {
    pub(crate) fn invalid_state(command: &str, state: SessionState) -> Self {
        SessionError::InvalidState {
            command: command.to_string(),
            state,
        }
    }

    /// Maps wire errors that name a specific DAP condition onto it.
    pub(crate) fn from_wire(err: WireError, reference: i64) -> Self {
        match err.server_code() {
            Some(ServerErrorCode::InvalidReference) => SessionError::InvalidReference(reference),
            Some(ServerErrorCode::NotSuspended) => SessionError::NotStopped,
            _ => SessionError::Wire(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Dap(#[from] DapError),
}
