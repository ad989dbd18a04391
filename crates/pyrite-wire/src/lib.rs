//! Wire protocol spoken with the debug server embedded in a debuggee.
//!
//! Packets are length-prefixed and big-endian. After a fixed handshake the
//! client sends commands, the server answers each with a reply carrying the
//! same id, and pushes events (stops, thread lifecycle, output, exit) at any
//! time. See [`codec`] for the framing.

mod client;
pub mod codec;
pub mod types;

pub use client::{EventReceiver, WireClient, WireClientConfig};
pub use types::{
    BreakpointAck, BreakpointSpec, ExceptionMode, FrameId, FrameInfo, Result, ServerErrorCode,
    StepKind, ThreadId, ThreadInfo, VariableInfo, VariableRef, WireError, WireEvent,
};

// Compiled for this crate's own tests unconditionally, and behind
// `wire-test-support` for downstream integration suites.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
