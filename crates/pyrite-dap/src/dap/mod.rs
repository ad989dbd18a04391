//! Debug Adapter Protocol transport: `Content-Length` framed JSON messages.

pub mod codec;
pub mod messages;

/// Largest DAP message body accepted from the editor.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Largest single header line accepted before the body.
pub const MAX_DAP_HEADER_LINE_BYTES: usize = 8 * 1024;

pub use codec::{DapError, DapReader, DapWriter};
pub use messages::{make_event, make_response, Event, Request, Response};
