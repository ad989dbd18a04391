//! Debug Adapter Protocol server for script-language debuggees.
//!
//! The adapter speaks DAP to the editor and the binary wire protocol of
//! [`pyrite_wire`] to the debug server embedded in the debuggee. A session
//! either launches the debuggee itself (with or without debugging, via
//! [`pyrite_process`]) or attaches to one that is already running.

pub mod args;
pub mod config_provider;
pub mod connect;
pub mod dap;
pub mod error;
pub mod handles;
pub mod path_mapping;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod strategy;

pub use error::{ServerError, SessionError};
pub use registry::AttachRegistry;
pub use server::{run, run_stdio, serve_tcp, ServerOptions};
pub use session::{DebugSession, SessionOptions};
pub use state::SessionState;
