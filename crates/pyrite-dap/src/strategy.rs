//! How a session reaches its debuggee: spawn it with the debug launcher, spawn
//! it plainly, or connect to one that is already running.

use std::path::Path;

use crate::args::{LaunchArguments, RequestKind};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    LocalDebug,
    NoDebug,
    RemoteAttach,
}

/// Inputs for building the interpreter command line.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub launcher_script: Option<&'a Path>,
    pub no_debug_launcher_script: Option<&'a Path>,
    /// Port the embedded debug server listens on (debug launches only).
    pub port: u16,
}

pub type BuildLaunchArgs = fn(&LaunchArguments, &LaunchContext<'_>) -> Result<Vec<String>>;

#[derive(Debug, Clone, Copy)]
pub struct ClientStrategy {
    pub kind: ClientKind,
    /// The session spawned the debuggee and kills it on teardown.
    pub owns_process_lifecycle: bool,
    pub uses_wire_protocol: bool,
    pub build_launch_args: Option<BuildLaunchArgs>,
}

impl ClientStrategy {
    pub fn select(request: RequestKind, no_debug: bool) -> Self {
        match (request, no_debug) {
            (RequestKind::Launch, false) => ClientStrategy {
                kind: ClientKind::LocalDebug,
                owns_process_lifecycle: true,
                uses_wire_protocol: true,
                build_launch_args: Some(local_debug_args),
            },
            (RequestKind::Launch, true) => ClientStrategy {
                kind: ClientKind::NoDebug,
                owns_process_lifecycle: true,
                uses_wire_protocol: false,
                build_launch_args: Some(no_debug_args),
            },
            (RequestKind::Attach, _) => ClientStrategy {
                kind: ClientKind::RemoteAttach,
                owns_process_lifecycle: false,
                uses_wire_protocol: true,
                build_launch_args: None,
            },
        }
    }

    pub fn launch_args(
        &self,
        args: &LaunchArguments,
        cx: &LaunchContext<'_>,
    ) -> Result<Option<Vec<String>>> {
        self.build_launch_args
            .map(|build| build(args, cx))
            .transpose()
    }
}

fn cwd_arg(args: &LaunchArguments) -> String {
    args.cwd
        .as_deref()
        .map(|cwd| cwd.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

/// `[launcher, cwd, port, (-m module | program), args...]`
fn local_debug_args(args: &LaunchArguments, cx: &LaunchContext<'_>) -> Result<Vec<String>> {
    let launcher = cx.launcher_script.ok_or_else(|| {
        SessionError::InvalidArguments(
            "no debug launcher script configured (`debugger.launcher_script`)".to_string(),
        )
    })?;
    let mut out = vec![
        launcher.to_string_lossy().into_owned(),
        cwd_arg(args),
        cx.port.to_string(),
    ];
    out.extend(args.target.to_args());
    out.extend(args.args.iter().cloned());
    Ok(out)
}

/// `[(-m module | program), args...]`, or `[script, cwd, (-m module | program), args...]`
/// when a no-debug launcher script is configured.
fn no_debug_args(args: &LaunchArguments, cx: &LaunchContext<'_>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if let Some(script) = cx.no_debug_launcher_script {
        out.push(script.to_string_lossy().into_owned());
        out.push(cwd_arg(args));
    }
    out.extend(args.target.to_args());
    out.extend(args.args.iter().cloned());
    Ok(out)
}
