//! Turns raw `launch`/`attach` JSON into resolved argument structs, applying
//! adapter defaults and deriving the debug options the server expects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pyrite_config::DebuggerConfig;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::args::{
    AttachArguments, DebugOption, DebugOptions, LaunchArguments, PathMapping, Target,
};
use crate::connect::is_local_host;
use crate::dap::codec::sanitize_json_error_message;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// Default file systems on these platforms compare paths case-insensitively.
    pub fn is_case_insensitive(self) -> bool {
        matches!(self, Platform::Windows | Platform::MacOs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawLaunchArguments {
    program: Option<String>,
    module: Option<String>,
    args: Vec<String>,
    cwd: Option<String>,
    env: HashMap<String, String>,
    python_path: Option<String>,
    port: Option<u16>,
    no_debug: bool,
    debug_std_lib: bool,
    redirect_output: bool,
    django: bool,
    jinja: Option<bool>,
    sudo: bool,
    wait_on_abnormal_exit: bool,
    wait_on_normal_exit: bool,
    debug_options: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPathMapping {
    local_root: String,
    remote_root: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawAttachArguments {
    host: Option<String>,
    port: Option<u16>,
    /// Milliseconds.
    timeout: Option<u64>,
    local_root: Option<String>,
    remote_root: Option<String>,
    path_mappings: Vec<RawPathMapping>,
    debug_std_lib: bool,
    redirect_output: bool,
    django: bool,
    jinja: bool,
    debug_options: Vec<String>,
}

pub(crate) fn parse_arguments<T: DeserializeOwned + Default>(arguments: &Value) -> Result<T> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments.clone()).map_err(|err| {
        SessionError::InvalidArguments(sanitize_json_error_message(&err.to_string()))
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn explicit_options(names: &[String], options: &mut DebugOptions) -> Result<()> {
    for name in names {
        let option = name
            .parse::<DebugOption>()
            .map_err(SessionError::InvalidArguments)?;
        options.insert(option);
    }
    Ok(())
}

pub fn resolve_launch(
    arguments: &Value,
    defaults: &DebuggerConfig,
    platform: Platform,
) -> Result<LaunchArguments> {
    let raw: RawLaunchArguments = parse_arguments(arguments)?;

    let target = match (non_empty(raw.module), non_empty(raw.program)) {
        (Some(_), Some(_)) => {
            return Err(SessionError::InvalidArguments(
                "`program` and `module` are mutually exclusive".to_string(),
            ))
        }
        (Some(module), None) => Target::Module(module),
        (None, Some(program)) => Target::Program(PathBuf::from(program)),
        (None, None) => {
            return Err(SessionError::InvalidArguments(
                "launch requires `program` or `module`".to_string(),
            ))
        }
    };

    let cwd = match non_empty(raw.cwd) {
        Some(cwd) => Some(PathBuf::from(cwd)),
        None => match &target {
            Target::Program(program) => program
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf),
            Target::Module(_) => None,
        },
    };

    let mut options = DebugOptions::new();
    if raw.wait_on_abnormal_exit {
        options.insert(DebugOption::WaitOnAbnormalExit);
    }
    if raw.wait_on_normal_exit {
        options.insert(DebugOption::WaitOnNormalExit);
    }
    if raw.debug_std_lib {
        options.insert(DebugOption::DebugStdLib);
    }
    if raw.django {
        options.insert(DebugOption::Django);
    }
    if raw.jinja == Some(true) {
        options.insert(DebugOption::Jinja);
    }
    if raw.redirect_output {
        options.insert(DebugOption::RedirectOutput);
    }
    if raw.sudo {
        options.insert(DebugOption::Sudo);
    }
    if platform.is_case_insensitive() {
        options.insert(DebugOption::FixFilePathCase);
    }
    if let Target::Module(module) = &target {
        // Flask renders Jinja templates; enable template debugging unless opted out.
        if module.eq_ignore_ascii_case("flask") && raw.jinja != Some(false) {
            options.insert(DebugOption::Jinja);
        }
    }
    explicit_options(&raw.debug_options, &mut options)?;

    if raw.port == Some(0) {
        return Err(SessionError::InvalidArguments(
            "`port` must be between 1 and 65535".to_string(),
        ));
    }

    Ok(LaunchArguments {
        target,
        args: raw.args,
        cwd,
        env: raw.env,
        python_path: non_empty(raw.python_path).unwrap_or_else(|| defaults.python_path.clone()),
        port: raw.port,
        debug_options: options,
        no_debug: raw.no_debug,
    })
}

pub fn resolve_attach(
    arguments: &Value,
    defaults: &DebuggerConfig,
    platform: Platform,
) -> Result<AttachArguments> {
    let raw: RawAttachArguments = parse_arguments(arguments)?;

    let port = match raw.port {
        Some(0) | None => {
            return Err(SessionError::InvalidArguments(
                "attach requires a `port` between 1 and 65535".to_string(),
            ))
        }
        Some(port) => port,
    };
    let host = non_empty(raw.host).unwrap_or_else(|| "127.0.0.1".to_string());

    let mut options = DebugOptions::new();
    if raw.debug_std_lib {
        options.insert(DebugOption::DebugStdLib);
    }
    if raw.django {
        options.insert(DebugOption::Django);
    }
    if raw.jinja {
        options.insert(DebugOption::Jinja);
    }
    if raw.redirect_output {
        options.insert(DebugOption::RedirectOutput);
    }
    if platform.is_case_insensitive() && is_local_host(&host) {
        options.insert(DebugOption::FixFilePathCase);
    }
    if platform == Platform::Windows {
        options.insert(DebugOption::WindowsClient);
    }
    explicit_options(&raw.debug_options, &mut options)?;

    let mut path_mappings: Vec<PathMapping> = raw
        .path_mappings
        .into_iter()
        .filter(|m| !m.local_root.is_empty() && !m.remote_root.is_empty())
        .map(|m| PathMapping {
            local_root: m.local_root,
            remote_root: m.remote_root,
        })
        .collect();
    if let (Some(local_root), Some(remote_root)) =
        (non_empty(raw.local_root), non_empty(raw.remote_root))
    {
        path_mappings.push(PathMapping {
            local_root,
            remote_root,
        });
    }

    let timeout = raw
        .timeout
        .map(Duration::from_millis)
        .unwrap_or_else(|| defaults.attach_timeout());

    Ok(AttachArguments {
        host,
        port,
        timeout,
        path_mappings,
        debug_options: options,
    })
}
