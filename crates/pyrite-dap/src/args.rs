//! Fully resolved `launch`/`attach` arguments. Built by
//! [`crate::config_provider`] and immutable for the lifetime of a session.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Launch,
    Attach,
}

/// Flags forwarded to the embedded debug server with `SetDebugOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DebugOption {
    RedirectOutput,
    FixFilePathCase,
    DebugStdLib,
    WaitOnAbnormalExit,
    WaitOnNormalExit,
    Django,
    Jinja,
    Sudo,
    WindowsClient,
}

impl DebugOption {
    pub const ALL: [DebugOption; 9] = [
        DebugOption::RedirectOutput,
        DebugOption::FixFilePathCase,
        DebugOption::DebugStdLib,
        DebugOption::WaitOnAbnormalExit,
        DebugOption::WaitOnNormalExit,
        DebugOption::Django,
        DebugOption::Jinja,
        DebugOption::Sudo,
        DebugOption::WindowsClient,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DebugOption::RedirectOutput => "RedirectOutput",
            DebugOption::FixFilePathCase => "FixFilePathCase",
            DebugOption::DebugStdLib => "DebugStdLib",
            DebugOption::WaitOnAbnormalExit => "WaitOnAbnormalExit",
            DebugOption::WaitOnNormalExit => "WaitOnNormalExit",
            DebugOption::Django => "Django",
            DebugOption::Jinja => "Jinja",
            DebugOption::Sudo => "Sudo",
            DebugOption::WindowsClient => "WindowsClient",
        }
    }
}

impl fmt::Display for DebugOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DebugOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DebugOption::ALL
            .into_iter()
            .find(|option| option.as_str() == s)
            .ok_or_else(|| format!("unknown debug option `{s}`"))
    }
}

/// Ordered set of debug options; insertion order is kept so the wire payload
/// is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugOptions(Vec<DebugOption>);

impl DebugOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, option: DebugOption) {
        if !self.0.contains(&option) {
            self.0.push(option);
        }
    }

    pub fn contains(&self, option: DebugOption) -> bool {
        self.0.contains(&option)
    }

    pub fn iter(&self) -> impl Iterator<Item = DebugOption> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_wire(&self) -> Vec<String> {
        self.0.iter().map(|option| option.as_str().to_string()).collect()
    }
}

impl FromIterator<DebugOption> for DebugOptions {
    fn from_iter<I: IntoIterator<Item = DebugOption>>(iter: I) -> Self {
        let mut options = DebugOptions::new();
        for option in iter {
            options.insert(option);
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Program(PathBuf),
    Module(String),
}

impl Target {
    /// Interpreter arguments selecting what to run: `-m module` or the script path.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Target::Program(path) => vec![path.to_string_lossy().into_owned()],
            Target::Module(module) => vec!["-m".to_string(), module.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArguments {
    pub target: Target,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub python_path: String,
    /// Port the debug server should listen on; picked by the adapter when absent.
    pub port: Option<u16>,
    pub debug_options: DebugOptions,
    pub no_debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local_root: String,
    pub remote_root: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachArguments {
    pub host: String,
    pub port: u16,
    /// Overall budget for reaching the debug server, retries included.
    pub timeout: Duration,
    pub path_mappings: Vec<PathMapping>,
    pub debug_options: DebugOptions,
}
