//! Adapter configuration and structured logging.
//!
//! Configuration is loaded once by the binary and passed down explicitly;
//! nothing in the adapter reads settings from global state.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Once, OnceLock, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriter, MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Environment variable naming a config file when `--config` is not given.
pub const CONFIG_ENV_VAR: &str = "PYRITE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PyriteConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debugger: DebuggerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Either a plain level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string such as `pyrite.wire=trace,info`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr. Stdout is never used: it carries DAP traffic in
    /// stdio mode.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. If the file cannot be opened, file
    /// logging is skipped and the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective filter: the configured level, with `RUST_LOG` merged on top
    /// when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

/// Defaults for launching and connecting to debuggees. Request arguments
/// override the per-request values (interpreter path, attach timeout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Interpreter used when a launch request does not name one.
    pub python_path: String,
    /// Script that starts the debuggee with the embedded debug server. Invoked
    /// as `launcher cwd port (-m module | program) args...`.
    pub launcher_script: Option<PathBuf>,
    /// Optional wrapper for no-debug launches. Invoked as
    /// `script cwd (-m module | program) args...`.
    pub no_debug_launcher_script: Option<PathBuf>,
    /// Bound on a single TCP connect attempt.
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    /// Overall budget for reaching a remote debug server on `attach`.
    pub attach_timeout_ms: u64,
    /// Overall budget for reaching the debug server of a launched debuggee.
    pub launch_timeout_ms: u64,
    pub connect_backoff_initial_ms: u64,
    pub connect_backoff_max_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping a launched debuggee.
    pub kill_grace_ms: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            python_path: "python".to_owned(),
            launcher_script: None,
            no_debug_launcher_script: None,
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 5_000,
            reply_timeout_ms: 10_000,
            attach_timeout_ms: 5_000,
            launch_timeout_ms: 20_000,
            connect_backoff_initial_ms: 50,
            connect_backoff_max_ms: 1_000,
            kill_grace_ms: 250,
        }
    }
}

impl DebuggerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_initial_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_max_ms.max(self.connect_backoff_initial_ms))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

/// Strip user-supplied values from a TOML/serde message so config contents
/// never end up in logs or editor error popups.
fn sanitize_toml_error_message(message: &str) -> String {
    static QUOTED_STRING_RE: OnceLock<regex::Regex> = OnceLock::new();
    static BACKTICK_VALUE_RE: OnceLock<regex::Regex> = OnceLock::new();

    let quoted = QUOTED_STRING_RE.get_or_init(|| {
        regex::Regex::new(r#""(?:\\.|[^"\\])*"|'(?:\\.|[^'\\])*'"#)
            .expect("quoted-string regex should compile")
    });
    let out = quoted.replace_all(message, r#""<redacted>""#).into_owned();

    // `invalid type: integer `123`, expected ...`: redact the scalar but keep
    // the expected-type suffix.
    let backtick = BACKTICK_VALUE_RE.get_or_init(|| {
        regex::Regex::new(r"(invalid (?:type|value): [a-z ]*)`[^`]*`")
            .expect("backtick regex should compile")
    });
    backtick.replace_all(&out, "$1`<redacted>`").into_owned()
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

impl PyriteConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// `explicit` if given, else the file named by [`CONFIG_ENV_VAR`], else
    /// defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
            Some(path) => Self::load_from_path(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        MutexFileWriter {
            guard: self.file.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

struct MutexFileWriter<'a> {
    guard: std::sync::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if config.stderr {
            // Test harnesses only capture output written through the stdlib
            // print macros.
            if cfg!(debug_assertions) {
                make_writer = BoxMakeWriter::new(
                    make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
                );
            } else {
                make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
            }
        }
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(MutexFileMakeWriter { file }));
        }

        let result = if config.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        };

        if result.is_err() {
            // Another subscriber (e.g. a test harness) got there first.
            tracing::debug!("tracing subscriber already installed");
        }
    });
}
