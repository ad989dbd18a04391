//! One debug session: DAP requests in, debug-server commands out, and the
//! reverse for events.
//!
//! The session is driven by a single task (see [`crate::server`]). Requests are
//! handled one at a time via [`DebugSession::handle_request`]; wire and process
//! events are pulled with [`DebugSession::next_input`] and applied with
//! [`DebugSession::handle_input`]. Both return the DAP events to emit, which the
//! caller writes after the response so a response always precedes the events
//! that the session observes afterwards.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use pyrite_config::DebuggerConfig;
use pyrite_process::{OutputSource, ProcessEvent, ProcessHandle, SpawnOptions};
use pyrite_wire::{
    BreakpointSpec, EventReceiver, ExceptionMode, StepKind, ThreadId, WireClient, WireError,
    WireEvent,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::args::{DebugOption, DebugOptions, RequestKind};
use crate::config_provider::{self, parse_arguments, Platform};
use crate::connect::{connect_with_retry, ConnectPolicy};
use crate::dap::Request;
use crate::error::{Result, SessionError};
use crate::handles::{StopCache, VariableContainer};
use crate::path_mapping::PathMapper;
use crate::registry::{endpoint_key, AttachGuard, AttachRegistry};
use crate::state::SessionState;
use crate::strategy::{ClientKind, ClientStrategy, LaunchContext};

/// How much trailing stderr is kept for crash reports.
pub const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// How long a debuggee reported as exited by its debug server gets to actually
/// exit before it is killed.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const DETACH_TIMEOUT: Duration = Duration::from_secs(2);

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub debugger: DebuggerConfig,
    pub registry: AttachRegistry,
    pub platform: Platform,
}

impl SessionOptions {
    pub fn new(debugger: DebuggerConfig) -> Self {
        Self {
            debugger,
            registry: AttachRegistry::new(),
            platform: Platform::current(),
        }
    }
}

/// A DAP event produced by the session, without a sequence number yet.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub event: &'static str,
    pub body: Option<Value>,
}

impl SessionEvent {
    fn new(event: &'static str, body: Value) -> Self {
        Self {
            event,
            body: Some(body),
        }
    }

    fn bare(event: &'static str) -> Self {
        Self { event, body: None }
    }

    fn output(category: &str, output: impl Into<String>) -> Self {
        Self::new(
            "output",
            json!({ "category": category, "output": output.into() }),
        )
    }
}

#[derive(Debug, Default)]
pub struct RequestOutcome {
    pub body: Option<Value>,
    /// Emitted after the response.
    pub events: Vec<SessionEvent>,
}

impl RequestOutcome {
    fn empty() -> Self {
        Self::default()
    }

    fn body(body: Value) -> Self {
        Self {
            body: Some(body),
            events: Vec::new(),
        }
    }

    fn with_events(mut self, events: Vec<SessionEvent>) -> Self {
        self.events = events;
        self
    }
}

#[derive(Debug)]
pub enum SessionInput {
    Wire(WireEvent),
    Process(ProcessEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownCause {
    /// `disconnect`/`terminate`, or the editor went away.
    Requested,
    /// The debug server reported the debuggee's exit.
    ServerExited,
    WireClosed,
    ProcessExited,
}

#[derive(Debug, Clone, Copy)]
struct ClientCapabilities {
    supports_variable_paging: bool,
    supports_run_in_terminal: bool,
    supports_variable_type: bool,
    lines_start_at1: bool,
    columns_start_at1: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            supports_variable_paging: false,
            supports_run_in_terminal: false,
            supports_variable_type: false,
            lines_start_at1: true,
            columns_start_at1: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InitializeArguments {
    supports_variable_paging: bool,
    supports_run_in_terminal_request: bool,
    supports_variable_type: bool,
    lines_start_at1: Option<bool>,
    columns_start_at1: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SourceArgument {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SourceBreakpointArgument {
    line: i64,
    column: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetBreakpointsArguments {
    source: SourceArgument,
    breakpoints: Option<Vec<SourceBreakpointArgument>>,
    /// Deprecated DAP form, used when `breakpoints` is absent.
    lines: Option<Vec<i64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetExceptionBreakpointsArguments {
    filters: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ThreadArguments {
    thread_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StackTraceArguments {
    thread_id: Option<i64>,
    start_frame: Option<i64>,
    levels: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScopesArguments {
    frame_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct VariablesArguments {
    variables_reference: Option<i64>,
    start: Option<i64>,
    count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BreakpointRecord {
    id: u32,
    line: u32,
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsTerminateRequest": true,
        "supportsCancelRequest": true,
        "exceptionBreakpointFilters": [
            { "filter": "raised", "label": "Raised Exceptions", "default": false },
            { "filter": "uncaught", "label": "Uncaught Exceptions", "default": true },
        ],
    })
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| SessionError::InvalidArguments(format!("missing `{name}`")))
}

fn thread_id_arg(value: Option<i64>) -> Result<ThreadId> {
    let id = required(value, "threadId")?;
    u64::try_from(id).map_err(|_| SessionError::InvalidReference(id))
}

async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<SessionError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        res = fut => res.map_err(Into::into),
    }
}

async fn reserve_port() -> Result<u16> {
    let listener = TcpListener::bind((LOOPBACK, 0))
        .await
        .map_err(SessionError::PortReservation)?;
    let port = listener
        .local_addr()
        .map_err(SessionError::PortReservation)?
        .port();
    Ok(port)
}

/// Output seen while waiting for a process to exit, and its exit status if it
/// did (`Some(None)` for a signal death).
struct Drained {
    output: Vec<(OutputSource, String)>,
    exit: Option<Option<i32>>,
}

async fn drain_process(process: &mut ProcessHandle, limit: Duration) -> Drained {
    let mut output = Vec::new();
    let mut exit = None;
    let _ = tokio::time::timeout(limit, async {
        while let Some(event) = process.next_event().await {
            match event {
                ProcessEvent::Output { source, text } => output.push((source, text)),
                ProcessEvent::Exited { code } => {
                    exit = Some(code);
                    break;
                }
            }
        }
    })
    .await;
    Drained { output, exit }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn wire_output_category(category: &str) -> &'static str {
    match category {
        "stdout" => "stdout",
        "stderr" => "stderr",
        "important" => "important",
        _ => "console",
    }
}

pub struct DebugSession {
    options: SessionOptions,
    state: SessionState,
    caps: ClientCapabilities,
    kind: Option<RequestKind>,
    strategy: Option<ClientStrategy>,
    debug_options: DebugOptions,
    endpoint: Option<String>,
    wire: Option<WireClient>,
    wire_events: Option<EventReceiver>,
    process: Option<ProcessHandle>,
    attach_guard: Option<AttachGuard>,
    paths: PathMapper,
    breakpoints: BTreeMap<String, Vec<BreakpointRecord>>,
    threads: BTreeMap<ThreadId, String>,
    stop: StopCache,
    exit_code: Option<i32>,
    stderr_tail: String,
}

impl DebugSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            state: SessionState::Uninitialized,
            caps: ClientCapabilities::default(),
            kind: None,
            strategy: None,
            debug_options: DebugOptions::new(),
            endpoint: None,
            wire: None,
            wire_events: None,
            process: None,
            attach_guard: None,
            paths: PathMapper::default(),
            breakpoints: BTreeMap::new(),
            threads: BTreeMap::new(),
            stop: StopCache::default(),
            exit_code: None,
            stderr_tail: String::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    fn client_kind(&self) -> Option<ClientKind> {
        self.strategy.map(|strategy| strategy.kind)
    }

    fn is_no_debug(&self) -> bool {
        self.client_kind() == Some(ClientKind::NoDebug)
    }

    /// Whether the debuggee's own stdout/stderr are forwarded as `output`
    /// events. With `RedirectOutput` the debug server forwards them instead.
    fn relays_process_output(&self) -> bool {
        self.is_no_debug() || !self.debug_options.contains(DebugOption::RedirectOutput)
    }

    fn require(&self, command: &str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::invalid_state(command, self.state))
        }
    }

    fn require_stopped(&self) -> Result<()> {
        if self.state == SessionState::Stopped {
            Ok(())
        } else {
            Err(SessionError::NotStopped)
        }
    }

    fn wire(&self) -> Result<WireClient> {
        self.wire
            .clone()
            .ok_or(SessionError::Wire(WireError::ConnectionClosed))
    }

    fn line_to_client(&self, line: u32) -> i64 {
        let line = i64::from(line);
        if self.caps.lines_start_at1 {
            line
        } else {
            line - 1
        }
    }

    fn line_from_client(&self, line: i64) -> Result<u32> {
        let line = if self.caps.lines_start_at1 {
            line
        } else {
            line + 1
        };
        u32::try_from(line)
            .ok()
            .filter(|line| *line >= 1)
            .ok_or_else(|| SessionError::InvalidArguments(format!("invalid line {line}")))
    }

    fn column_to_client(&self, column: u32) -> i64 {
        let column = i64::from(column);
        if self.caps.columns_start_at1 {
            column
        } else {
            (column - 1).max(0)
        }
    }

    fn column_from_client(&self, column: i64) -> Option<u32> {
        let column = if self.caps.columns_start_at1 {
            column
        } else {
            column + 1
        };
        u32::try_from(column).ok().filter(|column| *column >= 1)
    }

    /// Waits for the next wire or process event. Pending forever when the
    /// session has neither.
    pub async fn next_input(&mut self) -> SessionInput {
        let Self {
            wire_events,
            process,
            ..
        } = self;
        let wire = async {
            match wire_events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            }
        };
        let child = async {
            match process.as_mut() {
                Some(process) => process.next_event().await,
                None => None,
            }
        };
        tokio::select! {
            Some(event) = wire => SessionInput::Wire(event),
            Some(event) = child => SessionInput::Process(event),
            else => std::future::pending().await,
        }
    }

    pub async fn handle_request(
        &mut self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        let command = request.command.as_str();
        let args = &request.arguments;

        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }

        match command {
            "initialize" => self.initialize(args),
            "launch" => self.launch(args, cancel).await,
            "attach" => self.attach(args, cancel).await,
            "setBreakpoints" => self.set_breakpoints(args, cancel).await,
            "setExceptionBreakpoints" => self.set_exception_breakpoints(args, cancel).await,
            "configurationDone" => self.configuration_done(cancel).await,
            "threads" => self.threads_request(cancel).await,
            "stackTrace" => self.stack_trace(args, cancel).await,
            "scopes" => self.scopes(args),
            "variables" => self.variables(args, cancel).await,
            "continue" => self.resume(args, None, cancel).await,
            "next" => self.resume(args, Some(StepKind::Over), cancel).await,
            "stepIn" => self.resume(args, Some(StepKind::Into), cancel).await,
            "stepOut" => self.resume(args, Some(StepKind::Out), cancel).await,
            "disconnect" | "terminate" => {
                let events = self.teardown(TeardownCause::Requested).await;
                Ok(RequestOutcome::empty().with_events(events))
            }
            other => Err(SessionError::Unsupported(other.to_string())),
        }
    }

    fn initialize(&mut self, arguments: &Value) -> Result<RequestOutcome> {
        self.require("initialize", &[SessionState::Uninitialized])?;
        let args: InitializeArguments = parse_arguments(arguments)?;
        self.caps = ClientCapabilities {
            supports_variable_paging: args.supports_variable_paging,
            supports_run_in_terminal: args.supports_run_in_terminal_request,
            supports_variable_type: args.supports_variable_type,
            lines_start_at1: args.lines_start_at1.unwrap_or(true),
            columns_start_at1: args.columns_start_at1.unwrap_or(true),
        };
        tracing::debug!(
            target = "pyrite.dap",
            paging = self.caps.supports_variable_paging,
            run_in_terminal = self.caps.supports_run_in_terminal,
            "editor capabilities recorded"
        );
        self.state = SessionState::Initializing;
        Ok(RequestOutcome::body(capabilities()))
    }

    async fn launch(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        self.require("launch", &[SessionState::Initializing])?;
        let args = config_provider::resolve_launch(
            arguments,
            &self.options.debugger,
            self.options.platform,
        )?;
        let strategy = ClientStrategy::select(RequestKind::Launch, args.no_debug);

        let mut guard = None;
        let port = if strategy.uses_wire_protocol {
            let port = match args.port {
                Some(port) => port,
                None => reserve_port().await?,
            };
            guard = Some(self.options.registry.claim(endpoint_key(LOOPBACK, port))?);
            port
        } else {
            0
        };

        let debugger = &self.options.debugger;
        let cx = LaunchContext {
            launcher_script: debugger.launcher_script.as_deref(),
            no_debug_launcher_script: debugger.no_debug_launcher_script.as_deref(),
            port,
        };
        let argv = strategy.launch_args(&args, &cx)?.unwrap_or_default();
        let spawn_options = SpawnOptions {
            cwd: args.cwd.clone(),
            env: args.env.clone(),
            cancellation: None,
            kill_grace: debugger.kill_grace(),
        };

        let mut process = pyrite_process::spawn(Path::new(&args.python_path), &argv, spawn_options)
            .map_err(|source| SessionError::Spawn {
                command: args.python_path.clone(),
                source,
            })?;
        tracing::info!(
            target = "pyrite.dap",
            pid = process.pid(),
            command = %process.command(),
            no_debug = args.no_debug,
            "launched debuggee"
        );

        let mut connection = None;
        if strategy.uses_wire_protocol {
            let policy = ConnectPolicy::from_config(debugger, debugger.launch_timeout());
            let exited = process.exited_token();
            let connected = tokio::select! {
                res = connect_with_retry(LOOPBACK, port, &policy, cancel) => Some(res),
                _ = exited.cancelled() => None,
            };
            let (client, events) = match connected {
                Some(Ok(connected)) => connected,
                Some(Err(err)) => {
                    process.kill();
                    return Err(err);
                }
                None => {
                    let drained = drain_process(&mut process, EXIT_DRAIN_TIMEOUT).await;
                    let stderr = drained
                        .output
                        .into_iter()
                        .filter(|(source, _)| *source == OutputSource::Stderr)
                        .map(|(_, text)| text)
                        .collect::<String>();
                    return Err(SessionError::EarlyExit {
                        code: drained.exit.flatten(),
                        stderr,
                    });
                }
            };

            let options = args.debug_options.to_wire();
            if let Err(err) = cancellable(cancel, client.set_debug_options(&options)).await {
                client.close().await;
                process.kill();
                return Err(err);
            }
            connection = Some((client, events));
        }

        self.kind = Some(RequestKind::Launch);
        self.strategy = Some(strategy);
        self.paths = PathMapper::new(
            Vec::new(),
            args.debug_options.contains(DebugOption::FixFilePathCase),
        );
        self.debug_options = args.debug_options;
        self.endpoint = guard.as_ref().map(|guard| guard.endpoint().to_string());
        self.attach_guard = guard;
        if let Some((client, events)) = connection {
            self.wire = Some(client);
            self.wire_events = Some(events);
        }
        self.process = Some(process);
        self.state = SessionState::Configuring;
        Ok(RequestOutcome::empty().with_events(vec![SessionEvent::bare("initialized")]))
    }

    async fn attach(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        if self.kind == Some(RequestKind::Attach) {
            return Err(SessionError::AlreadyAttached(
                self.endpoint.clone().unwrap_or_default(),
            ));
        }
        self.require("attach", &[SessionState::Initializing])?;
        let args = config_provider::resolve_attach(
            arguments,
            &self.options.debugger,
            self.options.platform,
        )?;

        let guard = self
            .options
            .registry
            .claim(endpoint_key(&args.host, args.port))?;
        let policy = ConnectPolicy::from_config(&self.options.debugger, args.timeout);
        let (client, events) = connect_with_retry(&args.host, args.port, &policy, cancel).await?;

        let options = args.debug_options.to_wire();
        if let Err(err) = cancellable(cancel, client.set_debug_options(&options)).await {
            client.close().await;
            return Err(err);
        }
        tracing::info!(
            target = "pyrite.dap",
            endpoint = guard.endpoint(),
            "attached to debug server"
        );

        self.kind = Some(RequestKind::Attach);
        self.strategy = Some(ClientStrategy::select(RequestKind::Attach, false));
        self.paths = PathMapper::new(
            args.path_mappings,
            args.debug_options.contains(DebugOption::FixFilePathCase),
        );
        self.debug_options = args.debug_options;
        self.endpoint = Some(guard.endpoint().to_string());
        self.attach_guard = Some(guard);
        self.wire = Some(client);
        self.wire_events = Some(events);
        self.state = SessionState::Configuring;
        Ok(RequestOutcome::empty().with_events(vec![SessionEvent::bare("initialized")]))
    }

    async fn set_breakpoints(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        // Without a debug server the editor may still edit breakpoints while
        // the program runs; they are answered unverified.
        let allowed: &[SessionState] = if self.is_no_debug() {
            &[SessionState::Configuring, SessionState::Running]
        } else {
            &[SessionState::Configuring, SessionState::Stopped]
        };
        self.require("setBreakpoints", allowed)?;
        let args: SetBreakpointsArguments = parse_arguments(arguments)?;
        let path = required(args.source.path, "source.path")?;

        let requested: Vec<(i64, Option<i64>)> = match (args.breakpoints, args.lines) {
            (Some(breakpoints), _) => breakpoints
                .into_iter()
                .map(|bp| (bp.line, bp.column))
                .collect(),
            (None, Some(lines)) => lines.into_iter().map(|line| (line, None)).collect(),
            (None, None) => Vec::new(),
        };
        let mut specs = Vec::with_capacity(requested.len());
        for (line, column) in requested {
            specs.push(BreakpointSpec {
                line: self.line_from_client(line)?,
                column: column.and_then(|column| self.column_from_client(column)),
            });
        }

        if self.is_no_debug() {
            let breakpoints: Vec<Value> = specs
                .iter()
                .map(|spec| {
                    json!({
                        "verified": false,
                        "line": self.line_to_client(spec.line),
                        "message": "debugging is disabled for this session",
                    })
                })
                .collect();
            return Ok(RequestOutcome::body(json!({ "breakpoints": breakpoints })));
        }

        let key = self.paths.key(&path);
        let remote = self.paths.to_remote(&path);
        let wire = self.wire()?;
        let acks = cancellable(cancel, wire.set_breakpoints(&remote, &specs)).await?;

        let records: Vec<BreakpointRecord> = acks
            .iter()
            .map(|ack| BreakpointRecord {
                id: ack.id,
                line: ack.line,
            })
            .collect();
        tracing::debug!(
            target = "pyrite.dap",
            path = %remote,
            count = records.len(),
            "breakpoints replaced"
        );
        if records.is_empty() {
            self.breakpoints.remove(&key);
        } else {
            self.breakpoints.insert(key, records);
        }

        let breakpoints: Vec<Value> = acks
            .iter()
            .map(|ack| {
                let mut bp = json!({
                    "id": ack.id,
                    "verified": ack.verified,
                    "line": self.line_to_client(ack.line),
                    "source": { "name": file_name(&path), "path": path },
                });
                if let Some(message) = &ack.message {
                    bp["message"] = json!(message);
                }
                bp
            })
            .collect();
        Ok(RequestOutcome::body(json!({ "breakpoints": breakpoints })))
    }

    async fn set_exception_breakpoints(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        self.require(
            "setExceptionBreakpoints",
            &[
                SessionState::Configuring,
                SessionState::Running,
                SessionState::Stopped,
            ],
        )?;
        let args: SetExceptionBreakpointsArguments = parse_arguments(arguments)?;
        let mut mode = ExceptionMode::default();
        for filter in &args.filters {
            match filter.as_str() {
                "raised" => mode.raised = true,
                "uncaught" => mode.uncaught = true,
                other => {
                    tracing::debug!(target = "pyrite.dap", filter = other, "ignoring unknown exception filter")
                }
            }
        }
        if self.is_no_debug() {
            return Ok(RequestOutcome::empty());
        }
        let wire = self.wire()?;
        cancellable(cancel, wire.set_exception_mode(mode)).await?;
        Ok(RequestOutcome::empty())
    }

    async fn configuration_done(&mut self, cancel: &CancellationToken) -> Result<RequestOutcome> {
        self.require("configurationDone", &[SessionState::Configuring])?;
        if !self.is_no_debug() {
            let wire = self.wire()?;
            cancellable(cancel, wire.configuration_done()).await?;
        }
        self.state = SessionState::Running;
        Ok(RequestOutcome::empty())
    }

    async fn threads_request(&mut self, cancel: &CancellationToken) -> Result<RequestOutcome> {
        if self.is_no_debug() {
            return Ok(RequestOutcome::body(json!({ "threads": [] })));
        }
        self.require_stopped()?;

        let threads = match self.stop.threads() {
            Some(threads) => threads.to_vec(),
            None => {
                let wire = self.wire()?;
                let threads = cancellable(cancel, wire.threads()).await?;
                self.stop.store_threads(threads).to_vec()
            }
        };
        for thread in &threads {
            self.threads.insert(thread.id, thread.name.clone());
        }
        let threads: Vec<Value> = threads
            .iter()
            .map(|thread| json!({ "id": thread.id, "name": thread.name }))
            .collect();
        Ok(RequestOutcome::body(json!({ "threads": threads })))
    }

    async fn stack_trace(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        self.require_stopped()?;
        let args: StackTraceArguments = parse_arguments(arguments)?;
        let raw_thread = required(args.thread_id, "threadId")?;
        let thread_id = thread_id_arg(args.thread_id)?;

        let entries = match self.stop.stack(thread_id) {
            Some(entries) => entries.to_vec(),
            None => {
                let wire = self.wire()?;
                let frames = cancellable(cancel, async {
                    wire.frames(thread_id)
                        .await
                        .map_err(|err| SessionError::from_wire(err, raw_thread))
                })
                .await?;
                self.stop.store_stack(thread_id, frames).to_vec()
            }
        };

        let total = entries.len();
        let start = usize::try_from(args.start_frame.unwrap_or(0).max(0)).unwrap_or(0);
        let levels = args
            .levels
            .filter(|levels| *levels > 0)
            .and_then(|levels| usize::try_from(levels).ok())
            .unwrap_or(total);

        let frames: Vec<Value> = entries
            .iter()
            .skip(start)
            .take(levels)
            .map(|entry| {
                let local = self.paths.to_local(&entry.frame.path);
                json!({
                    "id": entry.id,
                    "name": entry.frame.name,
                    "line": self.line_to_client(entry.frame.line),
                    "column": self.column_to_client(entry.frame.column),
                    "source": { "name": file_name(&local), "path": local },
                })
            })
            .collect();
        Ok(RequestOutcome::body(
            json!({ "stackFrames": frames, "totalFrames": total }),
        ))
    }

    fn scopes(&mut self, arguments: &Value) -> Result<RequestOutcome> {
        self.require_stopped()?;
        let args: ScopesArguments = parse_arguments(arguments)?;
        let frame_id = required(args.frame_id, "frameId")?;
        let reference = self
            .stop
            .locals_reference(frame_id)
            .ok_or(SessionError::InvalidReference(frame_id))?;
        Ok(RequestOutcome::body(json!({
            "scopes": [{
                "name": "Locals",
                "presentationHint": "locals",
                "variablesReference": reference,
                "expensive": false,
            }],
        })))
    }

    async fn variables(
        &mut self,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        self.require_stopped()?;
        let args: VariablesArguments = parse_arguments(arguments)?;
        let reference = required(args.variables_reference, "variablesReference")?;

        let variables = match self.stop.children(reference) {
            Some(variables) => variables.to_vec(),
            None => {
                let container = self
                    .stop
                    .container(reference)
                    .ok_or(SessionError::InvalidReference(reference))?;
                let wire = self.wire()?;
                let values = cancellable(cancel, async {
                    let values = match container {
                        VariableContainer::Locals(frame) => wire.frame_variables(frame).await,
                        VariableContainer::Children(parent) => wire.children(parent).await,
                    };
                    values.map_err(|err| SessionError::from_wire(err, reference))
                })
                .await?;
                self.stop.store_children(reference, values).to_vec()
            }
        };

        let start = usize::try_from(args.start.unwrap_or(0).max(0)).unwrap_or(0);
        let count = args
            .count
            .filter(|count| *count > 0)
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(usize::MAX);
        let include_type = self.caps.supports_variable_type;
        let variables: Vec<Value> = variables
            .into_iter()
            .skip(start)
            .take(count)
            .map(|mut variable| {
                if !include_type {
                    variable.type_name = None;
                }
                json!(variable)
            })
            .collect();
        Ok(RequestOutcome::body(json!({ "variables": variables })))
    }

    async fn resume(
        &mut self,
        arguments: &Value,
        step: Option<StepKind>,
        cancel: &CancellationToken,
    ) -> Result<RequestOutcome> {
        self.require_stopped()?;
        let args: ThreadArguments = parse_arguments(arguments)?;
        let wire = self.wire()?;
        let thread_id = match step {
            Some(_) => thread_id_arg(args.thread_id)?,
            None => args
                .thread_id
                .and_then(|id| u64::try_from(id).ok())
                .unwrap_or(0),
        };

        // Ids handed out during this stop die here, before the debuggee moves.
        self.stop.invalidate();
        self.state = SessionState::Running;

        let reference = i64::try_from(thread_id).unwrap_or(i64::MAX);
        let resumed = cancellable(cancel, async {
            let res = match step {
                None => wire.resume(0).await,
                Some(kind) => wire.step(thread_id, kind).await,
            };
            res.map_err(|err| SessionError::from_wire(err, reference))
        })
        .await;
        match resumed {
            Ok(()) => {}
            // Rejected thread: the debuggee never moved.
            Err(err @ SessionError::InvalidReference(_)) => {
                self.state = SessionState::Stopped;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let continued = SessionEvent::new(
            "continued",
            json!({ "threadId": thread_id, "allThreadsContinued": true }),
        );
        let outcome = match step {
            None => RequestOutcome::body(json!({ "allThreadsContinued": true })),
            Some(_) => RequestOutcome::empty(),
        };
        Ok(outcome.with_events(vec![continued]))
    }

    pub async fn handle_input(&mut self, input: SessionInput) -> Vec<SessionEvent> {
        if self.state == SessionState::Terminated {
            return Vec::new();
        }
        match input {
            SessionInput::Wire(event) => self.on_wire_event(event).await,
            SessionInput::Process(event) => self.on_process_event(event).await,
        }
    }

    async fn on_wire_event(&mut self, event: WireEvent) -> Vec<SessionEvent> {
        match event {
            WireEvent::ThreadCreated { thread } => {
                let id = thread.id;
                self.threads.insert(thread.id, thread.name);
                vec![SessionEvent::new(
                    "thread",
                    json!({ "reason": "started", "threadId": id }),
                )]
            }
            WireEvent::ThreadExited { thread_id } => {
                self.threads.remove(&thread_id);
                vec![SessionEvent::new(
                    "thread",
                    json!({ "reason": "exited", "threadId": thread_id }),
                )]
            }
            WireEvent::BreakpointHit {
                thread_id,
                breakpoint_id,
            } => {
                let mut body = json!({ "reason": "breakpoint" });
                match self.find_breakpoint(breakpoint_id) {
                    Some(record) => {
                        tracing::debug!(
                            target = "pyrite.dap",
                            breakpoint_id,
                            line = record.line,
                            "breakpoint hit"
                        );
                        body["hitBreakpointIds"] = json!([breakpoint_id]);
                    }
                    // Server-side breakpoints the editor never set.
                    None => tracing::debug!(target = "pyrite.dap", breakpoint_id, "unknown breakpoint hit"),
                }
                self.on_stop(thread_id, body)
            }
            WireEvent::StepComplete { thread_id } => {
                self.on_stop(thread_id, json!({ "reason": "step" }))
            }
            WireEvent::ExceptionRaised {
                thread_id,
                description,
            } => self.on_stop(
                thread_id,
                json!({ "reason": "exception", "description": description, "text": description }),
            ),
            WireEvent::Output { category, text } => {
                vec![SessionEvent::output(wire_output_category(&category), text)]
            }
            WireEvent::ProcessExited { exit_code } => {
                self.exit_code = Some(exit_code);
                self.teardown(TeardownCause::ServerExited).await
            }
            WireEvent::Disconnected { reason } => {
                tracing::info!(target = "pyrite.dap", reason = %reason, "debug server connection closed");
                self.wire_events = None;
                self.teardown(TeardownCause::WireClosed).await
            }
        }
    }

    fn find_breakpoint(&self, id: u32) -> Option<&BreakpointRecord> {
        self.breakpoints
            .values()
            .flatten()
            .find(|record| record.id == id)
    }

    fn on_stop(&mut self, thread_id: ThreadId, mut body: Value) -> Vec<SessionEvent> {
        if !self.state.accepts_stop() {
            tracing::warn!(
                target = "pyrite.dap",
                state = %self.state,
                thread_id,
                "ignoring stop event outside of execution"
            );
            return Vec::new();
        }
        self.stop.invalidate();
        self.state = SessionState::Stopped;
        body["threadId"] = json!(thread_id);
        body["allThreadsStopped"] = json!(true);
        vec![SessionEvent::new("stopped", body)]
    }

    async fn on_process_event(&mut self, event: ProcessEvent) -> Vec<SessionEvent> {
        match event {
            ProcessEvent::Output { source, text } => self.record_process_output(source, text),
            ProcessEvent::Exited { code } => {
                tracing::info!(target = "pyrite.dap", code = ?code, "debuggee exited");
                if self.exit_code.is_none() {
                    self.exit_code = code;
                }
                self.teardown(TeardownCause::ProcessExited).await
            }
        }
    }

    fn record_process_output(&mut self, source: OutputSource, text: String) -> Vec<SessionEvent> {
        if source == OutputSource::Stderr {
            self.stderr_tail.push_str(&text);
            if self.stderr_tail.len() > STDERR_TAIL_BYTES {
                let mut cut = self.stderr_tail.len() - STDERR_TAIL_BYTES;
                while !self.stderr_tail.is_char_boundary(cut) {
                    cut += 1;
                }
                self.stderr_tail.drain(..cut);
            }
        }
        if self.relays_process_output() {
            vec![SessionEvent::output(source.as_category(), text)]
        } else {
            Vec::new()
        }
    }

    /// Ends the session because the editor went away.
    pub async fn shutdown(&mut self) -> Vec<SessionEvent> {
        self.teardown(TeardownCause::Requested).await
    }

    async fn teardown(&mut self, cause: TeardownCause) -> Vec<SessionEvent> {
        if self.state.is_finished() {
            return Vec::new();
        }
        tracing::debug!(target = "pyrite.dap", state = %self.state, cause = ?cause, "tearing down session");
        self.state = SessionState::Terminating;
        let mut events = Vec::new();

        // Output the server sent ahead of the exit/close is still queued.
        if let Some(mut pending) = self.wire_events.take() {
            while let Ok(event) = pending.try_recv() {
                if let WireEvent::Output { category, text } = event {
                    events.push(SessionEvent::output(wire_output_category(&category), text));
                }
            }
        }

        if let Some(wire) = self.wire.take() {
            let detach = self.kind == Some(RequestKind::Attach)
                && cause == TeardownCause::Requested
                && !wire.is_closed();
            if detach {
                match tokio::time::timeout(DETACH_TIMEOUT, wire.detach()).await {
                    Ok(Ok(())) => tracing::debug!(target = "pyrite.dap", "detached from debug server"),
                    Ok(Err(err)) => {
                        tracing::warn!(target = "pyrite.dap", error = %err, "detach failed")
                    }
                    Err(_) => tracing::warn!(target = "pyrite.dap", "detach timed out"),
                }
            }
            wire.close().await;
        }

        if let Some(mut process) = self.process.take() {
            let owned = self
                .strategy
                .is_some_and(|strategy| strategy.owns_process_lifecycle);
            let settle = self.options.debugger.kill_grace() + Duration::from_secs(2);
            let mut drained = if cause == TeardownCause::ServerExited {
                drain_process(&mut process, EXIT_DRAIN_TIMEOUT).await
            } else {
                Drained {
                    output: Vec::new(),
                    exit: None,
                }
            };
            if drained.exit.is_none() && !process.has_exited() {
                if owned {
                    process.kill();
                } else {
                    tracing::debug!(target = "pyrite.dap", pid = process.pid(), "leaving debuggee running");
                }
            }
            if drained.exit.is_none() && (owned || process.has_exited()) {
                let rest = drain_process(&mut process, settle).await;
                drained.output.extend(rest.output);
                drained.exit = rest.exit;
            }
            for (source, text) in drained.output {
                events.extend(self.record_process_output(source, text));
            }
            if self.exit_code.is_none() {
                self.exit_code = drained.exit.flatten();
            }
        }

        let crashed = matches!(
            cause,
            TeardownCause::WireClosed | TeardownCause::ProcessExited
        ) && self.exit_code != Some(0);
        let tail = self.stderr_tail.trim_end();
        if crashed && !self.relays_process_output() && !tail.is_empty() {
            events.push(SessionEvent::output(
                "console",
                format!("debuggee terminated unexpectedly:\n{tail}\n"),
            ));
        }

        self.attach_guard = None;
        self.stop.invalidate();
        self.threads.clear();
        if let Some(code) = self.exit_code {
            events.push(SessionEvent::new("exited", json!({ "exitCode": code })));
        }
        events.push(SessionEvent::bare("terminated"));
        self.state = SessionState::Terminated;
        tracing::info!(target = "pyrite.dap", exit_code = ?self.exit_code, "session terminated");
        events
    }
}
