use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{encode_event, encode_reply, PacketHeader, WireReader, WireWriter, HANDSHAKE, HEADER_LEN},
    types::{
        BreakpointAck, ExceptionMode, FrameInfo, StepKind, ThreadInfo, VariableInfo, WireEvent,
        CMD_CHILDREN, CMD_CONFIGURATION_DONE, CMD_DETACH, CMD_FRAMES, CMD_FRAME_VARIABLES,
        CMD_RESUME, CMD_SET_BREAKPOINTS, CMD_SET_DEBUG_OPTIONS, CMD_SET_EXCEPTION_MODE, CMD_STEP,
        CMD_THREADS, ERROR_INVALID_ARGUMENT, ERROR_INVALID_REFERENCE, ERROR_NOT_SUSPENDED,
        ERROR_UNKNOWN_COMMAND,
    },
};

pub const MAIN_THREAD_ID: u64 = 1;
pub const MAIN_THREAD_NAME: &str = "MainThread";

/// A small in-process debug server used by tests.
///
/// It models a single-threaded script that runs from top to bottom: after
/// `ConfigurationDone` or `Resume` it stops at the next breakpoint line (over
/// all files), or raises the configured exception, or exits.
pub struct MockDebugServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockDebugServerConfig {
    /// Lines that never verify; breakpoints there are acknowledged with
    /// `verified: false`.
    pub unverifiable_lines: Vec<u32>,
    /// Line at which the script raises, reported through `ExceptionRaised` if
    /// the exception mode asks for it.
    pub exception_at_line: Option<u32>,
    /// Exit code reported in `ProcessExited` when the script runs off the end.
    pub exit_code: i32,
    /// Text written to stdout right before the script exits.
    pub exit_output: Option<String>,
    /// When set, running off the end keeps the script alive instead of
    /// exiting. Useful for attach tests where the debuggee must outlive the
    /// session.
    pub hold_on_resume: bool,
    /// Write every packet one byte at a time.
    pub fragment_writes: bool,
    /// Delay before every reply. Other commands are still served meanwhile.
    pub reply_delay: Option<Duration>,
    /// Sent once, right before the first `SetBreakpoints` reply while suspended.
    pub event_before_breakpoint_ack: Option<WireEvent>,
}

impl Default for MockDebugServerConfig {
    fn default() -> Self {
        Self {
            unverifiable_lines: Vec::new(),
            exception_at_line: None,
            exit_code: 0,
            exit_output: None,
            hold_on_resume: false,
            fragment_writes: false,
            reply_delay: None,
            event_before_breakpoint_ack: None,
        }
    }
}

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

#[derive(Debug, Default)]
struct Program {
    current_path: String,
    current_line: u32,
    suspended: bool,
    exception_raised: bool,
    exited: bool,
    /// Frames, locals and children handed out during the current stop.
    frames: Option<Vec<FrameInfo>>,
    locals: HashMap<u64, Vec<VariableInfo>>,
    children: HashMap<u64, Vec<VariableInfo>>,
}

impl Program {
    fn resume(&mut self) {
        self.suspended = false;
        self.frames = None;
        self.locals.clear();
        self.children.clear();
    }
}

struct Connection {
    writer: SharedWriter,
    kill: CancellationToken,
}

struct State {
    config: MockDebugServerConfig,
    next_object_id: AtomicU64,
    next_breakpoint_id: AtomicU32,
    connections: AtomicU32,
    detach_calls: AtomicU32,
    resume_calls: AtomicU32,
    step_calls: AtomicU32,
    configuration_done_calls: AtomicU32,
    breakpoints: Mutex<BTreeMap<String, Vec<BreakpointAck>>>,
    debug_options: Mutex<Vec<String>>,
    exception_mode: Mutex<ExceptionMode>,
    program: Mutex<Program>,
    event_before_ack_sent: Mutex<bool>,
    active: Mutex<Vec<Connection>>,
}

impl State {
    fn new(config: MockDebugServerConfig) -> Self {
        Self {
            config,
            next_object_id: AtomicU64::new(1000),
            next_breakpoint_id: AtomicU32::new(1),
            connections: AtomicU32::new(0),
            detach_calls: AtomicU32::new(0),
            resume_calls: AtomicU32::new(0),
            step_calls: AtomicU32::new(0),
            configuration_done_calls: AtomicU32::new(0),
            breakpoints: Mutex::new(BTreeMap::new()),
            debug_options: Mutex::new(Vec::new()),
            exception_mode: Mutex::new(ExceptionMode::default()),
            program: Mutex::new(Program::default()),
            event_before_ack_sent: Mutex::new(false),
            active: Mutex::new(Vec::new()),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl MockDebugServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockDebugServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockDebugServerConfig) -> std::io::Result<Self> {
        Self::bind(0, config).await
    }

    /// Listen on a fixed loopback port, e.g. one handed to a launcher earlier.
    pub async fn spawn_on_port(port: u16) -> std::io::Result<Self> {
        Self::bind(port, MockDebugServerConfig::default()).await
    }

    pub async fn spawn_on_port_with_config(
        port: u16,
        config: MockDebugServerConfig,
    ) -> std::io::Result<Self> {
        Self::bind(port, config).await
    }

    async fn bind(port: u16, config: MockDebugServerConfig) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::new(config));

        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Server-side breakpoint lines for `path`, sorted.
    pub fn breakpoint_lines(&self, path: &str) -> Vec<u32> {
        let breakpoints = self.state.breakpoints.lock();
        let mut lines: Vec<u32> = breakpoints
            .get(path)
            .map(|acks| acks.iter().map(|ack| ack.line).collect())
            .unwrap_or_default();
        lines.sort_unstable();
        lines
    }

    pub fn debug_options(&self) -> Vec<String> {
        self.state.debug_options.lock().clone()
    }

    pub fn exception_mode(&self) -> ExceptionMode {
        *self.state.exception_mode.lock()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.program.lock().suspended
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.state
            .active
            .lock()
            .iter()
            .filter(|conn| !conn.kill.is_cancelled())
            .count()
    }

    pub fn detach_calls(&self) -> u32 {
        self.state.detach_calls.load(Ordering::Relaxed)
    }

    pub fn resume_calls(&self) -> u32 {
        self.state.resume_calls.load(Ordering::Relaxed)
    }

    pub fn step_calls(&self) -> u32 {
        self.state.step_calls.load(Ordering::Relaxed)
    }

    pub fn configuration_done_calls(&self) -> u32 {
        self.state.configuration_done_calls.load(Ordering::Relaxed)
    }

    /// Push an event to every connected client.
    pub async fn send_event(&self, event: &WireEvent) -> std::io::Result<()> {
        let Some(packet) = encode_event(event) else {
            return Ok(());
        };
        let writers: Vec<SharedWriter> = self
            .state
            .active
            .lock()
            .iter()
            .filter(|conn| !conn.kill.is_cancelled())
            .map(|conn| conn.writer.clone())
            .collect();
        for writer in writers {
            write_packet(&writer, &packet, self.state.config.fragment_writes).await?;
        }
        Ok(())
    }

    /// Simulate the debuggee dying: every open connection is dropped without a
    /// reply.
    pub fn drop_connections(&self) {
        let mut active = self.state.active.lock();
        for conn in active.drain(..) {
            conn.kill.cancel();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockDebugServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((socket, _peer)) = accepted else {
            continue;
        };
        let state = state.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = serve(socket, state, shutdown).await {
                tracing::debug!(target = "pyrite.wire", error = %err, "mock connection ended");
            }
        });
    }
}

async fn serve(
    mut socket: tokio::net::TcpStream,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut hs = [0u8; HANDSHAKE.len()];
    socket.read_exact(&mut hs).await?;
    if hs != *HANDSHAKE {
        return Ok(());
    }
    socket.write_all(HANDSHAKE).await?;
    state.connections.fetch_add(1, Ordering::Relaxed);

    let (mut reader, writer) = socket.into_split();
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    let kill = shutdown.child_token();
    state.active.lock().push(Connection {
        writer: writer.clone(),
        kill: kill.clone(),
    });

    if let Some(packet) = encode_event(&WireEvent::ThreadCreated {
        thread: main_thread(),
    }) {
        write_packet(&writer, &packet, state.config.fragment_writes).await?;
    }

    loop {
        let packet = tokio::select! {
            _ = kill.cancelled() => break,
            packet = read_command(&mut reader) => packet?,
        };
        let Some((header, payload)) = packet else {
            break;
        };

        let response = handle_command(&state, header.code, &payload);
        let close_after = response.close_after;
        send_response(&state, &writer, &kill, header.id, response).await?;
        // A delayed reply closes the connection itself once it has been written.
        if close_after && state.config.reply_delay.is_none() {
            break;
        }
    }

    kill.cancel();
    state.active.lock().retain(|conn| !conn.kill.is_cancelled());
    let _ = writer.lock().await.shutdown().await;
    Ok(())
}

async fn read_command(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<(PacketHeader, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let Ok(header) = PacketHeader::parse(&header) else {
        return Ok(None);
    };
    if header.is_reply() {
        // The mock only expects commands from the client.
        return Ok(None);
    }
    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

struct Response {
    error_code: u16,
    payload: Vec<u8>,
    /// Sent before the reply.
    before: Vec<WireEvent>,
    /// Sent after the reply.
    after: Vec<WireEvent>,
    close_after: bool,
}

impl Response {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            error_code: 0,
            payload,
            before: Vec::new(),
            after: Vec::new(),
            close_after: false,
        }
    }

    fn error(code: u16) -> Self {
        Self {
            error_code: code,
            ..Self::ok(Vec::new())
        }
    }
}

async fn send_response(
    state: &Arc<State>,
    writer: &SharedWriter,
    kill: &CancellationToken,
    id: u32,
    response: Response,
) -> std::io::Result<()> {
    let fragment = state.config.fragment_writes;
    let mut packets: Vec<Vec<u8>> = response.before.iter().filter_map(encode_event).collect();
    packets.push(encode_reply(id, response.error_code, &response.payload));
    packets.extend(response.after.iter().filter_map(encode_event));

    let delay = state.config.reply_delay.filter(|delay| !delay.is_zero());
    if let Some(delay) = delay {
        let writer = writer.clone();
        let kill = kill.clone();
        let close_after = response.close_after;
        tokio::spawn(async move {
            tokio::select! {
                _ = kill.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    for packet in &packets {
                        if write_packet(&writer, packet, fragment).await.is_err() {
                            return;
                        }
                    }
                    if close_after {
                        kill.cancel();
                    }
                }
            }
        });
        return Ok(());
    }

    for packet in &packets {
        write_packet(writer, packet, fragment).await?;
    }
    Ok(())
}

async fn write_packet(writer: &SharedWriter, packet: &[u8], fragment: bool) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    if fragment {
        for byte in packet {
            guard.write_all(std::slice::from_ref(byte)).await?;
            guard.flush().await?;
            tokio::task::yield_now().await;
        }
        return Ok(());
    }
    guard.write_all(packet).await
}

fn main_thread() -> ThreadInfo {
    ThreadInfo {
        id: MAIN_THREAD_ID,
        name: MAIN_THREAD_NAME.to_string(),
    }
}

fn handle_command(state: &State, code: u16, payload: &[u8]) -> Response {
    let mut r = WireReader::new(payload);
    match code {
        CMD_SET_DEBUG_OPTIONS => {
            let Ok(options) = r.read_strings() else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            *state.debug_options.lock() = options;
            Response::ok(Vec::new())
        }
        CMD_SET_BREAKPOINTS => {
            let (Ok(path), Ok(specs)) = (r.read_string(), r.read_breakpoint_specs()) else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            let acks: Vec<BreakpointAck> = specs
                .iter()
                .map(|spec| {
                    let verified = !state.config.unverifiable_lines.contains(&spec.line);
                    BreakpointAck {
                        id: state.next_breakpoint_id.fetch_add(1, Ordering::Relaxed),
                        line: spec.line,
                        verified,
                        message: (!verified).then(|| "line has no executable code".to_string()),
                    }
                })
                .collect();

            {
                let mut breakpoints = state.breakpoints.lock();
                if acks.is_empty() {
                    breakpoints.remove(&path);
                } else {
                    breakpoints.insert(
                        path,
                        acks.iter().filter(|ack| ack.verified).cloned().collect(),
                    );
                }
            }

            let mut w = WireWriter::new();
            w.write_breakpoint_acks(&acks);
            let mut response = Response::ok(w.into_vec());

            let suspended = state.program.lock().suspended;
            if suspended {
                let mut sent = state.event_before_ack_sent.lock();
                if !*sent {
                    if let Some(event) = state.config.event_before_breakpoint_ack.clone() {
                        response.before.push(event);
                        *sent = true;
                    }
                }
            }
            response
        }
        CMD_SET_EXCEPTION_MODE => {
            let (Ok(raised), Ok(uncaught)) = (r.read_bool(), r.read_bool()) else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            *state.exception_mode.lock() = ExceptionMode { raised, uncaught };
            Response::ok(Vec::new())
        }
        CMD_CONFIGURATION_DONE => {
            state.configuration_done_calls.fetch_add(1, Ordering::Relaxed);
            let mut response = Response::ok(Vec::new());
            let mut program = state.program.lock();
            if !program.suspended && !program.exited {
                run_to_next_stop(state, &mut program, &mut response);
            }
            response
        }
        CMD_RESUME => {
            state.resume_calls.fetch_add(1, Ordering::Relaxed);
            let Ok(_thread) = r.read_u64() else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            let mut program = state.program.lock();
            if !program.suspended {
                return Response::error(ERROR_NOT_SUSPENDED);
            }
            program.resume();
            let mut response = Response::ok(Vec::new());
            run_to_next_stop(state, &mut program, &mut response);
            response
        }
        CMD_STEP => {
            state.step_calls.fetch_add(1, Ordering::Relaxed);
            let (Ok(thread_id), Ok(kind)) = (r.read_u64(), r.read_u8()) else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            if thread_id != MAIN_THREAD_ID {
                return Response::error(ERROR_INVALID_REFERENCE);
            }
            if StepKind::from_u8(kind).is_none() {
                return Response::error(ERROR_INVALID_ARGUMENT);
            }
            let mut program = state.program.lock();
            if !program.suspended {
                return Response::error(ERROR_NOT_SUSPENDED);
            }
            program.resume();
            program.current_line += 1;
            program.suspended = true;

            let mut response = Response::ok(Vec::new());
            response.after.push(WireEvent::StepComplete { thread_id });
            response
        }
        CMD_THREADS => {
            let mut w = WireWriter::new();
            let exited = state.program.lock().exited;
            let threads = if exited { Vec::new() } else { vec![main_thread()] };
            w.write_threads(&threads);
            Response::ok(w.into_vec())
        }
        CMD_FRAMES => {
            let Ok(thread_id) = r.read_u64() else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            if thread_id != MAIN_THREAD_ID {
                return Response::error(ERROR_INVALID_REFERENCE);
            }
            let mut program = state.program.lock();
            if !program.suspended {
                return Response::error(ERROR_NOT_SUSPENDED);
            }
            let path = program_path(&program.current_path);
            let line = program.current_line;
            let frames = program
                .frames
                .get_or_insert_with(|| {
                    vec![
                        FrameInfo {
                            id: state.alloc_id(),
                            name: "handler".to_string(),
                            path: path.clone(),
                            line,
                            column: 1,
                        },
                        FrameInfo {
                            id: state.alloc_id(),
                            name: "<module>".to_string(),
                            path,
                            line: 1,
                            column: 1,
                        },
                    ]
                })
                .clone();
            let mut w = WireWriter::new();
            w.write_frames(&frames);
            Response::ok(w.into_vec())
        }
        CMD_FRAME_VARIABLES => {
            let Ok(frame_id) = r.read_u64() else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            let mut guard = state.program.lock();
            let program = &mut *guard;
            let known = program
                .frames
                .as_ref()
                .is_some_and(|frames| frames.iter().any(|frame| frame.id == frame_id));
            if !known {
                return Response::error(ERROR_INVALID_REFERENCE);
            }
            let locals = match program.locals.get(&frame_id) {
                Some(locals) => locals.clone(),
                None => {
                    let items_ref = state.alloc_id();
                    program.children.insert(
                        items_ref,
                        vec![
                            variable("0", "1", "int", 0),
                            variable("1", "2", "int", 0),
                        ],
                    );
                    let locals = vec![
                        variable("x", "1", "int", 0),
                        variable("items", "[1, 2]", "list", items_ref),
                    ];
                    program.locals.insert(frame_id, locals.clone());
                    locals
                }
            };
            let mut w = WireWriter::new();
            w.write_variables(&locals);
            Response::ok(w.into_vec())
        }
        CMD_CHILDREN => {
            let Ok(reference) = r.read_u64() else {
                return Response::error(ERROR_INVALID_ARGUMENT);
            };
            let program = state.program.lock();
            let Some(children) = program.children.get(&reference) else {
                return Response::error(ERROR_INVALID_REFERENCE);
            };
            let mut w = WireWriter::new();
            w.write_variables(children);
            Response::ok(w.into_vec())
        }
        CMD_DETACH => {
            state.detach_calls.fetch_add(1, Ordering::Relaxed);
            state.breakpoints.lock().clear();
            let mut program = state.program.lock();
            program.resume();
            let mut response = Response::ok(Vec::new());
            response.close_after = true;
            response
        }
        _ => Response::error(ERROR_UNKNOWN_COMMAND),
    }
}

fn program_path(current: &str) -> String {
    if current.is_empty() {
        "<unknown>".to_string()
    } else {
        current.to_string()
    }
}

fn variable(name: &str, value: &str, type_name: &str, children: u64) -> VariableInfo {
    VariableInfo {
        name: name.to_string(),
        value: value.to_string(),
        type_name: type_name.to_string(),
        children,
    }
}

/// Advance the script from its current line to the next stop, queueing the
/// resulting events after the reply.
fn run_to_next_stop(state: &State, program: &mut Program, response: &mut Response) {
    let breakpoints = state.breakpoints.lock();
    let next_breakpoint = breakpoints
        .iter()
        .flat_map(|(path, acks)| acks.iter().map(move |ack| (ack.line, path, ack.id)))
        .filter(|(line, _, _)| *line > program.current_line)
        .min_by_key(|(line, _, _)| *line);

    let mode = *state.exception_mode.lock();
    let exception_line = state
        .config
        .exception_at_line
        .filter(|line| *line > program.current_line)
        .filter(|_| !program.exception_raised && (mode.raised || mode.uncaught));

    match (next_breakpoint, exception_line) {
        (Some((line, path, id)), exception) if exception.is_none_or(|ex| line < ex) => {
            program.current_path = path.clone();
            program.current_line = line;
            program.suspended = true;
            response.after.push(WireEvent::BreakpointHit {
                thread_id: MAIN_THREAD_ID,
                breakpoint_id: id,
            });
        }
        (_, Some(line)) => {
            program.current_line = line;
            program.suspended = true;
            program.exception_raised = true;
            response.after.push(WireEvent::ExceptionRaised {
                thread_id: MAIN_THREAD_ID,
                description: "ValueError: bad value".to_string(),
            });
        }
        _ if state.config.hold_on_resume => {}
        _ => {
            program.exited = true;
            if let Some(text) = &state.config.exit_output {
                response.after.push(WireEvent::Output {
                    category: "stdout".to_string(),
                    text: text.clone(),
                });
            }
            response.after.push(WireEvent::ThreadExited {
                thread_id: MAIN_THREAD_ID,
            });
            response.after.push(WireEvent::ProcessExited {
                exit_code: state.config.exit_code,
            });
            response.close_after = true;
        }
    }
}
