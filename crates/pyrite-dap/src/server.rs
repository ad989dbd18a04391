use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use pyrite_config::DebuggerConfig;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config_provider::Platform;
use crate::dap::{make_event, make_response, DapError, DapReader, DapWriter, Request};
use crate::error::ServerError;
use crate::registry::AttachRegistry;
use crate::session::{DebugSession, SessionEvent, SessionInput, SessionOptions};

type Result<T> = std::result::Result<T, ServerError>;

/// Messages queued for the editor before producers wait on the writer.
const OUTGOING_CAPACITY: usize = 256;

/// Consecutive session inputs handled before a pending request is let through.
const INPUT_BURST: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub debugger: DebuggerConfig,
    /// Shared by every session served from this process.
    pub registry: AttachRegistry,
    pub platform: Platform,
}

impl ServerOptions {
    pub fn new(debugger: DebuggerConfig) -> Self {
        Self {
            debugger,
            registry: AttachRegistry::new(),
            platform: Platform::current(),
        }
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            debugger: self.debugger.clone(),
            registry: self.registry.clone(),
            platform: self.platform,
        }
    }
}

/// Outgoing message queue. The sequence number is assigned under the same lock
/// that enqueues the message so the stream's `seq` values never go backwards.
/// The queue is bounded: a slow editor holds back the session loop, which holds
/// back the debuggee's output pipes.
#[derive(Clone)]
struct Outgoing {
    inner: Arc<tokio::sync::Mutex<OutgoingInner>>,
}

struct OutgoingInner {
    seq: i64,
    tx: mpsc::Sender<Value>,
}

impl Outgoing {
    fn new(tx: mpsc::Sender<Value>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(OutgoingInner { seq: 1, tx })),
        }
    }

    async fn send_with(
        &self,
        build: impl FnOnce(i64) -> std::result::Result<Value, serde_json::Error>,
    ) {
        let mut inner = self.inner.lock().await;
        let seq = inner.seq;
        match build(seq) {
            Ok(value) => {
                inner.seq += 1;
                let _ = inner.tx.send(value).await;
            }
            Err(err) => {
                tracing::error!(target = "pyrite.dap", error = %err, "failed to serialize DAP message")
            }
        }
    }

    async fn response(
        &self,
        request: &Request,
        success: bool,
        body: Option<Value>,
        message: Option<String>,
    ) {
        self.send_with(|seq| {
            serde_json::to_value(make_response(seq, request, success, body, message))
        })
        .await;
    }

    async fn event(&self, event: &SessionEvent) {
        self.send_with(|seq| serde_json::to_value(make_event(seq, event.event, event.body.clone())))
            .await;
    }

    async fn events(&self, events: &[SessionEvent]) {
        for event in events {
            self.event(event).await;
        }
    }
}

type InFlight = Arc<Mutex<HashMap<i64, CancellationToken>>>;

/// Run the adapter over stdio.
pub async fn run_stdio(options: ServerOptions) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, options).await.map_err(anyhow::Error::from)
}

/// Accept editor connections on `addr`, one independent session each. Sessions
/// share only the attach registry.
pub async fn serve_tcp(addr: SocketAddr, options: ServerOptions) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target = "pyrite.dap", addr = %listener.local_addr()?, "listening for DAP clients");
    loop {
        let (stream, peer) = listener.accept().await?;
        let options = options.clone();
        tokio::spawn(async move {
            tracing::info!(target = "pyrite.dap", peer = %peer, "DAP client connected");
            let (reader, writer) = stream.into_split();
            if let Err(err) = run(reader, writer, options).await {
                tracing::warn!(target = "pyrite.dap", peer = %peer, error = %err, "DAP session ended with error");
            }
        });
    }
}

/// Drive one debug session over a DAP byte stream until the editor disconnects
/// or closes the stream.
pub async fn run<R, W>(reader: R, writer: W, options: ServerOptions) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(OUTGOING_CAPACITY);
    let out = Outgoing::new(out_tx);

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(msg) = out_rx.recv().await {
            if let Err(err) = writer.write_value(&msg).await {
                tracing::debug!(target = "pyrite.dap", error = %err, "DAP writer closed");
                break;
            }
        }
    });

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<(Request, CancellationToken)>();
    let reader_task = tokio::spawn(read_requests(
        DapReader::new(reader),
        req_tx,
        in_flight.clone(),
        out.clone(),
    ));

    let mut session = DebugSession::new(options.session_options());

    enum Next {
        Input(SessionInput),
        Request(Option<(Request, CancellationToken)>),
    }

    let mut burst = 0usize;
    loop {
        // Session inputs first so a request racing a stop sees the stop, but a
        // debuggee that never stops producing output cannot starve requests.
        let next = if burst < INPUT_BURST {
            tokio::select! {
                biased;
                input = session.next_input() => Next::Input(input),
                request = req_rx.recv() => Next::Request(request),
            }
        } else {
            burst = 0;
            tokio::select! {
                biased;
                request = req_rx.recv() => Next::Request(request),
                input = session.next_input() => Next::Input(input),
            }
        };

        match next {
            Next::Input(input) => {
                burst += 1;
                let events = session.handle_input(input).await;
                out.events(&events).await;
            }
            Next::Request(Some((request, cancel))) => {
                burst = 0;
                let done = request.command == "disconnect";
                let result = session.handle_request(&request, &cancel).await;
                in_flight.lock().remove(&request.seq);
                match result {
                    Ok(outcome) => {
                        out.response(&request, true, outcome.body, None).await;
                        out.events(&outcome.events).await;
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "pyrite.dap",
                            command = %request.command,
                            error = %err,
                            "request failed"
                        );
                        out.response(&request, false, None, Some(err.to_string()))
                            .await;
                    }
                }
                if done {
                    break;
                }
            }
            Next::Request(None) => {
                tracing::info!(target = "pyrite.dap", "editor stream closed; ending session");
                let events = session.shutdown().await;
                out.events(&events).await;
                break;
            }
        }
    }

    reader_task.abort();
    let read_result = reader_task.await;
    drop(session);
    drop(out);
    let _ = writer_task.await;

    match read_result {
        Ok(Err(err)) => Err(err.into()),
        _ => Ok(()),
    }
}

async fn read_requests<R>(
    mut reader: DapReader<R>,
    req_tx: mpsc::UnboundedSender<(Request, CancellationToken)>,
    in_flight: InFlight,
    out: Outgoing,
) -> std::result::Result<(), DapError>
where
    R: AsyncRead + Unpin,
{
    let result = loop {
        let request = match reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(target = "pyrite.dap", error = %err, "skipping malformed DAP message");
                continue;
            }
            Err(err) => break Err(err),
        };
        if request.message_type != "request" {
            continue;
        }

        if request.command == "cancel" {
            let target = request
                .arguments
                .get("requestId")
                .and_then(Value::as_i64);
            let cancelled = target
                .and_then(|id| in_flight.lock().get(&id).cloned())
                .map(|token| token.cancel())
                .is_some();
            tracing::debug!(target = "pyrite.dap", request_id = ?target, cancelled, "cancel request");
            out.response(&request, true, None, None).await;
            continue;
        }

        let token = CancellationToken::new();
        in_flight.lock().insert(request.seq, token.clone());
        if req_tx.send((request, token)).is_err() {
            break Ok(());
        }
    };

    // The editor is gone (or the stream is unusable): abandon in-flight work.
    for (_, token) in in_flight.lock().drain() {
        token.cancel();
    }
    if let Err(err) = &result {
        tracing::warn!(target = "pyrite.dap", error = %err, "DAP stream error");
    }
    result
}
