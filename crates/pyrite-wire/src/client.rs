use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpStream},
    sync::{mpsc, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{decode_event, encode_command, PacketHeader, WireReader, WireWriter, HANDSHAKE, HEADER_LEN},
    types::{
        BreakpointAck, BreakpointSpec, ExceptionMode, FrameId, FrameInfo, Result, ServerErrorCode,
        StepKind, ThreadId, ThreadInfo, VariableInfo, VariableRef, WireError, WireEvent,
        CMD_CHILDREN, CMD_CONFIGURATION_DONE, CMD_DETACH, CMD_FRAMES, CMD_FRAME_VARIABLES,
        CMD_RESUME, CMD_SET_BREAKPOINTS, CMD_SET_DEBUG_OPTIONS, CMD_SET_EXCEPTION_MODE, CMD_STEP,
        CMD_THREADS,
    },
};

pub type EventReceiver = mpsc::UnboundedReceiver<WireEvent>;

#[derive(Debug, Clone)]
pub struct WireClientConfig {
    /// Bound on the single TCP connect attempt.
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for WireClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingMap = HashMap<u32, oneshot::Sender<Result<Reply>>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
    closed_by_client: AtomicBool,
    peer: SocketAddr,
    config: WireClientConfig,
}

/// Connection to a debuggee's embedded debug server.
///
/// Cloning shares the connection. Events are delivered on the receiver
/// returned by [`WireClient::connect`] in wire order, ending with exactly one
/// [`WireEvent::Disconnected`].
#[derive(Clone, Debug)]
pub struct WireClient {
    inner: Arc<Inner>,
}

impl WireClient {
    /// Open a connection: one TCP attempt bounded by `connect_timeout`, then the
    /// handshake. Callers that want to wait for a server to come up retry on
    /// [`WireError::is_retryable_connect_error`].
    pub async fn connect(
        addr: SocketAddr,
        config: WireClientConfig,
    ) -> Result<(Self, EventReceiver)> {
        let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout)??;
        let _ = stream.set_nodelay(true);

        handshake(&mut stream, config.handshake_timeout).await?;
        tracing::debug!(target = "pyrite.wire", %addr, "connected to debug server");

        let (reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
            closed_by_client: AtomicBool::new(false),
            peer: addr,
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone(), events_tx));

        Ok((Self { inner }, events_rx))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Close the connection. Pending commands fail with
    /// [`WireError::Cancelled`]. Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.inner.closed_by_client.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let pending = std::mem::take(&mut *self.inner.pending.lock().await);
        for (_id, tx) in pending {
            let _ = tx.send(Err(WireError::Cancelled));
        }

        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        tracing::debug!(target = "pyrite.wire", peer = %self.inner.peer, "closed debug server connection");
    }

    async fn send_command(&self, command: u16, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WireError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        // The read loop cancels `shutdown` before draining `pending`, so a
        // command registered after the drain is caught here.
        if self.inner.shutdown.is_cancelled() {
            self.remove_pending(id).await;
            return Err(WireError::ConnectionClosed);
        }

        let packet = encode_command(id, command, &payload);
        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await
        };
        if let Err(err) = written {
            self.remove_pending(id).await;
            return Err(err.into());
        }

        let reply = match tokio::time::timeout(self.inner.config.reply_timeout, rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_closed)) => return Err(WireError::ConnectionClosed),
            Err(_elapsed) => {
                self.remove_pending(id).await;
                return Err(WireError::Timeout);
            }
        };

        if reply.error_code != 0 {
            return Err(WireError::Server(ServerErrorCode::from_code(reply.error_code)));
        }
        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    pub async fn set_debug_options(&self, options: &[String]) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_strings(options);
        self.send_command(CMD_SET_DEBUG_OPTIONS, w.into_vec()).await?;
        Ok(())
    }

    /// Replace every breakpoint in `path` with `specs`. Acks come back in
    /// request order.
    pub async fn set_breakpoints(
        &self,
        path: &str,
        specs: &[BreakpointSpec],
    ) -> Result<Vec<BreakpointAck>> {
        let mut w = WireWriter::new();
        w.write_string(path);
        w.write_breakpoint_specs(specs);
        let payload = self.send_command(CMD_SET_BREAKPOINTS, w.into_vec()).await?;
        let acks = WireReader::new(&payload).read_breakpoint_acks()?;
        if acks.len() != specs.len() {
            return Err(WireError::Protocol(format!(
                "expected {} breakpoint acks, got {}",
                specs.len(),
                acks.len()
            )));
        }
        Ok(acks)
    }

    pub async fn set_exception_mode(&self, mode: ExceptionMode) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_bool(mode.raised);
        w.write_bool(mode.uncaught);
        self.send_command(CMD_SET_EXCEPTION_MODE, w.into_vec()).await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.send_command(CMD_CONFIGURATION_DONE, Vec::new()).await?;
        Ok(())
    }

    /// Resume `thread_id`, or every thread when it is `0`.
    pub async fn resume(&self, thread_id: ThreadId) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_u64(thread_id);
        self.send_command(CMD_RESUME, w.into_vec()).await?;
        Ok(())
    }

    pub async fn step(&self, thread_id: ThreadId, kind: StepKind) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_u64(thread_id);
        w.write_u8(kind.as_u8());
        self.send_command(CMD_STEP, w.into_vec()).await?;
        Ok(())
    }

    pub async fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let payload = self.send_command(CMD_THREADS, Vec::new()).await?;
        WireReader::new(&payload).read_threads()
    }

    pub async fn frames(&self, thread_id: ThreadId) -> Result<Vec<FrameInfo>> {
        let mut w = WireWriter::new();
        w.write_u64(thread_id);
        let payload = self.send_command(CMD_FRAMES, w.into_vec()).await?;
        WireReader::new(&payload).read_frames()
    }

    pub async fn frame_variables(&self, frame_id: FrameId) -> Result<Vec<VariableInfo>> {
        let mut w = WireWriter::new();
        w.write_u64(frame_id);
        let payload = self.send_command(CMD_FRAME_VARIABLES, w.into_vec()).await?;
        WireReader::new(&payload).read_variables()
    }

    pub async fn children(&self, reference: VariableRef) -> Result<Vec<VariableInfo>> {
        let mut w = WireWriter::new();
        w.write_u64(reference);
        let payload = self.send_command(CMD_CHILDREN, w.into_vec()).await?;
        WireReader::new(&payload).read_variables()
    }

    /// Ask the server to drop its breakpoints, resume and let the debuggee run
    /// on without us.
    pub async fn detach(&self) -> Result<()> {
        self.send_command(CMD_DETACH, Vec::new()).await?;
        Ok(())
    }
}

async fn handshake(stream: &mut TcpStream, timeout: Duration) -> Result<()> {
    let exchange = async {
        stream.write_all(HANDSHAKE).await?;
        let mut reply = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };

    let reply = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => return Err(WireError::Handshake(err.to_string())),
        Err(_elapsed) => {
            return Err(WireError::Handshake(
                "timed out waiting for handshake reply".to_string(),
            ))
        }
    };

    if reply != *HANDSHAKE {
        return Err(WireError::Handshake(format!(
            "unexpected handshake reply {:?}",
            String::from_utf8_lossy(&reply)
        )));
    }
    Ok(())
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Option<(PacketHeader, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = PacketHeader::parse(&header)?;

    let mut payload = vec![0u8; header.payload_len()];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<WireEvent>,
) {
    let reason = loop {
        let packet = tokio::select! {
            _ = inner.shutdown.cancelled() => break "connection closed by client".to_string(),
            res = read_packet(&mut reader) => res,
        };

        let (header, payload) = match packet {
            Ok(Some(packet)) => packet,
            Ok(None) => break "debug server closed the connection".to_string(),
            Err(err) => break err.to_string(),
        };

        if header.is_reply() {
            let tx = inner.pending.lock().await.remove(&header.id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(Reply {
                        error_code: header.code,
                        payload,
                    }));
                }
                None => {
                    tracing::debug!(target = "pyrite.wire", id = header.id, "reply for unknown command");
                }
            }
            continue;
        }

        match decode_event(header.code, &payload) {
            Ok(Some(event)) => {
                tracing::trace!(target = "pyrite.wire", ?event, "debug server event");
                let _ = events.send(event);
            }
            Ok(None) => {
                tracing::debug!(target = "pyrite.wire", code = header.code, "ignoring unknown event");
            }
            Err(err) => break err.to_string(),
        }
    };

    tracing::debug!(target = "pyrite.wire", peer = %inner.peer, %reason, "debug server connection ended");
    inner.shutdown.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    let error_for_pending = || {
        if inner.closed_by_client.load(Ordering::SeqCst) {
            WireError::Cancelled
        } else {
            WireError::ConnectionClosed
        }
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(error_for_pending()));
    }

    let _ = events.send(WireEvent::Disconnected { reason });
}
