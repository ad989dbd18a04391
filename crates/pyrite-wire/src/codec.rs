use super::types::{
    BreakpointAck, BreakpointSpec, FrameInfo, Result, ThreadInfo, VariableInfo, WireError,
    WireEvent, EVENT_BREAKPOINT_HIT, EVENT_EXCEPTION_RAISED, EVENT_OUTPUT, EVENT_PROCESS_EXITED,
    EVENT_STEP_COMPLETE, EVENT_THREAD_CREATED, EVENT_THREAD_EXITED,
};

pub const HANDSHAKE: &[u8] = b"PYRITE-DEBUG";
/// `u32 length`, `u32 id`, `u8 flags`, `u16 code`.
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;
pub const FLAG_EVENT: u8 = 0x40;
/// Upper bound on a single packet, header included.
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: usize,
    pub id: u32,
    pub flags: u8,
    pub code: u16,
}

impl PacketHeader {
    pub fn parse(header: &[u8; HEADER_LEN]) -> Result<Self> {
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < HEADER_LEN {
            return Err(WireError::Protocol(format!(
                "packet length {length} is smaller than the header"
            )));
        }
        if length > MAX_PACKET_LEN {
            return Err(WireError::Protocol(format!(
                "packet length {length} exceeds maximum of {MAX_PACKET_LEN}"
            )));
        }
        Ok(Self {
            length,
            id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            flags: header[8],
            code: u16::from_be_bytes([header[9], header[10]]),
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length - HEADER_LEN
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }
}

#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_strings(&mut self, items: &[String]) {
        self.write_u32(items.len() as u32);
        for item in items {
            self.write_string(item);
        }
    }

    pub fn write_breakpoint_specs(&mut self, specs: &[BreakpointSpec]) {
        self.write_u32(specs.len() as u32);
        for spec in specs {
            self.write_u32(spec.line);
            // Column 0 means "any column on the line".
            self.write_u32(spec.column.unwrap_or(0));
        }
    }

    pub fn write_breakpoint_acks(&mut self, acks: &[BreakpointAck]) {
        self.write_u32(acks.len() as u32);
        for ack in acks {
            self.write_u32(ack.id);
            self.write_u32(ack.line);
            self.write_bool(ack.verified);
            self.write_string(ack.message.as_deref().unwrap_or(""));
        }
    }

    pub fn write_threads(&mut self, threads: &[ThreadInfo]) {
        self.write_u32(threads.len() as u32);
        for thread in threads {
            self.write_u64(thread.id);
            self.write_string(&thread.name);
        }
    }

    pub fn write_frames(&mut self, frames: &[FrameInfo]) {
        self.write_u32(frames.len() as u32);
        for frame in frames {
            self.write_u64(frame.id);
            self.write_string(&frame.name);
            self.write_string(&frame.path);
            self.write_u32(frame.line);
            self.write_u32(frame.column);
        }
    }

    pub fn write_variables(&mut self, variables: &[VariableInfo]) {
        self.write_u32(variables.len() as u32);
        for var in variables {
            self.write_string(&var.name);
            self.write_string(&var.value);
            self.write_string(&var.type_name);
            self.write_u64(var.children);
        }
    }
}

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn require(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(WireError::Protocol(format!(
                "unexpected end of packet (need {n} bytes, have {})",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::Protocol("string was not valid UTF-8".to_string()))
    }

    /// Reads a `u32` element count, rejecting counts that cannot possibly fit
    /// in the rest of the packet so a corrupt length never drives a huge
    /// allocation.
    fn read_count(&mut self, min_element_len: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_len) > self.remaining() {
            return Err(WireError::Protocol(format!(
                "element count {count} exceeds packet size"
            )));
        }
        Ok(count)
    }

    pub fn read_strings(&mut self) -> Result<Vec<String>> {
        let count = self.read_count(4)?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_breakpoint_specs(&mut self) -> Result<Vec<BreakpointSpec>> {
        let count = self.read_count(8)?;
        (0..count)
            .map(|_| {
                let line = self.read_u32()?;
                let column = self.read_u32()?;
                Ok(BreakpointSpec {
                    line,
                    column: (column != 0).then_some(column),
                })
            })
            .collect()
    }

    pub fn read_breakpoint_acks(&mut self) -> Result<Vec<BreakpointAck>> {
        let count = self.read_count(13)?;
        (0..count)
            .map(|_| {
                let id = self.read_u32()?;
                let line = self.read_u32()?;
                let verified = self.read_bool()?;
                let message = self.read_string()?;
                Ok(BreakpointAck {
                    id,
                    line,
                    verified,
                    message: (!message.is_empty()).then_some(message),
                })
            })
            .collect()
    }

    pub fn read_threads(&mut self) -> Result<Vec<ThreadInfo>> {
        let count = self.read_count(12)?;
        (0..count)
            .map(|_| {
                Ok(ThreadInfo {
                    id: self.read_u64()?,
                    name: self.read_string()?,
                })
            })
            .collect()
    }

    pub fn read_frames(&mut self) -> Result<Vec<FrameInfo>> {
        let count = self.read_count(24)?;
        (0..count)
            .map(|_| {
                Ok(FrameInfo {
                    id: self.read_u64()?,
                    name: self.read_string()?,
                    path: self.read_string()?,
                    line: self.read_u32()?,
                    column: self.read_u32()?,
                })
            })
            .collect()
    }

    pub fn read_variables(&mut self) -> Result<Vec<VariableInfo>> {
        let count = self.read_count(20)?;
        (0..count)
            .map(|_| {
                Ok(VariableInfo {
                    name: self.read_string()?,
                    value: self.read_string()?,
                    type_name: self.read_string()?,
                    children: self.read_u64()?,
                })
            })
            .collect()
    }
}

fn encode_packet(id: u32, flags: u8, code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_command(id: u32, command: u16, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, 0, command, payload)
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, FLAG_REPLY, error_code, payload)
}

/// Encode a server-to-client event. Returns `None` for events that only exist
/// on the client side ([`WireEvent::Disconnected`]).
pub fn encode_event(event: &WireEvent) -> Option<Vec<u8>> {
    let mut w = WireWriter::new();
    let code = match event {
        WireEvent::ThreadCreated { thread } => {
            w.write_u64(thread.id);
            w.write_string(&thread.name);
            EVENT_THREAD_CREATED
        }
        WireEvent::ThreadExited { thread_id } => {
            w.write_u64(*thread_id);
            EVENT_THREAD_EXITED
        }
        WireEvent::BreakpointHit {
            thread_id,
            breakpoint_id,
        } => {
            w.write_u64(*thread_id);
            w.write_u32(*breakpoint_id);
            EVENT_BREAKPOINT_HIT
        }
        WireEvent::StepComplete { thread_id } => {
            w.write_u64(*thread_id);
            EVENT_STEP_COMPLETE
        }
        WireEvent::ExceptionRaised {
            thread_id,
            description,
        } => {
            w.write_u64(*thread_id);
            w.write_string(description);
            EVENT_EXCEPTION_RAISED
        }
        WireEvent::Output { category, text } => {
            w.write_string(category);
            w.write_string(text);
            EVENT_OUTPUT
        }
        WireEvent::ProcessExited { exit_code } => {
            w.write_i32(*exit_code);
            EVENT_PROCESS_EXITED
        }
        WireEvent::Disconnected { .. } => return None,
    };
    Some(encode_packet(0, FLAG_EVENT, code, &w.into_vec()))
}

/// Decode an event payload. Unknown event kinds yield `Ok(None)` so newer
/// servers can add events without breaking older clients.
pub fn decode_event(code: u16, payload: &[u8]) -> Result<Option<WireEvent>> {
    let mut r = WireReader::new(payload);
    let event = match code {
        EVENT_THREAD_CREATED => WireEvent::ThreadCreated {
            thread: ThreadInfo {
                id: r.read_u64()?,
                name: r.read_string()?,
            },
        },
        EVENT_THREAD_EXITED => WireEvent::ThreadExited {
            thread_id: r.read_u64()?,
        },
        EVENT_BREAKPOINT_HIT => WireEvent::BreakpointHit {
            thread_id: r.read_u64()?,
            breakpoint_id: r.read_u32()?,
        },
        EVENT_STEP_COMPLETE => WireEvent::StepComplete {
            thread_id: r.read_u64()?,
        },
        EVENT_EXCEPTION_RAISED => WireEvent::ExceptionRaised {
            thread_id: r.read_u64()?,
            description: r.read_string()?,
        },
        EVENT_OUTPUT => WireEvent::Output {
            category: r.read_string()?,
            text: r.read_string()?,
        },
        EVENT_PROCESS_EXITED => WireEvent::ProcessExited {
            exit_code: r.read_i32()?,
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}
