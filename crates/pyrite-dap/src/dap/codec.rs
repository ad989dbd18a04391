use std::io;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use super::messages::{Event, Request, Response};
use super::{MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The frame was read completely but its body is not valid JSON (or not a
    /// valid message). The stream is still in sync.
    #[error("json error: {0}")]
    Json(String),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

impl DapError {
    fn json(err: serde_json::Error) -> Self {
        DapError::Json(sanitize_json_error_message(&err.to_string()))
    }

    /// Whether the reader can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DapError::Json(_))
    }
}

pub type Result<T> = std::result::Result<T, DapError>;

pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    // `serde_json` errors can quote user-provided values (`invalid type: string "..."`). Launch
    // arguments carry env vars and program args, so never echo them back.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `unknown field `secret`, expected ...`: redact only the first backticked segment.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Option<String>> {
    let mut buf = Vec::<u8>::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
        if buf.len() + take > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("DAP header line exceeds maximum size ({max_len} bytes)"),
            ));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline_pos.is_some() {
            break;
        }
    }

    let line = String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DAP header line is not UTF-8"))?;
    Ok(Some(line))
}

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Reads one framed body. `Ok(None)` on a clean EOF between messages.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let Some(line) = read_line_limited(&mut self.reader, MAX_DAP_HEADER_LINE_BYTES).await?
            else {
                if saw_header {
                    return Err(DapError::Protocol(
                        "unexpected EOF while reading DAP headers".to_string(),
                    ));
                }
                return Ok(None);
            };

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                if saw_header {
                    break;
                }
                // Tolerate stray blank lines between messages.
                continue;
            }
            saw_header = true;

            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };

            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|_| {
                    DapError::Protocol(format!("invalid Content-Length {value:?}"))
                })?);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol(
                "missing Content-Length header".to_string(),
            ));
        };
        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(DapError::Protocol(format!(
                "DAP message body of {len} bytes exceeds maximum size ({MAX_DAP_MESSAGE_BYTES} bytes)"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(body) = self.read_frame().await? else {
            return Ok(None);
        };
        serde_json::from_slice::<Value>(&body)
            .map(Some)
            .map_err(DapError::json)
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        serde_json::from_value::<Request>(value)
            .map(Some)
            .map_err(DapError::json)
    }
}

pub struct DapWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(DapError::json)?;
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", bytes.len()).as_bytes())
            .await?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        let value = serde_json::to_value(response).map_err(DapError::json)?;
        self.write_value(&value).await
    }

    pub async fn write_event(&mut self, event: &Event) -> Result<()> {
        let value = serde_json::to_value(event).map_err(DapError::json)?;
        self.write_value(&value).await
    }
}
