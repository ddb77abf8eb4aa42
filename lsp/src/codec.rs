//! `Content-Length` framing for JSON-RPC over a byte stream.
//!
//! Each message is `Content-Length: N\r\n\r\n` followed by N bytes of UTF-8
//! JSON. [`FrameReader`] yields decoded [`Incoming`] messages; [`FrameWriter`]
//! frames outgoing values.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on one frame body (8 MiB); full-document sync of large files
/// flows through here.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// A decoded message from the server, classified by JSON-RPC shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to one of our requests (`result` or `error` present).
    Response { id: u64, body: Value },
    /// Server-initiated request; must be answered.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classify a raw JSON-RPC value. `None` for shapes that fit no category.
    #[must_use]
    pub fn classify(frame: Value) -> Option<Self> {
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .map(String::from);
        let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

        match (frame.get("id").cloned(), method) {
            (Some(id), None) if is_reply => Some(Self::Response {
                id: id.as_u64()?,
                body: frame,
            }),
            (Some(id), Some(method)) => Some(Self::Request {
                id,
                params: frame.get("params").cloned(),
                method,
            }),
            (None, Some(method)) => Some(Self::Notification {
                params: frame.get("params").cloned(),
                method,
            }),
            _ => None,
        }
    }
}

/// Parse one header line. `Ok(Some(n))` for `Content-Length`, `Ok(None)` for
/// any other header. The header name is case-insensitive.
fn parse_header(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        bail!("malformed header line: {line:?}");
    };
    if !key.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid Content-Length value {:?}", value.trim()))?;
    Ok(Some(len))
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read and classify the next message, skipping frames whose JSON shape
    /// fits no JSON-RPC category.
    ///
    /// `Ok(None)` on clean EOF between frames.
    pub async fn next_message(&mut self) -> Result<Option<Incoming>> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            match Incoming::classify(frame) {
                Some(message) => return Ok(Some(message)),
                None => tracing::trace!("Skipping unclassifiable JSON-RPC frame"),
            }
        }
    }

    /// Read the next raw frame. `Ok(None)` on clean EOF between frames; EOF
    /// inside a frame, an oversized frame, or a non-JSON body is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let Some(len) = self.read_headers().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("Content-Length {len} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        let value = serde_json::from_slice(&body).context("parsing JSON-RPC body")?;
        Ok(Some(value))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut line = String::new();
        let mut started = false;

        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("unexpected EOF while reading headers");
                }
                return Ok(None);
            }
            started = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some(len) = parse_header(trimmed)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .context("missing Content-Length header")
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg`, prepend its byte length, write and flush.
    pub async fn write_frame(&mut self, msg: &Value) -> Result<()> {
        let body = serde_json::to_vec(msg).context("serializing JSON-RPC frame")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn frames_of(values: &[Value]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        for value in values {
            writer.write_frame(value).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_reads_back_written_frames_in_order() {
        let a = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        let b = json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});
        let buf = frames_of(&[a.clone(), b.clone()]).await;

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(a));
        assert_eq!(reader.read_frame().await.unwrap(), Some(b));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_mid_body_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 100\r\n\r\nhello"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_error() {
        let mut reader = FrameReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_header_name_case_and_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = FrameReader::new(frame.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes() {
        let msg = json!({"text": "é"});
        let buf = frames_of(std::slice::from_ref(&msg)).await;
        let body = serde_json::to_vec(&msg).unwrap();
        let expected = format!("Content-Length: {}\r\n\r\n", body.len());
        assert!(buf.starts_with(expected.as_bytes()));
    }

    #[test]
    fn test_parse_header_rejects_garbage_length() {
        assert!(parse_header("Content-Length: lots").is_err());
        assert!(parse_header("no colon here").is_err());
        assert_eq!(parse_header("X-Other: 1").unwrap(), None);
        assert_eq!(parse_header("Content-Length: 42").unwrap(), Some(42));
    }

    #[test]
    fn test_classify_shapes() {
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": 3, "result": {}})),
            Some(Incoming::Response { id: 3, .. })
        ));
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": 3, "error": {"code": 1}})),
            Some(Incoming::Response { id: 3, .. })
        ));
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": "abc", "method": "workspace/configuration"})),
            Some(Incoming::Request { .. })
        ));
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "method": "window/logMessage"})),
            Some(Incoming::Notification { params: None, .. })
        ));
        assert_eq!(Incoming::classify(json!({"jsonrpc": "2.0"})), None);
        // Our ids are numeric; a string-id response cannot be ours.
        assert_eq!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": "x", "result": 1})),
            None
        );
    }

    #[tokio::test]
    async fn test_next_message_skips_unclassifiable_frames() {
        let buf = frames_of(&[
            json!({"jsonrpc": "2.0"}),
            json!({"jsonrpc": "2.0", "method": "textDocument/publishDiagnostics", "params": {}}),
        ])
        .await;
        let mut reader = FrameReader::new(buf.as_slice());
        let message = reader.next_message().await.unwrap().unwrap();
        assert!(matches!(message, Incoming::Notification { ref method, .. } if method == "textDocument/publishDiagnostics"));
        assert!(reader.next_message().await.unwrap().is_none());
    }
}
