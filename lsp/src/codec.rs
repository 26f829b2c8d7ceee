//! Base-protocol framing: `Content-Length: N\r\n\r\n{json}` over byte streams.
//!
//! [`MessageReader`] and [`MessageWriter`] wrap any tokio reader/writer, so the
//! same code drives a child process's pipes and in-memory duplex streams.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest message body accepted from the server (4 MiB).
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Parse one header line; returns the length when it is a `Content-Length` header.
fn content_length_of(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid Content-Length value {:?}", value.trim()))?;
    Ok(Some(len))
}

/// Reads framed JSON-RPC messages.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the stream ended cleanly between two messages.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > MAX_MESSAGE_BYTES {
            bail!("Content-Length {len} exceeds maximum {MAX_MESSAGE_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading message body")?;
        let value = serde_json::from_slice(&body).context("parsing JSON-RPC message")?;
        Ok(Some(value))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            started = true;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            if let Some(len) = content_length_of(header)? {
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("header block without Content-Length"),
        }
    }
}

/// Writes framed JSON-RPC messages.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing JSON-RPC message")?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing message header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing message body")?;
        self.writer.flush().await.context("flushing message")?;
        Ok(())
    }

    /// Close the underlying stream so the peer sees EOF.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_back_written_messages_in_order() {
        let first = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let second = serde_json::json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});

        let mut buf = Vec::new();
        let mut writer = MessageWriter::new(&mut buf);
        writer.write_message(&first).await.unwrap();
        writer.write_message(&second).await.unwrap();

        let mut reader = MessageReader::new(buf.as_slice());
        assert_eq!(reader.read_message().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_message().await.unwrap().unwrap(), second);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        let mut reader = MessageReader::new(&b""[..]);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_error() {
        let mut reader = MessageReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_inside_headers_is_error() {
        let mut reader = MessageReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let mut reader = MessageReader::new(&b"Content-Length: 100\r\n\r\n{}"[..]);
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut reader = MessageReader::new(header.as_bytes());
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive_and_extras_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":7}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = MessageReader::new(raw.as_bytes());
        assert_eq!(reader.read_message().await.unwrap().unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes() {
        let msg = serde_json::json!({"label": "é"});
        let mut buf = Vec::new();
        MessageWriter::new(&mut buf)
            .write_message(&msg)
            .await
            .unwrap();

        let body = serde_json::to_vec(&msg).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }

    #[test]
    fn test_content_length_of_rejects_garbage_value() {
        assert!(content_length_of("Content-Length: many").is_err());
        assert_eq!(content_length_of("X-Other: 1").unwrap(), None);
        assert_eq!(content_length_of("no colon here").unwrap(), None);
    }
}
