//! Framed DAP message transport.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use anyhow::anyhow;
use serde_json::Value;

/// Returned by [`read_framed`] when the peer closed the connection. The
/// session read loop treats it as a normal exit, not a protocol error.
#[derive(Debug, thiserror::Error)]
#[error("DAP connection closed")]
pub struct ConnectionClosed;

/// Byte-level codec boundary: reads and writes `Content-Length` framed JSON
/// messages.
pub trait DapTransport: Send {
    fn read_message(&mut self) -> anyhow::Result<Value>;

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()>;
}

/// Reads a single framed message from `reader`.
pub fn read_framed(reader: &mut impl BufRead) -> anyhow::Result<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(ConnectionClosed.into());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse()?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let msg: Value = serde_json::from_slice(&buf)?;
    Ok(msg)
}

/// Writes a single framed message into `writer`.
pub fn write_framed(writer: &mut impl Write, message: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// TCP transport for server mode.
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }
}

impl DapTransport for TcpTransport {
    fn read_message(&mut self) -> anyhow::Result<Value> {
        read_framed(&mut self.reader)
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        write_framed(&mut self.stream, message)
    }
}
