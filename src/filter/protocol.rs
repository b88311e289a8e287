//! Pkt-line framing for the long-running filter protocol.
//!
//! Wire format: every packet starts with 4 lowercase hex digits giving the
//! total packet length (prefix included), followed by the data.
//! `0000` is a flush packet and terminates a list or a content stream.

use crate::error::{FilterError, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total packet length, length prefix included
pub const MAX_PACKET_LENGTH: usize = 65520;

/// Size of the hex length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum data carried by a single packet
pub const MAX_PACKET_DATA: usize = MAX_PACKET_LENGTH - LENGTH_PREFIX_SIZE;

const FLUSH_PACKET: &[u8; LENGTH_PREFIX_SIZE] = b"0000";

// =============================================================================
// Packet
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `0000`
    Flush,
    Data(Bytes),
}

impl Packet {
    /// Text view of a data packet with one trailing LF removed.
    /// Returns `None` for a flush packet.
    pub fn into_text(self) -> Result<Option<String>> {
        match self {
            Packet::Flush => Ok(None),
            Packet::Data(data) => {
                let data = data.strip_suffix(b"\n").unwrap_or(&data[..]);
                let text = std::str::from_utf8(data).map_err(|_| {
                    FilterError::ProtocolViolation("text packet is not valid UTF-8".to_string())
                })?;
                Ok(Some(text.to_string()))
            }
        }
    }
}

fn invalid_data(msg: impl Into<String>) -> FilterError {
    FilterError::Transport(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
}

fn parse_length(prefix: &[u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    if !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid_data(format!(
            "invalid pkt-line length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }
    // All four bytes are ASCII hex digits, so both conversions succeed.
    let text = std::str::from_utf8(prefix).map_err(|e| invalid_data(e.to_string()))?;
    usize::from_str_radix(text, 16).map_err(|e| invalid_data(e.to_string()))
}

// =============================================================================
// Reading
// =============================================================================

/// Read a single packet.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new packet starts.
/// A stream that ends inside a packet is a transport failure.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Packet>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = r
            .read(&mut prefix[filled..])
            .await
            .map_err(FilterError::Transport)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FilterError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a pkt-line length prefix",
            )));
        }
        filled += n;
    }

    let len = parse_length(&prefix)?;
    match len {
        0 => Ok(Some(Packet::Flush)),
        1..=3 => Err(invalid_data(format!("invalid pkt-line length {}", len))),
        _ if len > MAX_PACKET_LENGTH => Err(invalid_data(format!(
            "pkt-line length {} exceeds maximum {}",
            len, MAX_PACKET_LENGTH
        ))),
        _ => {
            let mut data = vec![0u8; len - LENGTH_PREFIX_SIZE];
            r.read_exact(&mut data)
                .await
                .map_err(FilterError::Transport)?;
            Ok(Some(Packet::Data(Bytes::from(data))))
        }
    }
}

/// Read text packets up to the next flush.
///
/// Returns `Ok(None)` if the stream ends cleanly before the first packet.
pub async fn read_text_list<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<String>>> {
    let mut lines = Vec::new();
    loop {
        match read_packet(r).await? {
            None if lines.is_empty() => return Ok(None),
            None => {
                return Err(FilterError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the end of a pkt-line list",
                )))
            }
            Some(packet) => match packet.into_text()? {
                Some(line) => lines.push(line),
                None => return Ok(Some(lines)),
            },
        }
    }
}

// =============================================================================
// Writing
// =============================================================================

/// Encode one data packet.
pub fn encode_packet(data: &[u8]) -> Result<Bytes> {
    if data.len() > MAX_PACKET_DATA {
        return Err(FilterError::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "packet data of {} bytes exceeds maximum {}",
                data.len(),
                MAX_PACKET_DATA
            ),
        )));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + data.len());
    buf.extend_from_slice(format!("{:04x}", data.len() + LENGTH_PREFIX_SIZE).as_bytes());
    buf.extend_from_slice(data);
    Ok(buf.freeze())
}

pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let packet = encode_packet(data)?;
    w.write_all(&packet).await.map_err(FilterError::Transport)
}

/// Write `text` followed by LF as a single packet.
pub async fn write_text<W: AsyncWrite + Unpin>(w: &mut W, text: &str) -> Result<()> {
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(b'\n');
    write_packet(w, &line).await
}

pub async fn write_flush<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(FLUSH_PACKET)
        .await
        .map_err(FilterError::Transport)
}

/// Write a list of text packets terminated by a flush, then flush the writer.
pub async fn write_text_list<W, I, S>(w: &mut W, lines: I) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for line in lines {
        write_text(w, line.as_ref()).await?;
    }
    write_flush(w).await?;
    w.flush().await.map_err(FilterError::Transport)
}

// =============================================================================
// ContentWriter
// =============================================================================

/// Buffered writer that frames response content as data packets.
///
/// Data is held until `capacity` bytes accumulate, then emitted in packets of
/// at most `capacity` bytes. `finish` writes what remains plus the
/// terminating flush packet.
pub struct ContentWriter<'a, W> {
    inner: &'a mut W,
    buf: BytesMut,
    capacity: usize,
    written: u64,
}

impl<'a, W: AsyncWrite + Unpin> ContentWriter<'a, W> {
    pub fn new(inner: &'a mut W, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_PACKET_DATA);
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            written: 0,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        self.written += data.len() as u64;
        while self.buf.len() >= self.capacity {
            let chunk = self.buf.split_to(self.capacity);
            write_packet(self.inner, &chunk).await?;
        }
        Ok(())
    }

    /// Emit buffered data and the flush packet. Returns the total bytes written.
    pub async fn finish(mut self) -> Result<u64> {
        while !self.buf.is_empty() {
            let n = self.buf.len().min(MAX_PACKET_DATA);
            let chunk = self.buf.split_to(n);
            write_packet(self.inner, &chunk).await?;
        }
        write_flush(self.inner).await?;
        self.inner.flush().await.map_err(FilterError::Transport)?;
        Ok(self.written)
    }
}

// =============================================================================
// Tests
// =============================================================================
