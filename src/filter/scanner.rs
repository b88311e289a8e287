//! Handshake, capability negotiation and request parsing.

use crate::error::{FilterError, Result};
use crate::filter::protocol::{read_packet, read_text_list, write_text_list, Packet};
use crate::filter::status::Status;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeSet;
use tokio::io::{AsyncRead, AsyncWrite};

pub const CLIENT_WELCOME: &str = "git-filter-client";
pub const SERVER_WELCOME: &str = "git-filter-server";
pub const PROTOCOL_VERSION: &str = "version=2";

pub const CAPABILITY_CLEAN: &str = "capability=clean";
pub const CAPABILITY_SMUDGE: &str = "capability=smudge";
pub const CAPABILITY_DELAY: &str = "capability=delay";

bitflags::bitflags! {
    /// Capabilities this filter can serve.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const CLEAN = 1 << 0;
        const SMUDGE = 1 << 1;
        const DELAY = 1 << 2;
    }
}

impl Capabilities {
    pub fn from_advertised(advertised: &BTreeSet<String>) -> Self {
        let mut caps = Capabilities::empty();
        for (name, flag) in Self::names() {
            if advertised.contains(name) {
                caps |= flag;
            }
        }
        caps
    }

    pub fn lines(self) -> Vec<&'static str> {
        Self::names()
            .into_iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| name)
            .collect()
    }

    fn names() -> [(&'static str, Capabilities); 3] {
        [
            (CAPABILITY_CLEAN, Capabilities::CLEAN),
            (CAPABILITY_SMUDGE, Capabilities::SMUDGE),
            (CAPABILITY_DELAY, Capabilities::DELAY),
        ]
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Read Git's welcome and version list and answer with ours.
pub async fn initialize<R, W>(r: &mut R, w: &mut W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let lines = read_text_list(r)
        .await?
        .ok_or_else(|| FilterError::Handshake("stream closed before welcome".to_string()))?;

    match lines.first().map(String::as_str) {
        Some(CLIENT_WELCOME) => {}
        other => {
            return Err(FilterError::Handshake(format!(
                "invalid client welcome {:?}",
                other.unwrap_or("")
            )))
        }
    }
    if !lines[1..].iter().any(|l| l == PROTOCOL_VERSION) {
        return Err(FilterError::Handshake(format!(
            "client does not support {}, offered {:?}",
            PROTOCOL_VERSION,
            &lines[1..]
        )));
    }

    write_text_list(w, [SERVER_WELCOME, PROTOCOL_VERSION]).await
}

/// Read the advertised capabilities and answer with the ones we serve.
///
/// Returns the full advertised set.
pub async fn negotiate_capabilities<R, W>(r: &mut R, w: &mut W) -> Result<BTreeSet<String>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let advertised: BTreeSet<String> = read_text_list(r)
        .await?
        .ok_or_else(|| FilterError::Handshake("stream closed before capabilities".to_string()))?
        .into_iter()
        .collect();

    let caps = Capabilities::from_advertised(&advertised);
    let required = Capabilities::CLEAN | Capabilities::SMUDGE;
    if !caps.contains(required) {
        return Err(FilterError::Handshake(format!(
            "client must support {} and {}, offered {:?}",
            CAPABILITY_CLEAN, CAPABILITY_SMUDGE, advertised
        )));
    }

    write_text_list(w, caps.lines()).await?;
    Ok(advertised)
}

// =============================================================================
// Requests
// =============================================================================

/// Header list of a single request, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn command(&self) -> &str {
        self.header("command").unwrap_or("")
    }

    pub fn pathname(&self) -> &str {
        self.header("pathname").unwrap_or("")
    }

    pub fn can_delay(&self) -> bool {
        self.header("can-delay") == Some("1")
    }
}

/// Read the next request's headers. The payload is left on the stream.
///
/// Returns `Ok(None)` at a clean end-of-stream.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Request>> {
    let Some(lines) = read_text_list(r).await? else {
        return Ok(None);
    };

    let mut headers = Vec::with_capacity(lines.len());
    for line in lines {
        let (key, value) = line.split_once('=').ok_or_else(|| {
            FilterError::ProtocolViolation(format!("malformed request header {:?}", line))
        })?;
        headers.push((key.to_string(), value.to_string()));
    }
    Ok(Some(Request::new(headers)))
}

/// Request content, read lazily packet by packet up to its flush.
pub struct Payload<'a, R> {
    reader: &'a mut R,
    peeked: Option<Bytes>,
    finished: bool,
    reached_eof: bool,
}

/// Leading bytes of a payload, see [`Payload::read_head`].
#[derive(Debug)]
pub struct Head {
    pub data: BytesMut,
    /// The whole payload fit within the limit.
    pub complete: bool,
}

impl<'a, R: AsyncRead + Unpin> Payload<'a, R> {
    pub fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            peeked: None,
            finished: false,
            reached_eof: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(chunk) = self.peeked.take() {
            return Ok(Some(chunk));
        }
        while !self.finished {
            match read_packet(self.reader).await? {
                Some(Packet::Data(data)) if data.is_empty() => continue,
                Some(Packet::Data(data)) => return Ok(Some(data)),
                Some(Packet::Flush) => self.finished = true,
                None => {
                    self.finished = true;
                    self.reached_eof = true;
                }
            }
        }
        Ok(None)
    }

    /// True when the payload carries no data at all.
    pub async fn is_empty(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.next_chunk().await?;
        }
        Ok(self.peeked.is_none())
    }

    /// Read up to `limit` bytes, or slightly more when a packet straddles the
    /// limit.
    pub async fn read_head(&mut self, limit: usize) -> Result<Head> {
        let mut data = BytesMut::new();
        while data.len() <= limit {
            match self.next_chunk().await? {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => {
                    return Ok(Head {
                        data,
                        complete: true,
                    })
                }
            }
        }
        Ok(Head {
            data,
            complete: false,
        })
    }

    /// Discard the rest of the payload. Returns the number of bytes skipped.
    pub async fn drain(&mut self) -> Result<u64> {
        let mut skipped = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            skipped += chunk.len() as u64;
        }
        Ok(skipped)
    }

    /// The stream ended before the payload's flush packet.
    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }
}

// =============================================================================
// Responses
// =============================================================================

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: Status) -> Result<()> {
    write_text_list(w, [format!("status={}", status)]).await
}

pub async fn write_list<W, I, S>(w: &mut W, items: I) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    write_text_list(w, items).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::protocol::encode_packet;

    const FLUSH: &str = "<flush>";

    fn pkt(data: &str) -> Vec<u8> {
        encode_packet(data.as_bytes()).unwrap().to_vec()
    }

    fn stream(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            if *p == FLUSH {
                out.extend_from_slice(b"0000");
            } else {
                out.extend(pkt(p));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_initialize_ok() {
        let input = stream(&["git-filter-client\n", "version=2\n", FLUSH]);
        let mut out = Vec::new();
        initialize(&mut &input[..], &mut out).await.unwrap();
        assert_eq!(
            out,
            stream(&["git-filter-server\n", "version=2\n", FLUSH])
        );
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_welcome() {
        let input = stream(&["git-filter-somebody\n", "version=2\n", FLUSH]);
        let err = initialize(&mut &input[..], &mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, FilterError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_version() {
        let input = stream(&["git-filter-client\n", "version=3\n", FLUSH]);
        let err = initialize(&mut &input[..], &mut Vec::new()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_negotiate_capabilities_intersection() {
        let input = stream(&[
            "capability=clean\n",
            "capability=smudge\n",
            "capability=not-yet-invented\n",
            FLUSH,
        ]);
        let mut out = Vec::new();
        let caps = negotiate_capabilities(&mut &input[..], &mut out).await.unwrap();

        assert!(caps.contains("capability=not-yet-invented"));
        assert!(!caps.contains(CAPABILITY_DELAY));
        assert_eq!(
            out,
            stream(&["capability=clean\n", "capability=smudge\n", FLUSH])
        );
    }

    #[tokio::test]
    async fn test_negotiate_capabilities_with_delay() {
        let input = stream(&[
            "capability=clean\n",
            "capability=smudge\n",
            "capability=delay\n",
            FLUSH,
        ]);
        let mut out = Vec::new();
        let caps = negotiate_capabilities(&mut &input[..], &mut out).await.unwrap();
        assert!(Capabilities::from_advertised(&caps).contains(Capabilities::DELAY));
        assert_eq!(
            out,
            stream(&[
                "capability=clean\n",
                "capability=smudge\n",
                "capability=delay\n",
                FLUSH
            ])
        );
    }

    #[tokio::test]
    async fn test_negotiate_requires_clean_and_smudge() {
        let input = stream(&["capability=clean\n", FLUSH]);
        let err = negotiate_capabilities(&mut &input[..], &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_read_request_and_payload() {
        let input = stream(&[
            "command=smudge\n",
            "pathname=a.bin\n",
            "can-delay=1\n",
            FLUSH,
            "abc",
            "def",
            FLUSH,
        ]);
        let mut reader = &input[..];
        let req = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.command(), "smudge");
        assert_eq!(req.pathname(), "a.bin");
        assert!(req.can_delay());

        let mut payload = Payload::new(&mut reader);
        let head = payload.read_head(1024).await.unwrap();
        assert!(head.complete);
        assert_eq!(&head.data[..], b"abcdef");
        assert!(!payload.reached_eof());

        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_request_malformed_header() {
        let input = stream(&["command\n", FLUSH]);
        let err = read_request(&mut &input[..]).await.unwrap_err();
        assert!(matches!(err, FilterError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_payload_is_empty_then_drain() {
        let input = stream(&[FLUSH, "0123", FLUSH]);
        let mut reader = &input[..];
        {
            let mut payload = Payload::new(&mut reader);
            assert!(payload.is_empty().await.unwrap());
            assert_eq!(payload.drain().await.unwrap(), 0);
        }
        let mut payload = Payload::new(&mut reader);
        assert!(!payload.is_empty().await.unwrap());
        assert_eq!(payload.drain().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_payload_head_exceeds_limit() {
        let input = stream(&["0123456789", "abcdef", FLUSH]);
        let mut reader = &input[..];
        let mut payload = Payload::new(&mut reader);
        let head = payload.read_head(4).await.unwrap();
        assert!(!head.complete);
        assert_eq!(&head.data[..], b"0123456789");
        assert_eq!(payload.drain().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_payload_eof_before_flush() {
        let input = stream(&["abc"]);
        let mut reader = &input[..];
        let mut payload = Payload::new(&mut reader);
        assert_eq!(payload.drain().await.unwrap(), 3);
        assert!(payload.reached_eof());
    }

    #[tokio::test]
    async fn test_write_status() {
        let mut out = Vec::new();
        write_status(&mut out, Status::Delayed).await.unwrap();
        assert_eq!(out, stream(&["status=delayed\n", FLUSH]));
    }
}
