//! Transport handle: one TCP or TLS stream to the directory server, LDAP message framing,
//! message id allocation, and a non-blocking drain used on every readiness edge.
//!
//! Search entries are held back per message id until their SearchResultDone arrives, so the
//! dispatcher always sees a complete result chain. Messages of the claimed sync search bypass
//! that and are queued one by one for the sync engine.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use rustls::client::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::ldap_protocol::{
    encode_ldap_message, parse_ldap_message, parse_ldap_message_header, Control, ExtendedRequest, LdapMessage,
    ProtocolOp, START_TLS_OID,
};
use crate::tls;

const LDAP_PORT: u16 = 389;
const LDAPS_PORT: u16 = 636;

/// Every LDAPMessage is a universal SEQUENCE.
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

const READ_CHUNK: usize = 16 * 1024;

/// Released sync ids whose late messages are still dropped.
const ABANDONED_SYNC_IDS: usize = 8;

/// Host, port and TLS flag of an `ldap://` or `ldaps://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl LdapUrl {
    /// Accepts `ldap://host[:port][/...]` and `ldaps://...`; IPv6 hosts in brackets.
    pub fn parse(uri: &str) -> Result<Self> {
        let (rest, tls) = if let Some(rest) = uri.strip_prefix("ldap://") {
            (rest, false)
        } else if let Some(rest) = uri.strip_prefix("ldaps://") {
            (rest, true)
        } else {
            return Err(Error::Init(format!("Invalid LDAP URI scheme: {}", uri)));
        };
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let default_port = if tls { LDAPS_PORT } else { LDAP_PORT };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::Init(format!("Unterminated IPv6 host in URI: {}", uri)))?;
            match after.strip_prefix(':') {
                Some(port) => (host, parse_port(port, uri)?),
                None if after.is_empty() => (host, default_port),
                None => return Err(Error::Init(format!("Invalid host in URI: {}", uri))),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port, uri)?),
                None => (authority, default_port),
            }
        };
        if host.is_empty() {
            return Err(Error::Init(format!("No host in URI: {}", uri)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

fn parse_port(port: &str, uri: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::Init(format!("Invalid port in URI: {}", uri)))
}

/// Stream to the directory server: plain TCP (ldap://) or TLS (ldaps:// or after StartTLS).
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of trying to frame one LDAP message from the buffer.
pub(crate) enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// A complete frame that does not decode; `message_id` is 0 when even the header is unreadable.
    ParseError { message_id: i32 },
}

/// Frame and decode the next message. `Err` means the byte stream is out of sync and cannot
/// be recovered.
pub(crate) fn try_parse_message(buffer: &mut BytesMut) -> anyhow::Result<TryParseResult> {
    if buffer.len() < 2 {
        return Ok(TryParseResult::Incomplete);
    }
    if buffer[0] != LDAP_MESSAGE_SEQUENCE_TAG {
        bail!("Expected LDAPMessage SEQUENCE, got tag 0x{:02x}", buffer[0]);
    }

    let first_len_byte = buffer[1];
    let total_length = if (first_len_byte & 0x80) == 0 {
        2 + first_len_byte as usize
    } else {
        let length_bytes = (first_len_byte & 0x7F) as usize;
        if length_bytes == 0 || length_bytes > 4 {
            bail!("Unsupported LDAPMessage length encoding 0x{:02x}", first_len_byte);
        }
        if buffer.len() < 2 + length_bytes {
            return Ok(TryParseResult::Incomplete);
        }
        let content_length = buffer[2..2 + length_bytes]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        2 + length_bytes + content_length
    };

    if buffer.len() < total_length {
        return Ok(TryParseResult::Incomplete);
    }

    let frame = buffer.split_to(total_length);
    match parse_ldap_message(&frame) {
        Ok(message) => Ok(TryParseResult::Message(message)),
        Err(e) => {
            let hex_preview: String = frame
                .iter()
                .take(64)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            warn!(
                "Failed to parse LDAP message: {} (first 64 bytes: {})",
                e, hex_preview
            );
            let (message_id, _) = parse_ldap_message_header(&frame).unwrap_or((0, 0));
            Ok(TryParseResult::ParseError { message_id })
        }
    }
}

/// One unit of work for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A search's entries followed by its SearchResultDone, or any single other message.
    Chain(Vec<LdapMessage>),
    /// A framed message that could not be decoded.
    Malformed(i32),
}

/// Outcome of one non-blocking poll.
#[derive(Debug, PartialEq)]
pub enum Polled<T> {
    Ready(T),
    /// Nothing available right now.
    Empty,
    /// Peer closed the stream or it failed.
    Closed,
}

pub struct Transport {
    stream: LdapStream,
    read_buf: BytesMut,
    next_id: i32,
    closed: bool,
    ready: VecDeque<Incoming>,
    /// Search entries waiting for their SearchResultDone, by message id.
    partial: HashMap<i32, Vec<LdapMessage>>,
    sync_id: Option<i32>,
    sync_ready: VecDeque<LdapMessage>,
    /// Recently released sync searches; the server may still be answering them.
    abandoned: VecDeque<i32>,
}

impl Transport {
    /// Connect within `timeout`, wrapping the socket in TLS for ldaps://.
    pub async fn connect(url: &LdapUrl, timeout: Duration, tls_config: Option<Arc<ClientConfig>>) -> Result<Self> {
        let addr = format!("{}:{}", url.host, url.port);
        let tcp = match tokio::time::timeout(timeout, TcpStream::connect((url.host.as_str(), url.port))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(Error::ServerDown(format!("Failed to connect to {}: {}", addr, e))),
            Err(_) => return Err(Error::ServerDown(format!("Connect to {} timed out", addr))),
        };
        let _ = tcp.set_nodelay(true);
        let stream = if url.tls {
            let config = tls_config.ok_or_else(|| Error::Tls("No TLS configuration for ldaps://".to_string()))?;
            LdapStream::Tls(Box::new(handshake(tcp, &url.host, config, timeout).await?))
        } else {
            LdapStream::Tcp(tcp)
        };
        debug!("Connected to {}", addr);
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: LdapStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            next_id: 1,
            closed: false,
            ready: VecDeque::new(),
            partial: HashMap::new(),
            sync_id: None,
            sync_ready: VecDeque::new(),
            abandoned: VecDeque::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, LdapStream::Tls(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next message id; wraps from `i32::MAX` back to 1.
    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Encode and write one request. Never waits for a response.
    pub async fn send(&mut self, op: ProtocolOp, controls: Vec<Control>) -> std::io::Result<i32> {
        let message_id = self.allocate_id();
        let message = LdapMessage::new(message_id, op).with_controls(controls);
        let bytes = encode_ldap_message(&message);
        if let Err(e) = self.write_frame(&bytes).await {
            self.closed = true;
            return Err(e);
        }
        Ok(message_id)
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Upgrade a plain connection with the StartTLS extended operation. Nothing else may be
    /// in flight.
    pub async fn start_tls(mut self, host: &str, config: Arc<ClientConfig>, timeout: Duration) -> Result<Self> {
        if self.is_tls() {
            return Err(Error::Tls("Connection is already using TLS".to_string()));
        }
        let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: START_TLS_OID.to_string(),
            request_value: None,
        });
        let message_id = self
            .send(op, Vec::new())
            .await
            .map_err(|e| Error::Tls(format!("Send StartTLS request: {}", e)))?;

        let response = match tokio::time::timeout(timeout, self.read_response(message_id)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Tls("StartTLS response timed out".to_string())),
        };
        let result = response
            .protocol_op
            .ldap_result()
            .ok_or_else(|| Error::Tls("Unexpected response to StartTLS".to_string()))?;
        if result.result_code != 0 {
            return Err(Error::Tls(format!(
                "StartTLS rejected ({}): {}",
                result.result_code, result.diagnostic_message
            )));
        }
        if !self.read_buf.is_empty() {
            return Err(Error::Tls("Unexpected data after StartTLS response".to_string()));
        }

        let tcp = match self.stream {
            LdapStream::Tcp(tcp) => tcp,
            LdapStream::Tls(_) => return Err(Error::Tls("Connection is already using TLS".to_string())),
        };
        let tls_stream = handshake(tcp, host, config, timeout).await?;
        debug!("StartTLS negotiated with {}", host);
        let mut upgraded = Self::from_stream(LdapStream::Tls(Box::new(tls_stream)));
        upgraded.next_id = self.next_id;
        Ok(upgraded)
    }

    /// Block until the response to `message_id` arrives. Only used before the dispatcher runs.
    async fn read_response(&mut self, message_id: i32) -> Result<LdapMessage> {
        loop {
            match try_parse_message(&mut self.read_buf) {
                Ok(TryParseResult::Message(msg)) if msg.message_id == message_id => return Ok(msg),
                Ok(TryParseResult::Message(msg)) => {
                    debug!("Ignoring message {} while waiting for {}", msg.message_id, message_id);
                    continue;
                }
                Ok(TryParseResult::ParseError { .. }) => {
                    return Err(Error::Tls("Undecodable response during StartTLS".to_string()))
                }
                Ok(TryParseResult::Incomplete) => {}
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| Error::Tls(format!("Read StartTLS response: {}", e)))?;
            if n == 0 {
                return Err(Error::Tls("Connection closed during StartTLS".to_string()));
            }
        }
    }

    /// Route every subsequent message with this id to the sync queue.
    pub fn claim_sync(&mut self, message_id: i32) {
        if let Some(entries) = self.partial.remove(&message_id) {
            self.sync_ready.extend(entries);
        }
        self.abandoned.retain(|id| *id != message_id);
        self.sync_id = Some(message_id);
    }

    /// Forget the sync search. Messages the server still sends for it are dropped.
    pub fn release_sync(&mut self) {
        if let Some(message_id) = self.sync_id.take() {
            self.partial.remove(&message_id);
            if self.abandoned.len() == ABANDONED_SYNC_IDS {
                self.abandoned.pop_front();
            }
            self.abandoned.push_back(message_id);
        }
        self.sync_ready.clear();
    }

    /// True while framed responses wait for the dispatcher.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn has_pending(&self) -> bool {
        !self.ready.is_empty() || !self.sync_ready.is_empty()
    }

    /// Wait until at least one dispatchable message is framed, or the stream ends.
    /// Cancel safe: bytes are only consumed by a completed read.
    pub async fn readable(&mut self) {
        while !self.has_pending() && !self.closed {
            self.read_buf.reserve(READ_CHUNK);
            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    debug!("Directory server closed the connection");
                    self.closed = true;
                }
                Ok(_) => self.frame_buffered(),
                Err(e) => {
                    debug!("Read failed: {}", e);
                    self.closed = true;
                }
            }
        }
    }

    /// Read whatever the socket already holds without waiting.
    fn fill_nonblocking(&mut self) {
        if self.closed {
            return;
        }
        let mut cx = TaskContext::from_waker(Waker::noop());
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
                Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                    debug!("Directory server closed the connection");
                    self.closed = true;
                    break;
                }
                Poll::Ready(Ok(())) => self.read_buf.extend_from_slice(buf.filled()),
                Poll::Ready(Err(e)) => {
                    debug!("Read failed: {}", e);
                    self.closed = true;
                    break;
                }
                Poll::Pending => break,
            }
        }
        self.frame_buffered();
    }

    fn frame_buffered(&mut self) {
        loop {
            match try_parse_message(&mut self.read_buf) {
                Ok(TryParseResult::Incomplete) => break,
                Ok(TryParseResult::Message(msg)) => self.route(msg),
                Ok(TryParseResult::ParseError { message_id }) => {
                    self.ready.push_back(Incoming::Malformed(message_id));
                }
                Err(e) => {
                    error!("LDAP stream out of sync, dropping connection: {}", e);
                    self.read_buf.clear();
                    self.closed = true;
                    break;
                }
            }
        }
    }

    fn route(&mut self, msg: LdapMessage) {
        if Some(msg.message_id) == self.sync_id {
            self.sync_ready.push_back(msg);
            return;
        }
        if self.abandoned.contains(&msg.message_id) {
            debug!("Dropping message {} of a stopped sync search", msg.message_id);
            if matches!(msg.protocol_op, ProtocolOp::SearchResultDone(_)) {
                self.abandoned.retain(|id| *id != msg.message_id);
            }
            return;
        }
        match msg.protocol_op {
            ProtocolOp::SearchResultEntry(_) => {
                self.partial.entry(msg.message_id).or_default().push(msg);
            }
            ProtocolOp::SearchResultDone(_) => {
                let mut chain = self.partial.remove(&msg.message_id).unwrap_or_default();
                chain.push(msg);
                self.ready.push_back(Incoming::Chain(chain));
            }
            _ => self.ready.push_back(Incoming::Chain(vec![msg])),
        }
    }

    /// Zero-wait poll for the next dispatchable unit.
    pub fn poll_incoming(&mut self) -> Polled<Incoming> {
        if self.ready.is_empty() {
            self.fill_nonblocking();
        }
        match self.ready.pop_front() {
            Some(incoming) => Polled::Ready(incoming),
            None if self.closed => Polled::Closed,
            None => Polled::Empty,
        }
    }

    /// Zero-wait poll for the next message of the claimed sync search.
    pub fn poll_sync(&mut self) -> Polled<LdapMessage> {
        if self.sync_ready.is_empty() {
            self.fill_nonblocking();
        }
        match self.sync_ready.pop_front() {
            Some(msg) => Polled::Ready(msg),
            None if self.closed => Polled::Closed,
            None => Polled::Empty,
        }
    }

    /// Best-effort unbind and shutdown.
    pub async fn shutdown(mut self) {
        if !self.closed {
            let _ = self.send(ProtocolOp::UnbindRequest, Vec::new()).await;
        }
        let _ = self.stream.shutdown().await;
    }
}

async fn handshake(
    tcp: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<ClientTlsStream<TcpStream>> {
    let server_name = tls::server_name(host).map_err(|e| Error::Tls(e.to_string()))?;
    let connector = TlsConnector::from(config);
    match tokio::time::timeout(timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Tls(format!("TLS handshake with {} failed: {}", host, e))),
        Err(_) => Err(Error::Tls(format!("TLS handshake with {} timed out", host))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{IntermediateResponse, LdapResult, SearchResultEntry};

    fn frame(msg: &LdapMessage) -> Vec<u8> {
        encode_ldap_message(msg)
    }

    fn entry(id: i32, dn: &str) -> LdapMessage {
        LdapMessage::new(
            id,
            ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: dn.to_string(),
                attributes: Vec::new(),
            }),
        )
    }

    fn done(id: i32) -> LdapMessage {
        LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(
            LdapUrl::parse("ldap://localhost").unwrap(),
            LdapUrl {
                host: "localhost".to_string(),
                port: 389,
                tls: false
            }
        );
        let url = LdapUrl::parse("ldaps://ldap.example.com:1636/dc=com").unwrap();
        assert_eq!((url.host.as_str(), url.port, url.tls), ("ldap.example.com", 1636, true));
        let url = LdapUrl::parse("ldap://[::1]:10389").unwrap();
        assert_eq!((url.host.as_str(), url.port), ("::1", 10389));
        assert_eq!(LdapUrl::parse("ldaps://[::1]").unwrap().port, 636);
    }

    #[test]
    fn test_parse_url_rejects_bad_input() {
        assert!(matches!(LdapUrl::parse("http://x"), Err(Error::Init(_))));
        assert!(matches!(LdapUrl::parse("ldap://"), Err(Error::Init(_))));
        assert!(matches!(LdapUrl::parse("ldap://host:notaport"), Err(Error::Init(_))));
        assert!(matches!(LdapUrl::parse("ldap://[::1"), Err(Error::Init(_))));
    }

    #[test]
    fn test_try_parse_incomplete_then_complete() {
        let bytes = frame(&done(7));
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(matches!(try_parse_message(&mut buf).unwrap(), TryParseResult::Incomplete));
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        match try_parse_message(&mut buf).unwrap() {
            TryParseResult::Message(msg) => assert_eq!(msg.message_id, 7),
            _ => panic!("expected message"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_parse_two_coalesced_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame(&entry(2, "cn=a")));
        buf.extend_from_slice(&frame(&done(2)));
        assert!(matches!(try_parse_message(&mut buf).unwrap(), TryParseResult::Message(_)));
        assert!(matches!(try_parse_message(&mut buf).unwrap(), TryParseResult::Message(_)));
        assert!(matches!(try_parse_message(&mut buf).unwrap(), TryParseResult::Incomplete));
    }

    #[test]
    fn test_try_parse_unknown_op_keeps_message_id() {
        // messageID 5, application tag 0x7E with empty content
        let mut buf = BytesMut::from(&[0x30, 0x05, 0x02, 0x01, 0x05, 0x7E, 0x00][..]);
        match try_parse_message(&mut buf).unwrap() {
            TryParseResult::ParseError { message_id } => assert_eq!(message_id, 5),
            _ => panic!("expected parse error"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_try_parse_out_of_sync_stream() {
        let mut buf = BytesMut::from(&[0x04, 0x01, 0x00][..]);
        assert!(try_parse_message(&mut buf).is_err());
        let mut buf = BytesMut::from(&[0x30, 0x80, 0x00][..]);
        assert!(try_parse_message(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_chain_accumulation_and_sync_claim() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let (client, accepted) = tokio::join!(
            Transport::connect(&url, Duration::from_secs(5), None),
            listener.accept()
        );
        let mut transport = client.unwrap();
        let (mut server, _) = accepted.unwrap();

        transport.claim_sync(9);
        let mut bytes = Vec::new();
        for msg in [entry(3, "cn=a"), entry(9, "cn=s"), entry(3, "cn=b"), done(3)] {
            bytes.extend(frame(&msg));
        }
        server.write_all(&bytes).await.unwrap();

        // The bytes may arrive over several reads; drain both queues on every edge.
        let mut sync_messages = Vec::new();
        let mut chain = None;
        while chain.is_none() {
            transport.readable().await;
            while let Polled::Ready(msg) = transport.poll_sync() {
                sync_messages.push(msg);
            }
            match transport.poll_incoming() {
                Polled::Ready(Incoming::Chain(c)) => chain = Some(c),
                Polled::Ready(other) => panic!("unexpected {:?}", other),
                Polled::Empty => {}
                Polled::Closed => panic!("closed"),
            }
        }
        let chain = chain.unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain.iter().all(|m| m.message_id == 3));
        assert_eq!(sync_messages.len(), 1);
        assert_eq!(sync_messages[0].message_id, 9);
        assert_eq!(transport.poll_sync(), Polled::Empty);

        drop(server);
        transport.readable().await;
        assert_eq!(transport.poll_incoming(), Polled::Closed);
    }

    #[tokio::test]
    async fn test_released_sync_messages_are_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let (client, accepted) = tokio::join!(
            Transport::connect(&url, Duration::from_secs(5), None),
            listener.accept()
        );
        let mut transport = client.unwrap();
        let (mut server, _) = accepted.unwrap();

        transport.claim_sync(9);
        transport.release_sync();
        let info = LdapMessage::new(
            9,
            ProtocolOp::IntermediateResponse(IntermediateResponse {
                response_name: Some("1.3.6.1.4.1.4203.1.9.1.4".to_string()),
                response_value: Some(vec![0x80, 0x01, 0x31]),
            }),
        );
        let mut bytes = Vec::new();
        for msg in [entry(9, "cn=late"), info, entry(4, "cn=a"), done(4)] {
            bytes.extend(frame(&msg));
        }
        server.write_all(&bytes).await.unwrap();

        let mut chains = Vec::new();
        while chains.is_empty() {
            transport.readable().await;
            while let Polled::Ready(incoming) = transport.poll_incoming() {
                chains.push(incoming);
            }
        }
        assert_eq!(chains.len(), 1);
        match &chains[0] {
            Incoming::Chain(chain) => {
                assert_eq!(chain.len(), 2);
                assert!(chain.iter().all(|m| m.message_id == 4));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(transport.partial.is_empty());
        assert_eq!(transport.poll_sync(), Polled::Empty);
        assert!(!transport.has_ready());
    }

    #[tokio::test]
    async fn test_message_ids_start_at_one_and_wrap() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let (client, accepted) = tokio::join!(
            Transport::connect(&url, Duration::from_secs(5), None),
            listener.accept()
        );
        let mut transport = client.unwrap();
        let _server = accepted.unwrap();
        assert_eq!(transport.send(ProtocolOp::AbandonRequest(0), Vec::new()).await.unwrap(), 1);
        assert_eq!(transport.send(ProtocolOp::AbandonRequest(0), Vec::new()).await.unwrap(), 2);
        transport.next_id = i32::MAX;
        assert_eq!(transport.allocate_id(), i32::MAX);
        assert_eq!(transport.allocate_id(), 1);
    }

    #[tokio::test]
    async fn test_connect_refused_is_server_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let result = Transport::connect(&url, Duration::from_secs(5), None).await;
        assert!(matches!(result, Err(Error::ServerDown(_))));
    }
}
