//! Reconnecting framed TCP transport
//!
//! One transport owns one socket and one framing discipline: `Text`
//! reads LF-delimited lines, `Binary` reads 80-byte headers plus
//! payloads. The socket lives inside a spawned task; the rest of the
//! library talks to it through a bounded write queue, a state watch and
//! a message channel. Nothing holds a reference back into the client,
//! so teardown is a cancellation token away.
//!
//! On any read/write error the task drops the socket, reports `Down`,
//! and retries the connect with full-jitter exponential backoff until it
//! succeeds (`Up`), the attempt budget runs out, or the token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::{Error, Result};
use crate::frame::BinaryFrame;
use crate::protocol::binary::{decode_header, frame_from_parts};
use crate::protocol::FRAME_HEADER_SIZE;

/// Framing discipline for one transport. Mixed channels are not
/// supported on a single socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// LF-delimited UTF-8 lines (control channel)
    Text,
    /// Length-prefixed binary frames (imaging channel)
    Binary,
}

/// Link lifecycle. `Closing`/`Closed` are terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// What the transport task hands to its consumer.
#[derive(Debug)]
pub enum TransportMessage {
    /// One decoded text line, delimiter stripped
    Line(String),
    /// One decoded binary frame
    Frame(BinaryFrame),
    /// Link re-established after a loss
    Up,
    /// Link lost; a reconnect cycle is starting
    Down,
}

/// Handle to a running transport task.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing: mpsc::Sender<Bytes>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    write_queue_timeout: Duration,
    protocol_errors: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// True while the socket is open and the reader is live.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Count of malformed inputs tolerated so far this process.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Submit bytes to the bounded write queue.
    ///
    /// Fails fast with `Disconnected` while the link is down, and with
    /// `Overloaded` when the queue stays full past its timeout.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.state() != LinkState::Connected {
            return Err(Error::Disconnected);
        }
        match timeout(self.write_queue_timeout, self.outgoing.send(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Overloaded),
        }
    }

    /// Block until the link reports `Connected`, up to `limit`.
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let wait = async move {
            loop {
                match *state.borrow_and_update() {
                    LinkState::Connected => return Ok(()),
                    LinkState::Closing | LinkState::Closed => return Err(Error::Disconnected),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(Error::Disconnected);
                }
            }
        };
        timeout(limit, wait).await.map_err(|_| Error::Disconnected)?
    }

    /// Tear the transport down. Completes promptly even while the task
    /// is mid-backoff.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Open a transport: connect once (failing with `ConnectFailed` on
/// timeout or refusal), then hand the socket to a background task.
///
/// Returns the handle plus the single consumer end of the message
/// stream.
pub async fn open(
    addr: String,
    mode: TransportMode,
    config: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(TransportHandle, mpsc::Receiver<TransportMessage>)> {
    let stream = connect(&addr, config.connect_timeout).await?;
    info!(addr = %addr, ?mode, "transport connected");

    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.write_queue_size.max(1));
    let (incoming_tx, incoming_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(LinkState::Connected);
    let protocol_errors = Arc::new(AtomicU64::new(0));

    let task = TransportTask {
        addr,
        mode,
        connect_timeout: config.connect_timeout,
        read_idle_timeout: config.read_idle_timeout,
        reconnect: config.reconnect.clone(),
        incoming: incoming_tx,
        state: state_tx,
        cancel: cancel.clone(),
        protocol_errors: Arc::clone(&protocol_errors),
    };
    tokio::spawn(task.run(stream, outgoing_rx));

    let handle = TransportHandle {
        outgoing: outgoing_tx,
        state: state_rx,
        cancel,
        write_queue_timeout: config.write_queue_timeout,
        protocol_errors,
    };
    Ok((handle, incoming_rx))
}

async fn connect(addr: &str, limit: Duration) -> Result<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectFailed(format!("{addr}: {e}"))),
        Err(_) => Err(Error::ConnectFailed(format!("{addr}: connect timed out"))),
    }
}

/// Full-jitter exponential backoff delay for the n-th consecutive
/// failure: `min(cap, base * 2^n) * uniform(0.5, 1.0)`.
pub fn backoff_delay(config: &ReconnectConfig, failures: u32) -> Duration {
    let exp = config.base.saturating_mul(1u32 << failures.min(6));
    let capped = exp.min(config.cap);
    capped.mul_f64(rand::rng().random_range(0.5..=1.0))
}

enum SessionEnd {
    /// Cancellation or all handles dropped; do not reconnect
    Closed,
    /// Read/write failure, EOF or idle timeout; reconnect
    Lost,
}

struct TransportTask {
    addr: String,
    mode: TransportMode,
    connect_timeout: Duration,
    read_idle_timeout: Duration,
    reconnect: ReconnectConfig,
    incoming: mpsc::Sender<TransportMessage>,
    state: watch::Sender<LinkState>,
    cancel: CancellationToken,
    protocol_errors: Arc<AtomicU64>,
}

impl TransportTask {
    async fn run(self, first: TcpStream, mut outgoing: mpsc::Receiver<Bytes>) {
        let mut stream = first;
        loop {
            match self.run_session(stream, &mut outgoing).await {
                SessionEnd::Closed => {
                    let _ = self.state.send(LinkState::Closed);
                    return;
                }
                SessionEnd::Lost => {}
            }

            let _ = self.state.send(LinkState::Reconnecting);
            if self.incoming.send(TransportMessage::Down).await.is_err() {
                let _ = self.state.send(LinkState::Closed);
                return;
            }
            // Writes queued against the dead socket are stale; their
            // requests were already failed on the Down notification.
            while outgoing.try_recv().is_ok() {}

            match self.reconnect_with_backoff().await {
                Some(next) => {
                    let _ = self.state.send(LinkState::Connected);
                    if self.incoming.send(TransportMessage::Up).await.is_err() {
                        let _ = self.state.send(LinkState::Closed);
                        return;
                    }
                    stream = next;
                }
                None => {
                    let _ = self.state.send(LinkState::Closed);
                    return;
                }
            }
        }
    }

    /// Drive one connected socket until it fails or the task is told to
    /// stop. Reads are buffered so a cancelled poll never loses bytes.
    async fn run_session(
        &self,
        stream: TcpStream,
        outgoing: &mut mpsc::Receiver<Bytes>,
    ) -> SessionEnd {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::with_capacity(8 * 1024);

        loop {
            // Drain complete messages already buffered before touching
            // the socket again.
            loop {
                match self.extract_message(&mut buf) {
                    Ok(Some(msg)) => {
                        if self.incoming.send(msg).await.is_err() {
                            return SessionEnd::Closed;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        match self.mode {
                            // A bad line is skipped; the next one parses
                            // from a clean delimiter boundary.
                            TransportMode::Text => {
                                warn!(error = %e, "malformed line skipped");
                            }
                            // A bad header leaves no way to resync.
                            TransportMode::Binary => {
                                warn!(error = %e, "malformed frame, dropping connection");
                                return SessionEnd::Lost;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.state.send(LinkState::Closing);
                    let _ = write_half.shutdown().await;
                    return SessionEnd::Closed;
                }
                data = outgoing.recv() => {
                    match data {
                        Some(bytes) => {
                            if let Err(e) = write_all(&mut write_half, &bytes).await {
                                warn!(error = %e, "write failed");
                                return SessionEnd::Lost;
                            }
                        }
                        // Every handle dropped: nothing can use this
                        // transport again.
                        None => return SessionEnd::Closed,
                    }
                }
                read = timeout(self.read_idle_timeout, read_half.read_buf(&mut buf)) => {
                    match read {
                        Ok(Ok(0)) => {
                            debug!("peer closed the connection");
                            return SessionEnd::Lost;
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!(error = %e, "read failed");
                            return SessionEnd::Lost;
                        }
                        Err(_) => {
                            warn!(idle = ?self.read_idle_timeout, "no bytes within idle window");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Pull one complete message out of the buffer, if present.
    fn extract_message(&self, buf: &mut BytesMut) -> Result<Option<TransportMessage>> {
        match self.mode {
            TransportMode::Text => {
                let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                    return Ok(None);
                };
                let mut line = buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let text = String::from_utf8(line.to_vec())
                    .map_err(|_| Error::Protocol("non-utf8 line".to_string()))?;
                Ok(Some(TransportMessage::Line(text)))
            }
            TransportMode::Binary => {
                if buf.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                // Validates magic and length bounds before any payload
                // is buffered, so an oversized announcement never
                // allocates.
                let header = decode_header(&buf[..FRAME_HEADER_SIZE])?;
                let total = header.length as usize;
                if buf.len() < total {
                    buf.reserve(total - buf.len());
                    return Ok(None);
                }
                let mut frame_bytes = buf.split_to(total);
                frame_bytes.advance(FRAME_HEADER_SIZE);
                Ok(Some(TransportMessage::Frame(frame_from_parts(
                    header,
                    frame_bytes.freeze(),
                ))))
            }
        }
    }

    async fn reconnect_with_backoff(&self) -> Option<TcpStream> {
        let mut failures: u32 = 0;
        let mut attempts: u32 = 0;
        loop {
            if let Some(max) = self.reconnect.max_attempts {
                if attempts >= max {
                    warn!(attempts, "reconnect attempt budget exhausted");
                    return None;
                }
            }
            let delay = backoff_delay(&self.reconnect, failures);
            debug!(?delay, attempt = attempts + 1, "backing off before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let _ = self.state.send(LinkState::Connecting);
            attempts += 1;
            match connect(&self.addr, self.connect_timeout).await {
                Ok(stream) => {
                    info!(addr = %self.addr, attempts, "reconnected");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempts, "reconnect failed");
                    failures = (failures + 1).min(6);
                    let _ = self.state.send(LinkState::Reconnecting);
                }
            }
        }
    }
}

async fn write_all<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::protocol::binary::{encode_header, FrameHeader};
    use crate::protocol::MAX_FRAME_SIZE;

    fn text_task() -> TransportTask {
        task_with_mode(TransportMode::Text)
    }

    fn task_with_mode(mode: TransportMode) -> TransportTask {
        let (incoming, _rx) = mpsc::channel(8);
        let (state, _) = watch::channel(LinkState::Connected);
        TransportTask {
            addr: "127.0.0.1:0".to_string(),
            mode,
            connect_timeout: Duration::from_secs(1),
            read_idle_timeout: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
            incoming,
            state,
            cancel: CancellationToken::new(),
            protocol_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    // ========== Backoff bounds ==========

    #[test]
    fn test_backoff_within_jitter_window() {
        let config = ReconnectConfig::default();
        for n in 0..10u32 {
            let nominal = config.base.saturating_mul(1u32 << n.min(6)).min(config.cap);
            for _ in 0..50 {
                let delay = backoff_delay(&config, n);
                assert!(delay <= nominal, "delay {delay:?} above nominal {nominal:?}");
                assert!(
                    delay >= nominal.mul_f64(0.5),
                    "delay {delay:?} below half of {nominal:?}"
                );
                assert!(delay <= config.cap);
            }
        }
    }

    #[test]
    fn test_backoff_exponent_caps_at_six() {
        let config = ReconnectConfig {
            base: Duration::from_millis(1),
            cap: Duration::from_secs(3600),
            max_attempts: None,
        };
        for _ in 0..50 {
            // 2^6 = 64ms nominal even for absurd failure counts
            assert!(backoff_delay(&config, 30) <= Duration::from_millis(64));
        }
    }

    // ========== Text framing ==========

    #[test]
    fn test_extract_text_line() {
        let task = text_task();
        let mut buf = BytesMut::from(&b"{\"id\":1}\n{\"id\":2}\npartial"[..]);

        match task.extract_message(&mut buf).unwrap() {
            Some(TransportMessage::Line(line)) => assert_eq!(line, "{\"id\":1}"),
            other => panic!("unexpected {other:?}"),
        }
        match task.extract_message(&mut buf).unwrap() {
            Some(TransportMessage::Line(line)) => assert_eq!(line, "{\"id\":2}"),
            other => panic!("unexpected {other:?}"),
        }
        // trailing partial line stays buffered
        assert!(task.extract_message(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"partial");
    }

    #[test]
    fn test_extract_strips_carriage_return() {
        let task = text_task();
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        match task.extract_message(&mut buf).unwrap() {
            Some(TransportMessage::Line(line)) => assert_eq!(line, "hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_extract_rejects_non_utf8() {
        let task = text_task();
        let mut buf = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);
        assert!(task.extract_message(&mut buf).is_err());
    }

    // ========== Binary framing ==========

    #[test]
    fn test_extract_binary_frame() {
        let task = task_with_mode(TransportMode::Binary);
        let payload = b"image-bytes";
        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + payload.len()) as u32,
            id: 5,
            kind: 1,
            timestamp_us: 777,
            width: 64,
            height: 48,
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_header(&header));
        buf.extend_from_slice(payload);

        match task.extract_message(&mut buf).unwrap() {
            Some(TransportMessage::Frame(frame)) => {
                assert_eq!(frame.id, 5);
                assert_eq!(frame.kind, FrameKind::Stacked);
                assert_eq!(frame.timestamp_us, 777);
                assert_eq!(&frame.payload[..], payload);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_binary_waits_for_full_frame() {
        let task = task_with_mode(TransportMode::Binary);
        let header = FrameHeader {
            length: (FRAME_HEADER_SIZE + 100) as u32,
            id: 1,
            kind: 0,
            timestamp_us: 0,
            width: 0,
            height: 0,
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_header(&header));
        buf.extend_from_slice(&[0u8; 40]); // partial payload

        assert!(task.extract_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 40);
    }

    #[test]
    fn test_extract_binary_rejects_oversized_announcement() {
        let task = task_with_mode(TransportMode::Binary);
        let mut header = FrameHeader {
            length: 0,
            id: 1,
            kind: 0,
            timestamp_us: 0,
            width: 0,
            height: 0,
        };
        header.length = (MAX_FRAME_SIZE + 1) as u32;
        let mut buf = BytesMut::from(&encode_header(&header)[..]);

        // rejected at the header, before any payload is read
        assert!(task.extract_message(&mut buf).is_err());
    }

    // ========== Open / lifecycle against a real socket ==========

    #[tokio::test]
    async fn test_open_refused() {
        // Port 1 on localhost is essentially never listening
        let config = ClientConfig {
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        let result = open(
            "127.0.0.1:1".to_string(),
            TransportMode::Text,
            &config,
            CancellationToken::new(),
        )
        .await;
        match result {
            Err(Error::ConnectFailed(_)) => {}
            other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_open_reads_lines_and_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"{\"Event\":\"PiStatus\"}\n").await.unwrap();
            // hold the socket open until the client goes away
            let mut scratch = [0u8; 64];
            let _ = sock.read(&mut scratch).await;
        });

        let cancel = CancellationToken::new();
        let (handle, mut rx) = open(
            addr.to_string(),
            TransportMode::Text,
            &ClientConfig::default(),
            cancel.clone(),
        )
        .await
        .unwrap();
        assert!(handle.is_connected());

        match rx.recv().await {
            Some(TransportMessage::Line(line)) => assert_eq!(line, "{\"Event\":\"PiStatus\"}"),
            other => panic!("unexpected {other:?}"),
        }

        handle.close();
        // channel drains to None once the task exits
        while rx.recv().await.is_some() {}
        assert_eq!(handle.state(), LinkState::Closed);
        server.abort();
    }
}
