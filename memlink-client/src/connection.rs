//! # Server Connection
//!
//! Purpose: Own one server's socket, its write and read buffers, and the
//! bookkeeping that decides whether the server is currently usable.
//!
//! ## Design Principles
//! 1. **Lazy Connect**: The socket is opened on the first write, never at
//!    configuration time.
//! 2. **Reusable Buffers**: Each connection keeps its own `BytesMut` buffers;
//!    closing clears them without giving the allocation back.
//! 3. **Reset on Any Fault**: A transport or framing error drops the socket
//!    and zeroes every buffer and counter before the error is returned, so no
//!    half-written command survives a call.
//! 4. **Explicit State**: `Disconnected`, `Connected` and `Failed` are enum
//!    variants; the mode flags (buffering, no-reply) live on the client.
//!
//! ## State Transitions
//!
//! ```text
//! Disconnected --connect ok--> Connected --quit/error--> Disconnected
//!       |                          |
//!       +--failures >= limit-------+----> Failed{until}
//!                                             |
//!         now >= until: one probe connect <---+
//! ```

use std::fmt;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use memlink_common::{CodecError, Response, ServerStatus};
use tracing::{debug, info, warn};

use crate::codec::{Decoded, Frame};
use crate::error::{ClientError, ClientResult};

/// Capacity of the per-connection write buffer.
pub const WRITE_BUFFER_SIZE: usize = 8196;

/// Bytes requested from the transport per read.
const READ_CHUNK_SIZE: usize = 8196;

/// Byte stream to one server.
pub trait Transport: Read + Write + Send {
    /// Closes the stream. Errors are informational; the transport is dropped
    /// either way.
    fn close(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Per-operation socket timeouts. `None` blocks indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// Opens transports.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16, timeouts: &Timeouts) -> io::Result<Box<dyn Transport>>;
}

/// TCP with Nagle disabled and the configured timeouts applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16, timeouts: &Timeouts) -> io::Result<Box<dyn Transport>> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            let stream = match timeouts.connect {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match stream {
                Ok(stream) => {
                    stream.set_read_timeout(timeouts.read)?;
                    stream.set_write_timeout(timeouts.write)?;
                    // Disable Nagle to keep request latency low for small payloads.
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
        }))
    }
}

/// When a server is taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Failures within `window` that mark the server dead. Zero disables it.
    pub limit: u32,
    pub window: Duration,
    /// How long a dead server is skipped.
    pub retry_timeout: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy {
            limit: 5,
            window: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(2),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Skipped by routing until `until`, then probed once.
    Failed { reason: String, until: Instant },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed { reason, .. } => write!(f, "failed ({reason})"),
        }
    }
}

/// Point-in-time view of a connection's buffers and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub has_transport: bool,
    pub write_buffered: usize,
    pub read_buffered: usize,
    pub pending_responses: usize,
    pub cursor_active: bool,
    pub failures: u32,
}

/// One server's socket plus buffers.
pub struct Connection {
    label: String,
    host: String,
    port: u16,
    timeouts: Timeouts,
    policy: FailurePolicy,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    write_buf: BytesMut,
    read_buf: BytesMut,
    /// Replies owed for buffered commands.
    stack_responses: usize,
    /// A multi-reply retrieval is being read.
    cursor_active: bool,
    failures: u32,
    window_start: Option<Instant>,
    /// Reconnected after a retry timeout; no reply has been read since.
    probation: bool,
    /// First failure among drained buffered replies, not yet reported.
    buffered_failure: Option<ServerStatus>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.label)
            .field("state", &self.state)
            .field("stack_responses", &self.stack_responses)
            .field("failures", &self.failures)
            .finish()
    }
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, timeouts: Timeouts, policy: FailurePolicy) -> Self {
        let host = host.into();
        Connection {
            label: format!("{host}:{port}"),
            host,
            port,
            timeouts,
            policy,
            transport: None,
            state: ConnectionState::Disconnected,
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            stack_responses: 0,
            cursor_active: false,
            failures: 0,
            window_start: None,
            probation: false,
            buffered_failure: None,
        }
    }

    /// `host:port`.
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Returns true while a socket is open.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Returns false while the server is marked dead and its retry timeout
    /// has not elapsed.
    pub fn is_available(&self, now: Instant) -> bool {
        match &self.state {
            ConnectionState::Failed { until, .. } => now >= *until,
            _ => true,
        }
    }

    /// Replies still owed for buffered commands.
    #[inline]
    pub fn pending_responses(&self) -> usize {
        self.stack_responses
    }

    pub fn set_cursor_active(&mut self, active: bool) {
        self.cursor_active = active;
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state.clone(),
            has_transport: self.transport.is_some(),
            write_buffered: self.write_buf.len(),
            read_buffered: self.read_buf.len(),
            pending_responses: self.stack_responses,
            cursor_active: self.cursor_active,
            failures: self.failures,
        }
    }

    /// Opens the socket if it is not open yet.
    pub fn connect(&mut self, connector: &dyn Connector) -> ClientResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }

        let probing = match &self.state {
            ConnectionState::Failed { until, .. } if Instant::now() < *until => {
                return Err(ClientError::io(
                    &self.label,
                    io::Error::new(io::ErrorKind::NotConnected, "server is marked dead"),
                ));
            }
            ConnectionState::Failed { .. } => {
                debug!(server = %self.label, "probing server after retry timeout");
                true
            }
            _ => false,
        };

        match connector.connect(&self.host, self.port, &self.timeouts) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = ConnectionState::Connected;
                if probing {
                    debug!(server = %self.label, "probe connected, awaiting first reply");
                    self.probation = true;
                }
                debug!(server = %self.label, "connected");
                Ok(())
            }
            Err(err) => {
                warn!(server = %self.label, error = %err, "connect failed");
                Err(self.fail(err))
            }
        }
    }

    /// Queues `frame` in the write buffer. `expects_reply` adds to the
    /// replies owed by this connection.
    pub fn enqueue(
        &mut self,
        connector: &dyn Connector,
        frame: &Frame<'_>,
        expects_reply: bool,
    ) -> ClientResult<()> {
        self.connect(connector)?;

        let len = frame.len();
        if self.write_buf.len() + len > WRITE_BUFFER_SIZE {
            self.flush()?;
        }
        if len > WRITE_BUFFER_SIZE {
            self.write_frame(frame)?;
        } else {
            for segment in frame.segments() {
                self.write_buf.extend_from_slice(segment);
            }
        }

        if expects_reply {
            self.stack_responses += 1;
        }
        Ok(())
    }

    /// Writes `frame` immediately, after anything already buffered.
    pub fn send(&mut self, connector: &dyn Connector, frame: &Frame<'_>) -> ClientResult<()> {
        self.connect(connector)?;
        self.flush()?;
        self.write_frame(frame)
    }

    /// Pushes the write buffer to the transport.
    pub fn flush(&mut self) -> ClientResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.drain_write_buffer().map_err(|err| self.fail(err))
    }

    fn write_frame(&mut self, frame: &Frame<'_>) -> ClientResult<()> {
        let result = match self.transport.as_mut() {
            Some(transport) => write_vectored_all(transport.as_mut(), frame),
            None => Err(not_connected()),
        };
        result.map_err(|err| self.fail(err))
    }

    fn drain_write_buffer(&mut self) -> io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(not_connected());
        };
        while !self.write_buf.is_empty() {
            match transport.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.write_buf.advance(written),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        transport.flush()
    }

    /// Reads until `decode` reports a complete message and consumes it.
    ///
    /// A decode error resets the connection: the stream can no longer be
    /// framed.
    pub fn read_response<T, F>(&mut self, mut decode: F) -> ClientResult<T>
    where
        F: FnMut(&[u8]) -> Result<Decoded<T>, CodecError>,
    {
        loop {
            if !self.read_buf.is_empty() {
                match decode(&self.read_buf) {
                    Ok(Decoded::Complete { value, consumed }) => {
                        self.read_buf.advance(consumed);
                        if self.probation {
                            info!(server = %self.label, "server back in rotation");
                            self.probation = false;
                            self.failures = 0;
                            self.window_start = None;
                        }
                        return Ok(value);
                    }
                    Ok(Decoded::NeedMoreData) => {}
                    Err(err) => return Err(self.reset_stream(err)),
                }
            }
            self.fill()?;
        }
    }

    /// Drops a stream that can no longer be framed and counts the failure.
    pub fn reset_stream(&mut self, err: CodecError) -> ClientError {
        warn!(server = %self.label, error = %err, "framing error, resetting connection");
        self.record_failure(err.to_string());
        ClientError::Protocol(err)
    }

    fn fill(&mut self) -> ClientResult<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let result = match self.transport.as_mut() {
            Some(transport) => loop {
                match transport.read(&mut chunk) {
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            },
            None => Err(not_connected()),
        };
        match result {
            Ok(0) => Err(self.fail(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
            Ok(read) => {
                self.read_buf.extend_from_slice(&chunk[..read]);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Flushes buffered commands and drains the replies they owe.
    ///
    /// The first semantic failure among the drained replies is kept until
    /// [`Connection::take_buffered_failure`] reports it.
    pub fn purge<F>(&mut self, mut decode: F) -> ClientResult<()>
    where
        F: FnMut(&[u8]) -> Result<Decoded<Response>, CodecError>,
    {
        if self.write_buf.is_empty() && self.stack_responses == 0 {
            return Ok(());
        }
        self.flush()?;
        while self.stack_responses > 0 {
            let response = self.read_response(&mut decode)?;
            self.stack_responses -= 1;
            if let Response::Error(status) = response {
                warn!(server = %self.label, %status, "buffered command failed");
                self.buffered_failure.get_or_insert(status);
            }
        }
        Ok(())
    }

    /// Returns and clears the first failure among drained buffered replies.
    pub fn take_buffered_failure(&mut self) -> Option<ServerStatus> {
        self.buffered_failure.take()
    }

    /// Gracefully closes the connection: flushes pending writes, sends
    /// `quit_frame` without reading its reply, and resets every buffer.
    ///
    /// Returns false when there was no open socket (a no-op).
    pub fn quit(&mut self, quit_frame: &Frame<'_>) -> bool {
        if self.transport.is_none() {
            return false;
        }

        if !self.write_buf.is_empty() {
            if let Err(err) = self.drain_write_buffer() {
                debug!(server = %self.label, error = %err, "flush before quit failed");
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(err) = write_vectored_all(transport.as_mut(), quit_frame) {
                debug!(server = %self.label, error = %err, "quit command not delivered");
            }
        }

        self.reset();
        self.probation = false;
        self.state = ConnectionState::Disconnected;
        info!(server = %self.label, "quit");
        true
    }

    /// Drops the socket and zeroes buffers, cursors and owed replies.
    fn reset(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close();
        }
        self.write_buf.clear();
        self.read_buf.clear();
        self.stack_responses = 0;
        self.cursor_active = false;
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Resets the connection, counts the failure and classifies `err`.
    fn fail(&mut self, err: io::Error) -> ClientError {
        self.record_failure(err.to_string());
        ClientError::io(&self.label, err)
    }

    fn record_failure(&mut self, reason: String) {
        let probing = self.probation || matches!(self.state, ConnectionState::Failed { .. });
        self.probation = false;
        self.reset();

        let now = Instant::now();
        match self.window_start {
            Some(start) if now.duration_since(start) <= self.policy.window => {}
            _ => {
                self.window_start = Some(now);
                self.failures = 0;
            }
        }
        self.failures += 1;

        let limit_reached = self.policy.limit > 0 && self.failures >= self.policy.limit;
        if probing || limit_reached {
            warn!(
                server = %self.label,
                failures = self.failures,
                retry_in_ms = self.policy.retry_timeout.as_millis() as u64,
                "server marked dead"
            );
            self.state = ConnectionState::Failed {
                reason,
                until: now + self.policy.retry_timeout,
            };
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is not open")
}

/// Writes every segment of `frame`, resuming after partial vectored writes.
fn write_vectored_all(transport: &mut dyn Transport, frame: &Frame<'_>) -> io::Result<()> {
    let segments: Vec<&[u8]> = frame.segments().collect();
    let mut index = 0;
    let mut offset = 0;

    while index < segments.len() {
        let slices: Vec<IoSlice<'_>> = std::iter::once(&segments[index][offset..])
            .chain(segments[index + 1..].iter().copied())
            .map(IoSlice::new)
            .collect();

        let mut written = match transport.write_vectored(&slices) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => written,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        while written > 0 && index < segments.len() {
            let available = segments[index].len() - offset;
            if written >= available {
                written -= available;
                index += 1;
                offset = 0;
            } else {
                offset += written;
                written = 0;
            }
        }
    }

    transport.flush()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::text;
    use memlink_common::{Command, Verb};

    /// In-memory transport replaying scripted reads and recording writes.
    pub(crate) struct ScriptedTransport {
        pub reads: VecDeque<io::Result<Vec<u8>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub closes: Arc<AtomicUsize>,
        /// Largest write accepted per call, to exercise partial writes.
        pub max_write: usize,
    }

    impl ScriptedTransport {
        pub fn new<I, B>(reads: I) -> Self
        where
            I: IntoIterator<Item = B>,
            B: AsRef<[u8]>,
        {
            ScriptedTransport {
                reads: reads.into_iter().map(|chunk| Ok(chunk.as_ref().to_vec())).collect(),
                written: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
                max_write: usize::MAX,
            }
        }

        /// A transport that never sends anything.
        pub fn silent() -> Self {
            Self::new(Vec::<&[u8]>::new())
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(chunk)) => {
                    let len = chunk.len().min(buf.len());
                    buf[..len].copy_from_slice(&chunk[..len]);
                    if len < chunk.len() {
                        self.reads.push_front(Ok(chunk[len..].to_vec()));
                    }
                    Ok(len)
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let len = buf.len().min(self.max_write);
            self.written.lock().unwrap().extend_from_slice(&buf[..len]);
            Ok(len)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out scripted transports in order; refuses once exhausted.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        pub transports: Mutex<VecDeque<ScriptedTransport>>,
        pub attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        pub fn with(transports: Vec<ScriptedTransport>) -> Self {
            ScriptedConnector {
                transports: Mutex::new(transports.into()),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _host: &str, _port: u16, _timeouts: &Timeouts) -> io::Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.transports.lock().unwrap().pop_front() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(io::ErrorKind::ConnectionRefused.into()),
            }
        }
    }

    fn connection(policy: FailurePolicy) -> Connection {
        Connection::new("cache", 11211, Timeouts::default(), policy)
    }

    fn frame_for<'a>(command: &Command<'a>) -> Frame<'a> {
        text::encode(command, b"").unwrap()
    }

    #[test]
    fn connects_lazily() {
        let connector = ScriptedConnector::with(vec![ScriptedTransport::silent()]);
        let mut conn = connection(FailurePolicy::default());
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        conn.connect(&connector).unwrap();
        conn.connect(&connector).unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), &ConnectionState::Connected);
    }

    #[test]
    fn send_survives_partial_writes() {
        let mut transport = ScriptedTransport::silent();
        transport.max_write = 3;
        let written = transport.written.clone();
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());

        let cmd = Command::store(Verb::Set, b"key", b"value", 0, 0);
        conn.send(&connector, &frame_for(&cmd)).unwrap();
        assert_eq!(&*written.lock().unwrap(), b"set key 0 0 5\r\nvalue\r\n");
    }

    #[test]
    fn buffered_commands_wait_for_flush() {
        let transport = ScriptedTransport::new(["STORED\r\nSTORED\r\n"]);
        let written = transport.written.clone();
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());

        let first = Command::store(Verb::Set, b"a", b"1", 0, 0);
        let second = Command::store(Verb::Set, b"b", b"2", 0, 0);
        conn.enqueue(&connector, &frame_for(&first), true).unwrap();
        conn.enqueue(&connector, &frame_for(&second), true).unwrap();
        assert!(written.lock().unwrap().is_empty());
        assert_eq!(conn.pending_responses(), 2);

        conn.purge(text::decode_response).unwrap();
        assert_eq!(conn.pending_responses(), 0);
        assert_eq!(&*written.lock().unwrap(), b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\n");
    }

    #[test]
    fn buffer_overflow_flushes_first() {
        let transport = ScriptedTransport::silent();
        let written = transport.written.clone();
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());

        let value = vec![b'v'; WRITE_BUFFER_SIZE - 100];
        let cmd = Command::store(Verb::Set, b"k", &value, 0, 0).with_no_reply(true);
        conn.enqueue(&connector, &frame_for(&cmd), false).unwrap();
        assert!(written.lock().unwrap().is_empty());
        conn.enqueue(&connector, &frame_for(&cmd), false).unwrap();
        assert!(!written.lock().unwrap().is_empty());
        assert!(conn.snapshot().write_buffered > 0);

        let huge = vec![b'h'; WRITE_BUFFER_SIZE * 2];
        let cmd = Command::store(Verb::Set, b"k", &huge, 0, 0).with_no_reply(true);
        conn.enqueue(&connector, &frame_for(&cmd), false).unwrap();
        assert_eq!(conn.snapshot().write_buffered, 0);
    }

    #[test]
    fn replies_may_arrive_in_pieces() {
        let transport = ScriptedTransport::new(["VALUE k 0 5\r\nhel", "lo\r\nEN", "D\r\n"]);
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());
        conn.send(&connector, &frame_for(&Command::new(Verb::Get, b"k"))).unwrap();

        let value = conn.read_response(text::decode_response).unwrap();
        assert!(matches!(value, Response::Value(item) if item.value == b"hello"));
        assert_eq!(conn.read_response(text::decode_response).unwrap(), Response::End);
        assert_eq!(conn.snapshot().read_buffered, 0);
    }

    #[test]
    fn quit_resets_everything_and_is_idempotent() {
        let transport = ScriptedTransport::silent();
        let written = transport.written.clone();
        let closes = transport.closes.clone();
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());

        let cmd = Command::store(Verb::Set, b"a", b"1", 0, 0);
        conn.enqueue(&connector, &frame_for(&cmd), true).unwrap();
        conn.set_cursor_active(true);

        let quit = frame_for(&Command::keyless(Verb::Quit));
        assert!(conn.quit(&quit));
        let after_first = conn.snapshot();
        assert!(!conn.quit(&quit));
        assert_eq!(conn.snapshot(), after_first);

        assert_eq!(&*written.lock().unwrap(), b"set a 0 0 1\r\n1\r\nquit\r\n");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            after_first,
            ConnectionSnapshot {
                state: ConnectionState::Disconnected,
                has_transport: false,
                write_buffered: 0,
                read_buffered: 0,
                pending_responses: 0,
                cursor_active: false,
                failures: 0,
            }
        );
    }

    #[test]
    fn eof_is_a_transport_failure() {
        let connector = ScriptedConnector::with(vec![ScriptedTransport::silent()]);
        let mut conn = connection(FailurePolicy::default());
        conn.send(&connector, &frame_for(&Command::keyless(Verb::Version))).unwrap();

        let err = conn.read_response(text::decode_response).unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(!snapshot.has_transport);
        assert_eq!(snapshot.failures, 1);
    }

    #[test]
    fn read_timeout_is_reported_as_timeout() {
        let mut transport = ScriptedTransport::silent();
        transport.reads.push_back(Err(io::ErrorKind::WouldBlock.into()));
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());
        conn.send(&connector, &frame_for(&Command::keyless(Verb::Version))).unwrap();

        let err = conn.read_response(text::decode_response).unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
        assert!(!conn.is_connected());
    }

    #[test]
    fn framing_error_resets_connection() {
        let connector = ScriptedConnector::with(vec![ScriptedTransport::new(["GARBAGE\r\n"])]);
        let mut conn = connection(FailurePolicy::default());
        conn.send(&connector, &frame_for(&Command::keyless(Verb::Version))).unwrap();

        let err = conn.read_response(text::decode_response).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(!conn.is_connected());
        assert_eq!(conn.snapshot().read_buffered, 0);
    }

    #[test]
    fn repeated_failures_mark_server_dead_then_probe() {
        let policy = FailurePolicy {
            limit: 2,
            window: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(60),
        };
        let connector = ScriptedConnector::default();
        let mut conn = connection(policy);

        assert!(conn.connect(&connector).is_err());
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
        assert!(conn.connect(&connector).is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));
        assert!(!conn.is_available(Instant::now()));

        // Still dead: no connect attempt is made.
        assert!(conn.connect(&connector).is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        // Half-open once the deadline passes.
        let ConnectionState::Failed { until, .. } = conn.state().clone() else {
            unreachable!()
        };
        assert!(conn.is_available(until));
    }

    #[test]
    fn successful_probe_clears_failures() {
        let policy = FailurePolicy {
            limit: 1,
            window: Duration::from_secs(60),
            retry_timeout: Duration::ZERO,
        };
        let connector = ScriptedConnector::default();
        let mut conn = connection(policy);
        assert!(conn.connect(&connector).is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));

        // A failed probe re-arms the deadline.
        assert!(conn.connect(&connector).is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));

        connector.transports.lock().unwrap().push_back(ScriptedTransport::new(["VERSION 1.6.0\r\n"]));
        conn.send(&connector, &frame_for(&Command::keyless(Verb::Version))).unwrap();
        assert_eq!(conn.state(), &ConnectionState::Connected);
        assert_eq!(conn.snapshot().failures, 2);

        let reply = conn.read_response(text::decode_response).unwrap();
        assert_eq!(reply, Response::Version("1.6.0".to_string()));
        assert_eq!(conn.snapshot().failures, 0);
    }

    #[test]
    fn failed_probe_keeps_server_dead() {
        let policy = FailurePolicy {
            limit: 2,
            window: Duration::from_secs(60),
            retry_timeout: Duration::ZERO,
        };
        let connector = ScriptedConnector::default();
        let mut conn = connection(policy);
        assert!(conn.connect(&connector).is_err());
        assert!(conn.connect(&connector).is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));

        // The probe connects but the server closes before answering.
        connector.transports.lock().unwrap().push_back(ScriptedTransport::silent());
        conn.send(&connector, &frame_for(&Command::keyless(Verb::Version))).unwrap();
        assert!(conn.read_response(text::decode_response).is_err());
        assert!(matches!(conn.state(), ConnectionState::Failed { .. }));
        assert!(!conn.is_connected());
    }

    #[test]
    fn buffered_failures_are_kept_for_the_caller() {
        let transport = ScriptedTransport::new(["NOT_STORED\r\nSTORED\r\nEXISTS\r\n"]);
        let connector = ScriptedConnector::with(vec![transport]);
        let mut conn = connection(FailurePolicy::default());

        for key in [&b"a"[..], b"b", b"c"] {
            let cmd = Command::store(Verb::Add, key, b"1", 0, 0);
            conn.enqueue(&connector, &frame_for(&cmd), true).unwrap();
        }
        conn.purge(text::decode_response).unwrap();
        assert_eq!(conn.pending_responses(), 0);
        assert_eq!(conn.take_buffered_failure(), Some(ServerStatus::NotStored));
        assert_eq!(conn.take_buffered_failure(), None);
    }
}
