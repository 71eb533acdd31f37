//! Connection object: buffered, requirement-driven I/O over a TCP stream.
//!
//! A connection sits at the outer end of a protocol stack. Its reader task
//! buffers incoming bytes and, once the armed byte requirement is met,
//! delivers [`Signal::Ready`] to the inner object (the protocol), which then
//! consumes exactly what it asked for. Outgoing bytes accumulate in an output
//! buffer until [`Connection::flush`] hands them to the writer task.

use crate::object::{Object, ObjectBehavior, Signal, WeakObject};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use omapi_types::{OmapiConfig, OmapiError, OmapiResult};
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Output is draining; no new output is accepted.
    Disconnecting,
    Closed,
}

#[derive(Default)]
struct Input {
    buf: BytesMut,
    /// Armed requirement; 0 when nothing is armed.
    needed: usize,
}

struct Pending {
    stream: TcpStream,
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

struct Replies {
    expected: u32,
    closed: bool,
}

/// Counts replies a client still waits for and wakes blocked waiters.
///
/// Each transition happens under one lock acquisition; the caller acts on the
/// returned decision (arming the next read) only after the lock is released.
pub struct ReplyCounter {
    state: Mutex<Replies>,
    changed: Condvar,
}

impl ReplyCounter {
    pub fn new(expected: u32) -> Self {
        Self {
            state: Mutex::new(Replies {
                expected,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Replies> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one more outstanding reply. True when it is the only one, in
    /// which case the caller must arm the header requirement.
    pub fn expect(&self) -> bool {
        let mut replies = self.lock();
        replies.expected += 1;
        replies.expected == 1
    }

    /// Record one reply as received and wake waiters. True while more
    /// replies are outstanding, in which case reading must continue.
    pub fn settle(&self) -> bool {
        let mut replies = self.lock();
        replies.expected = replies.expected.saturating_sub(1);
        self.changed.notify_all();
        replies.expected > 0
    }

    pub fn outstanding(&self) -> u32 {
        self.lock().expected
    }

    /// Mark closed and wake every waiter. Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut replies = self.lock();
        if replies.closed {
            return false;
        }
        replies.closed = true;
        self.changed.notify_all();
        true
    }

    /// Block until no reply is outstanding.
    pub fn wait(&self) -> OmapiResult<()> {
        let mut replies = self.lock();
        while replies.expected > 0 && !replies.closed {
            replies = self
                .changed
                .wait(replies)
                .unwrap_or_else(|e| e.into_inner());
        }
        Self::outcome(&replies)
    }

    /// [`wait`](Self::wait) bounded by `timeout`; `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> OmapiResult<bool> {
        let replies = self.lock();
        let (replies, result) = self
            .changed
            .wait_timeout_while(replies, timeout, |r| r.expected > 0 && !r.closed)
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && replies.expected > 0 && !replies.closed {
            return Ok(false);
        }
        Self::outcome(&replies).map(|()| true)
    }

    fn outcome(replies: &Replies) -> OmapiResult<()> {
        if replies.expected > 0 {
            return Err(OmapiError::ConnectionClosed);
        }
        Ok(())
    }
}

/// A connected TCP peer.
pub struct Connection {
    peer_addr: SocketAddr,
    is_client: bool,
    buffer_size: usize,
    state: Mutex<ConnectionState>,
    input: Mutex<Input>,
    output: Mutex<BytesMut>,
    sender: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Mutex<Option<Pending>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
    shutdown: Notify,
    replies: ReplyCounter,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    /// Wrap an established stream. I/O begins with [`Connection::start`].
    ///
    /// A client connection starts out expecting one reply: the peer's
    /// handshake.
    pub fn from_stream(stream: TcpStream, is_client: bool, config: &OmapiConfig) -> OmapiResult<Object> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Connection {
            peer_addr,
            is_client,
            buffer_size: config.buffer_size,
            state: Mutex::new(ConnectionState::Connected),
            input: Mutex::new(Input {
                buf: BytesMut::with_capacity(config.buffer_size),
                needed: 0,
            }),
            output: Mutex::new(BytesMut::with_capacity(config.buffer_size)),
            sender: Mutex::new(Some(sender)),
            pending: Mutex::new(Some(Pending { stream, receiver })),
            writer: Mutex::new(None),
            wake: Notify::new(),
            shutdown: Notify::new(),
            replies: ReplyCounter::new(u32::from(is_client)),
        };
        Ok(Object::create(connection))
    }

    /// Spawn the reader and writer tasks. The reader holds a reference to
    /// the connection until the socket closes.
    pub fn start(object: &Object) -> OmapiResult<()> {
        let this = object
            .downcast_ref::<Connection>()
            .ok_or(OmapiError::NotConnected)?;
        let Pending { stream, receiver } = locked(&this.pending)
            .take()
            .ok_or_else(|| OmapiError::InvalidArgument("connection already started".into()))?;
        let (reader, writer) = stream.into_split();

        let writer_task = tokio::spawn(write_loop(writer, receiver, object.downgrade()));
        *locked(&this.writer) = Some(writer_task);
        tokio::spawn(read_loop(object.clone(), reader));
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn state(&self) -> ConnectionState {
        *locked(&self.state)
    }

    fn ensure_open(&self) -> OmapiResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(OmapiError::ConnectionClosed),
        }
    }

    /// True when `n` bytes are already buffered. Otherwise arms the
    /// requirement and returns false; `Ready` follows once the bytes arrive.
    pub fn require(&self, n: usize) -> bool {
        let mut input = locked(&self.input);
        if input.buf.len() >= n {
            input.needed = 0;
            return true;
        }
        input.needed = n;
        false
    }

    /// Arm a requirement from outside the reader task. If the bytes are
    /// already buffered the reader is woken to deliver `Ready`.
    pub fn arm(&self, n: usize) {
        let satisfied = {
            let mut input = locked(&self.input);
            input.needed = n;
            input.buf.len() >= n
        };
        if satisfied {
            self.wake.notify_one();
        }
    }

    fn take_ready(&self) -> bool {
        let mut input = locked(&self.input);
        if input.needed > 0 && input.buf.len() >= input.needed {
            input.needed = 0;
            return true;
        }
        false
    }

    pub fn buffered(&self) -> usize {
        locked(&self.input).buf.len()
    }

    /// Consume `n` buffered bytes.
    pub fn copy_out(&self, n: usize) -> OmapiResult<Bytes> {
        let mut input = locked(&self.input);
        if input.buf.len() < n {
            return Err(OmapiError::Protocol(format!(
                "wanted {n} bytes, {} buffered",
                input.buf.len()
            )));
        }
        Ok(input.buf.split_to(n).freeze())
    }

    pub fn get_u16(&self) -> OmapiResult<u16> {
        Ok(self.copy_out(2)?.get_u16())
    }

    pub fn get_u32(&self) -> OmapiResult<u32> {
        Ok(self.copy_out(4)?.get_u32())
    }

    fn output(&self) -> OmapiResult<MutexGuard<'_, BytesMut>> {
        self.ensure_open()?;
        Ok(locked(&self.output))
    }

    pub fn put_u16(&self, value: u16) -> OmapiResult<()> {
        self.output()?.put_u16(value);
        Ok(())
    }

    pub fn put_u32(&self, value: u32) -> OmapiResult<()> {
        self.output()?.put_u32(value);
        Ok(())
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> OmapiResult<()> {
        self.output()?.put_slice(bytes);
        Ok(())
    }

    /// Queue everything written so far for the writer task.
    pub fn flush(&self) -> OmapiResult<()> {
        let chunk = self.output()?.split().freeze();
        if chunk.is_empty() {
            return Ok(());
        }
        let sender = locked(&self.sender);
        match sender.as_ref() {
            Some(sender) => sender
                .send(chunk)
                .map_err(|_| OmapiError::ConnectionClosed),
            None => Err(OmapiError::ConnectionClosed),
        }
    }

    /// Close the connection. A forced close drops queued output and stops
    /// the reader at once; otherwise queued output drains first and the
    /// reader runs until the peer closes its side.
    pub fn disconnect(&self, force: bool) {
        {
            let mut state = locked(&self.state);
            if *state == ConnectionState::Closed {
                return;
            }
            if !force && *state == ConnectionState::Disconnecting {
                return;
            }
            *state = if force {
                ConnectionState::Closed
            } else {
                ConnectionState::Disconnecting
            };
        }
        debug!(peer = %self.peer_addr, force, "OMAPI: disconnecting");
        locked(&self.sender).take();
        if force {
            if let Some(writer) = locked(&self.writer).take() {
                writer.abort();
            }
            self.shutdown.notify_one();
            self.replies.close();
        }
    }

    fn mark_closed(&self) {
        *locked(&self.state) = ConnectionState::Closed;
        locked(&self.sender).take();
        self.replies.close();
    }

    /// Client side: note that a reply is expected. See [`ReplyCounter::expect`].
    pub fn expect_reply(&self) -> bool {
        self.replies.expect()
    }

    /// Client side: note that a reply arrived. See [`ReplyCounter::settle`].
    pub fn settle_reply(&self) -> bool {
        self.replies.settle()
    }

    pub fn replies_outstanding(&self) -> u32 {
        self.replies.outstanding()
    }

    /// Block the calling thread until every expected reply has arrived.
    /// Must not be called from an async task.
    pub fn wait(&self) -> OmapiResult<()> {
        self.replies.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> OmapiResult<bool> {
        self.replies.wait_timeout(timeout)
    }
}

impl ObjectBehavior for Connection {
    fn type_name(&self) -> &'static str {
        "connection"
    }

    fn destroy(&self) {
        debug!(peer = %self.peer_addr, "OMAPI: connection destroyed");
        self.disconnect(true);
        locked(&self.pending).take();
    }
}

/// Deliver a signal to the layer above the connection.
fn deliver(object: &Object, signal: &Signal<'_>) -> OmapiResult<()> {
    match object.inner() {
        Some(inner) => inner.signal(signal),
        None => Ok(()),
    }
}

async fn read_loop(object: Object, mut reader: OwnedReadHalf) {
    let Some(this) = object.downcast_ref::<Connection>() else {
        return;
    };
    let mut chunk = vec![0u8; this.buffer_size.max(1)];

    loop {
        while this.take_ready() {
            if let Err(e) = deliver(&object, &Signal::Ready) {
                warn!(peer = %this.peer_addr, "OMAPI: closing connection: {}", e);
                this.disconnect(true);
            }
        }
        if this.state() == ConnectionState::Closed {
            break;
        }

        tokio::select! {
            _ = this.shutdown.notified() => break,
            _ = this.wake.notified() => continue,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(peer = %this.peer_addr, "OMAPI: peer closed connection");
                    break;
                }
                Ok(n) => locked(&this.input).buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(peer = %this.peer_addr, "OMAPI: read error: {}", e);
                    break;
                }
            },
        }
    }

    this.mark_closed();
    if let Err(e) = deliver(&object, &Signal::Disconnect) {
        debug!(peer = %this.peer_addr, "OMAPI: disconnect not handled: {}", e);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    connection: WeakObject,
) {
    while let Some(chunk) = receiver.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!("OMAPI: write error: {}", e);
            if let Some(object) = connection.upgrade() {
                if let Some(this) = object.downcast_ref::<Connection>() {
                    this.disconnect(true);
                }
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Inner layer that reports what the connection delivers.
    struct Recorder {
        events: mpsc::UnboundedSender<String>,
        take: usize,
    }

    impl ObjectBehavior for Recorder {
        fn type_name(&self) -> &'static str {
            "recorder"
        }

        fn signal(&self, this: &Object, signal: &Signal<'_>) -> OmapiResult<()> {
            let event = match signal {
                Signal::Ready => {
                    let outer = this.outer().ok_or(OmapiError::NotConnected)?;
                    let conn = outer.downcast_ref::<Connection>().ok_or(OmapiError::NotConnected)?;
                    let bytes = conn.copy_out(self.take)?;
                    format!("ready:{}", String::from_utf8_lossy(&bytes))
                }
                other => other.name().to_string(),
            };
            let _ = self.events.send(event);
            Ok(())
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn layered(stream: TcpStream, is_client: bool, take: usize) -> (Object, mpsc::UnboundedReceiver<String>) {
        let conn = Connection::from_stream(stream, is_client, &OmapiConfig::default()).unwrap();
        let (events, rx) = mpsc::unbounded_channel();
        let recorder = Object::create(Recorder { events, take });
        Object::link(&conn, &recorder).unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_ready_after_requirement_met() {
        let (local, mut peer) = socket_pair().await;
        let (conn, mut events) = layered(local, false, 4);
        conn.downcast_ref::<Connection>().unwrap().arm(4);
        Connection::start(&conn).unwrap();

        peer.write_all(b"ab").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        peer.write_all(b"cd").await.unwrap();
        assert_eq!(next_event(&mut events).await, "ready:abcd");
    }

    #[tokio::test]
    async fn test_arm_with_buffered_bytes_wakes_reader() {
        let (local, mut peer) = socket_pair().await;
        let (conn, mut events) = layered(local, false, 2);
        Connection::start(&conn).unwrap();

        peer.write_all(b"xyz").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let this = conn.downcast_ref::<Connection>().unwrap();
        assert_eq!(this.buffered(), 3);

        this.arm(2);
        assert_eq!(next_event(&mut events).await, "ready:xy");
        assert!(this.require(1));
        assert!(!this.require(2));
    }

    #[tokio::test]
    async fn test_flush_reaches_peer() {
        let (local, mut peer) = socket_pair().await;
        let (conn, _events) = layered(local, false, 0);
        Connection::start(&conn).unwrap();

        let this = conn.downcast_ref::<Connection>().unwrap();
        this.put_u32(100).unwrap();
        this.put_u16(7).unwrap();
        this.put_bytes(b"xy").unwrap();
        this.flush().unwrap();

        let mut received = [0u8; 8];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [0, 0, 0, 100, 0, 7, b'x', b'y']);
    }

    #[tokio::test]
    async fn test_get_integers_consume_buffered_bytes() {
        let (local, mut peer) = socket_pair().await;
        let (conn, _events) = layered(local, false, 0);
        Connection::start(&conn).unwrap();

        peer.write_all(&[0, 7, 0, 0, 1, 0, 9]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let this = conn.downcast_ref::<Connection>().unwrap();
        assert_eq!(this.get_u16().unwrap(), 7);
        assert_eq!(this.get_u32().unwrap(), 256);
        assert_eq!(this.buffered(), 1);
        assert!(matches!(this.get_u16(), Err(OmapiError::Protocol(_))));
        assert_eq!(this.buffered(), 1);
    }

    #[tokio::test]
    async fn test_client_starts_expecting_handshake() {
        let (local, _peer) = socket_pair().await;
        let (client, _events) = layered(local, true, 0);
        let this = client.downcast_ref::<Connection>().unwrap();
        assert!(this.is_client());
        assert_eq!(this.replies_outstanding(), 1);
        assert!(!this.expect_reply());
        assert_eq!(this.replies_outstanding(), 2);
        assert!(this.settle_reply());
        assert_eq!(this.replies_outstanding(), 1);

        let (local, _peer) = socket_pair().await;
        let (server, _events) = layered(local, false, 0);
        let this = server.downcast_ref::<Connection>().unwrap();
        assert_eq!(this.replies_outstanding(), 0);
        assert!(this.expect_reply());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_wakes_waiter_and_tears_down() {
        let (local, peer) = socket_pair().await;
        let (conn, mut events) = layered(local, true, 0);
        Connection::start(&conn).unwrap();
        let weak = conn.downgrade();

        let waiter = {
            let conn = conn.clone();
            tokio::task::spawn_blocking(move || {
                conn.downcast_ref::<Connection>().unwrap().wait()
            })
        };
        drop(conn);
        drop(peer);

        assert_eq!(next_event(&mut events).await, "disconnect");
        assert!(matches!(
            waiter.await.unwrap(),
            Err(OmapiError::ConnectionClosed)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(weak.is_destroyed());
    }

    #[tokio::test]
    async fn test_forced_disconnect_rejects_output() {
        let (local, _peer) = socket_pair().await;
        let (conn, mut events) = layered(local, false, 0);
        Connection::start(&conn).unwrap();

        let this = conn.downcast_ref::<Connection>().unwrap();
        this.disconnect(true);
        assert_eq!(this.state(), ConnectionState::Closed);
        assert!(matches!(this.put_u32(1), Err(OmapiError::ConnectionClosed)));
        assert!(matches!(this.flush(), Err(OmapiError::ConnectionClosed)));
        assert_eq!(next_event(&mut events).await, "disconnect");
    }

    #[test]
    fn test_reply_counter_transitions() {
        let counter = ReplyCounter::new(0);
        assert!(counter.expect());
        assert!(!counter.expect());
        assert!(counter.settle());
        assert!(!counter.settle());
        assert_eq!(counter.outstanding(), 0);
        assert!(counter.wait().is_ok());
    }

    #[test]
    fn test_reply_counter_wakes_blocked_waiter() {
        let counter = Arc::new(ReplyCounter::new(1));
        let waiter = {
            let counter = counter.clone();
            std::thread::spawn(move || counter.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!counter.settle());
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_reply_counter_close_fails_waiters_once() {
        let counter = ReplyCounter::new(1);
        assert!(counter.close());
        assert!(!counter.close());
        assert!(matches!(counter.wait(), Err(OmapiError::ConnectionClosed)));
        assert!(matches!(
            counter.wait_timeout(Duration::from_millis(1)),
            Err(OmapiError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_reply_counter_timeout() {
        let counter = ReplyCounter::new(1);
        assert!(!counter.wait_timeout(Duration::from_millis(10)).unwrap());
    }
}
