//! Protocol engine: handshake, message send and the receive state machine.
//!
//! A protocol object sits directly inside a connection. On the server side
//! the protocol listener creates one for every accepted connection; on the
//! client side [`connect`] builds the connection, the protocol above it and
//! layers the caller's object inside the protocol:
//!
//! ```text
//! client:  caller <- protocol <- connection
//! server:  caller <- protocol-listener <- listener      (accepts)
//!                     protocol <- connection            (per connection)
//! ```
//!
//! Parsing advances only on [`Signal::Ready`] from the connection. Each step
//! asks the decoder what it needs, consumes exactly that from the
//! connection, and either continues with bytes already buffered or arms the
//! next requirement and returns.

use crate::codec::{encode_message, Decoded, MessageDecoder, ProtocolState, INTRO_SIZE};
use crate::connection::Connection;
use crate::handle::HandleTable;
use crate::listener::Listener;
use crate::message::{Message, MessageHeader};
use crate::object::{Object, ObjectBehavior, Signal};
use crate::value::TypedData;
use omapi_types::{OmapiConfig, OmapiError, OmapiResult, Opcode, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Receives every complete inbound message.
///
/// Called on the connection's reader task; implementations must not block.
pub trait MessageHandler: Send + Sync + 'static {
    fn process(&self, message: &Object, protocol: &Object) -> OmapiResult<()>;
}

/// Everything a protocol object needs from its environment.
#[derive(Clone)]
pub struct ProtocolContext {
    pub config: OmapiConfig,
    pub handles: HandleTable,
    pub handler: Arc<dyn MessageHandler>,
}

impl ProtocolContext {
    pub fn new(config: OmapiConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config,
            handles: HandleTable::new(),
            handler,
        }
    }
}

/// Per-connection protocol state.
pub struct Protocol {
    ctx: ProtocolContext,
    header_size: AtomicU32,
    protocol_version: AtomicU32,
    next_xid: AtomicU32,
    authinfo: Mutex<Option<Object>>,
    decoder: Mutex<MessageDecoder>,
}

impl Protocol {
    pub fn create(ctx: ProtocolContext) -> Object {
        let decoder = MessageDecoder::new(&ctx.config);
        Object::create(Protocol {
            header_size: AtomicU32::new(MessageHeader::SIZE as u32),
            protocol_version: AtomicU32::new(0),
            next_xid: AtomicU32::new(1),
            authinfo: Mutex::new(None),
            decoder: Mutex::new(decoder),
            ctx,
        })
    }

    fn decoder(&self) -> MutexGuard<'_, MessageDecoder> {
        self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ProtocolState {
        self.decoder().state()
    }

    /// Version the peer announced; 0 until the handshake completes.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    /// Header size the peer announced.
    pub fn header_size(&self) -> u32 {
        self.header_size.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &ProtocolContext {
        &self.ctx
    }

    /// Default authenticator supplied at connect time. Carried, never used
    /// to sign.
    pub fn authinfo(&self) -> Option<Object> {
        self.authinfo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_authinfo(&self, authinfo: Option<Object>) {
        let previous = std::mem::replace(
            &mut *self.authinfo.lock().unwrap_or_else(|e| e.into_inner()),
            authinfo,
        );
        drop(previous);
    }

    fn next_xid(&self) -> u32 {
        loop {
            let id = self.next_xid.fetch_add(1, Ordering::AcqRel);
            if id != 0 {
                return id;
            }
        }
    }

    /// Consume buffered input until the decoder needs more than is there.
    fn drive(&self, this: &Object, conn: &Connection) -> OmapiResult<()> {
        loop {
            let step = {
                let mut decoder = self.decoder();
                let need = decoder.need();
                if !conn.require(need) {
                    return Ok(());
                }
                let bytes = conn.copy_out(need)?;
                decoder.feed(&bytes)?
            };

            match step {
                Decoded::Pending => continue,
                Decoded::Intro {
                    version,
                    header_size,
                } => {
                    self.protocol_version.store(version, Ordering::Release);
                    self.header_size.store(header_size, Ordering::Release);
                    info!(
                        peer = %conn.peer_addr(),
                        version, header_size, "OMAPI: handshake complete"
                    );
                }
                Decoded::Message(message) => {
                    if let Err(e) = self.ctx.handler.process(&message, this) {
                        warn!(peer = %conn.peer_addr(), "OMAPI: message handler failed: {}", e);
                    }
                }
            }

            // A client stops reading once nothing else is expected; the next
            // send re-arms the header requirement.
            if conn.is_client() && !conn.settle_reply() {
                return Ok(());
            }
        }
    }
}

impl ObjectBehavior for Protocol {
    fn type_name(&self) -> &'static str {
        "protocol"
    }

    fn signal(&self, this: &Object, signal: &Signal<'_>) -> OmapiResult<()> {
        match signal {
            Signal::Ready => {
                let conn_object = this.outer().ok_or(OmapiError::NotConnected)?;
                let conn = conn_object
                    .downcast_ref::<Connection>()
                    .ok_or(OmapiError::NotConnected)?;
                if let Err(e) = self.drive(this, conn) {
                    warn!(peer = %conn.peer_addr(), "OMAPI: protocol error, closing: {}", e);
                    self.decoder().abandon();
                    conn.disconnect(true);
                }
                Ok(())
            }
            Signal::Disconnect => {
                self.decoder().abandon();
                match this.pass_signal(signal) {
                    Err(OmapiError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            other => this.pass_signal(other),
        }
    }

    fn destroy(&self) {
        self.decoder().abandon();
        self.set_authinfo(None);
    }
}

/// The connection directly outside a protocol object.
fn outer_connection(protocol: &Object) -> OmapiResult<(&Protocol, Object)> {
    let this = protocol
        .downcast_ref::<Protocol>()
        .ok_or_else(|| OmapiError::InvalidArgument(format!("{} is not a protocol", protocol.type_name())))?;
    let conn = protocol.outer().ok_or(OmapiError::NotConnected)?;
    as_connection(&conn)?;
    Ok((this, conn))
}

fn as_connection(object: &Object) -> OmapiResult<&Connection> {
    object
        .downcast_ref::<Connection>()
        .ok_or(OmapiError::NotConnected)
}

/// Walk outward from `object` (inclusive) to the first connection.
pub fn find_connection(object: &Object) -> Option<Object> {
    let mut current = Some(object.clone());
    while let Some(candidate) = current {
        if candidate.downcast_ref::<Connection>().is_some() {
            return Some(candidate);
        }
        current = candidate.outer();
    }
    None
}

/// Send the handshake and start waiting for the peer's.
pub fn send_intro(protocol: &Object) -> OmapiResult<()> {
    let (this, conn_object) = outer_connection(protocol)?;
    let conn = as_connection(&conn_object)?;
    let config = &this.ctx.config;

    conn.put_u32(config.protocol_version)?;
    conn.put_u32(config.header_size)?;
    this.decoder().reset();
    this.next_xid
        .store(rand::random::<u32>(), Ordering::Release);
    conn.arm(INTRO_SIZE);
    conn.flush()?;
    debug!(peer = %conn.peer_addr(), "OMAPI: sent handshake");
    Ok(())
}

/// Send `message`.
///
/// The target handle is `target` if given, else the message's own `handle`
/// when nonzero, else the handle of the attached object, else 0. The response-to id is the id of `reply_to` if given, else
/// the message's own `rid`. The message is stamped with a fresh transaction
/// id. Any failure forces the connection closed.
pub fn send_message(
    protocol: &Object,
    message: &Object,
    target: Option<u32>,
    reply_to: Option<&Object>,
) -> OmapiResult<()> {
    let (this, conn_object) = outer_connection(protocol)?;
    let conn = as_connection(&conn_object)?;
    let body = message.downcast_ref::<Message>().ok_or_else(|| {
        OmapiError::InvalidArgument(format!("cannot send a {} object", message.type_name()))
    })?;

    let handle = target
        .or_else(|| Some(body.handle()).filter(|&handle| handle != 0))
        .unwrap_or_else(|| body.object().map_or(0, |object| object.handle()));
    let rid = match reply_to {
        Some(request) => request.downcast_ref::<Message>().map_or(0, Message::id),
        None => body.rid(),
    };
    let id = this.next_xid();
    body.set_id(id);
    let header = MessageHeader {
        authid: 0,
        authlen: 0,
        op: body.op(),
        handle,
        id,
        rid,
    };

    let queued = encode_message(message, &header, this.ctx.config.header_size, Some(&this.ctx.handles))
        .and_then(|bytes| conn.put_bytes(&bytes));
    if let Err(e) = queued {
        warn!(peer = %conn.peer_addr(), "OMAPI: cannot send message: {}", e);
        conn.disconnect(true);
        return Err(e);
    }

    if conn.is_client() && conn.expect_reply() {
        let need = this.decoder().need();
        conn.arm(need);
    }
    debug!(
        peer = %conn.peer_addr(),
        op = header.op, id, rid, handle, "OMAPI: sending message"
    );
    conn.flush()
}

/// Send a STATUS message answering transaction `rid`.
pub fn send_status(
    protocol: &Object,
    status: StatusCode,
    rid: u32,
    text: Option<&str>,
) -> OmapiResult<()> {
    let message = Message::with_op(Opcode::Status);
    message.set_value("rid", TypedData::Int(rid))?;
    message.set_value("result", TypedData::Int(status.as_u32()))?;
    if let Some(text) = text {
        message.set_value("message", TypedData::from(text))?;
    }
    send_message(protocol, &message, None, None)
}

/// Send an UPDATE message carrying `object`. When answering a request
/// (`rid != 0`) the object is published and its handle included.
pub fn send_update(protocol: &Object, rid: u32, object: &Object) -> OmapiResult<()> {
    let (this, _) = outer_connection(protocol)?;
    let message = Message::with_op(Opcode::Update);
    if rid != 0 {
        message.set_value("rid", TypedData::Int(rid))?;
        let handle = this.ctx.handles.publish(object);
        message.set_value("handle", TypedData::Int(handle))?;
    }
    message.set_value("object", TypedData::Object(object.clone()))?;
    send_message(protocol, &message, None, None)
}

/// Connect to `host:port` and layer `caller` inside the new protocol.
///
/// Returns the protocol object once the handshake is sent; call [`wait`] to
/// block until the peer's handshake arrives.
pub async fn connect(
    caller: &Object,
    host: &str,
    port: u16,
    ctx: &ProtocolContext,
    authinfo: Option<Object>,
) -> OmapiResult<Object> {
    info!("OMAPI: connecting to {}:{}", host, port);
    let stream = TcpStream::connect((host, port)).await?;
    let connection = Connection::from_stream(stream, true, &ctx.config)?;
    let protocol = Protocol::create(ctx.clone());
    if let Some(this) = protocol.downcast_ref::<Protocol>() {
        this.set_authinfo(authinfo);
    }

    Object::link(&connection, &protocol)?;
    Object::link(&protocol, caller)?;
    send_intro(&protocol)?;
    Connection::start(&connection)?;
    Ok(protocol)
}

/// Close the connection outside `caller`.
pub fn disconnect(caller: &Object, force: bool) -> OmapiResult<()> {
    let conn = find_connection(caller).ok_or(OmapiError::NotConnected)?;
    as_connection(&conn)?.disconnect(force);
    Ok(())
}

/// Block until every reply expected on the connection outside `caller` has
/// arrived. Must not be called from an async task.
pub fn wait(caller: &Object) -> OmapiResult<()> {
    let conn = find_connection(caller).ok_or(OmapiError::NotConnected)?;
    as_connection(&conn)?.wait()
}

/// [`wait`] bounded by `timeout`; `Ok(false)` on timeout.
pub fn wait_timeout(caller: &Object, timeout: Duration) -> OmapiResult<bool> {
    let conn = find_connection(caller).ok_or(OmapiError::NotConnected)?;
    as_connection(&conn)?.wait_timeout(timeout)
}

/// Pass-through layer that puts a protocol on every accepted connection.
pub struct ProtocolListener {
    ctx: ProtocolContext,
}

impl ObjectBehavior for ProtocolListener {
    fn type_name(&self) -> &'static str {
        "protocol-listener"
    }

    fn signal(&self, this: &Object, signal: &Signal<'_>) -> OmapiResult<()> {
        let Signal::Connect(connection) = signal else {
            return this.pass_signal(signal);
        };
        let protocol = Protocol::create(self.ctx.clone());
        Object::link(connection, &protocol)?;
        if let Err(e) = send_intro(&protocol) {
            connection.unlink_inner();
            return Err(e);
        }
        Ok(())
    }
}

/// Listen on `port`, creating a protocol for every accepted connection.
/// Returns the listener object.
pub async fn protocol_listen(
    caller: &Object,
    port: u16,
    backlog: u32,
    ctx: &ProtocolContext,
) -> OmapiResult<Object> {
    let layer = Object::create(ProtocolListener { ctx: ctx.clone() });
    Object::link(&layer, caller)?;
    match Listener::listen(&layer, port, backlog, &ctx.config).await {
        Ok(listener) => Ok(listener),
        Err(e) => {
            layer.unlink_inner();
            Err(e)
        }
    }
}
