//! End-to-end tests: a real listener and client over loopback TCP.

use omapi_types::{OmapiConfig, OmapiError, OmapiResult, Opcode, StatusCode};
use omapi_wire::codec::{encode_intro, encode_message};
use omapi_wire::{
    connect, disconnect, protocol_listen, send_message, send_status, wait, Decoded, Listener,
    Message, MessageDecoder, MessageHandler, MessageHeader, Object, Protocol, ProtocolContext,
    ProtocolState, TypedData,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Keeps every message it is handed.
#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<Object>>,
}

impl Recorder {
    fn taken(&self) -> Vec<Object> {
        self.messages.lock().unwrap().clone()
    }
}

impl MessageHandler for Recorder {
    fn process(&self, message: &Object, _protocol: &Object) -> OmapiResult<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Records requests and answers each non-STATUS one with STATUS "ok".
#[derive(Default)]
struct Responder {
    seen: Recorder,
}

impl MessageHandler for Responder {
    fn process(&self, message: &Object, protocol: &Object) -> OmapiResult<()> {
        self.seen.process(message, protocol)?;
        let request = message
            .downcast_ref::<Message>()
            .ok_or_else(|| OmapiError::InvalidArgument("not a message".into()))?;
        if request.op() == Opcode::Status.as_u32() {
            return Ok(());
        }
        send_status(protocol, StatusCode::Success, request.id(), Some("ok"))
    }
}

async fn start_server(handler: Arc<dyn MessageHandler>) -> (Object, Object, SocketAddr) {
    let ctx = ProtocolContext::new(OmapiConfig::default(), handler);
    let caller = Object::generic();
    let listener = protocol_listen(&caller, 0, 5, &ctx).await.unwrap();
    let port = listener
        .downcast_ref::<Listener>()
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    (caller, listener, SocketAddr::from(([127, 0, 0, 1], port)))
}

async fn blocking_wait(caller: &Object) -> OmapiResult<()> {
    let caller = caller.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || wait(&caller)),
    )
    .await
    .expect("wait timed out")
    .unwrap()
}

async fn client(addr: SocketAddr, handler: Arc<dyn MessageHandler>) -> (Object, Object) {
    let ctx = ProtocolContext::new(OmapiConfig::default(), handler);
    let caller = Object::generic();
    let protocol = connect(&caller, "127.0.0.1", addr.port(), &ctx, None)
        .await
        .unwrap();
    (caller, protocol)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_reaches_header_wait() {
    let (_server, _listener, addr) = start_server(Arc::new(Recorder::default())).await;
    let (caller, protocol) = client(addr, Arc::new(Recorder::default())).await;
    assert_eq!(caller.outer(), Some(protocol.clone()));

    blocking_wait(&caller).await.unwrap();
    let this = protocol.downcast_ref::<Protocol>().unwrap();
    assert_eq!(this.state(), ProtocolState::HeaderWait);
    assert_eq!(this.protocol_version(), 100);
    assert_eq!(this.header_size(), 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_keeps_authinfo_and_context() {
    let (_server, _listener, addr) = start_server(Arc::new(Recorder::default())).await;
    let config = OmapiConfig {
        buffer_size: 512,
        ..OmapiConfig::default()
    };
    let ctx = ProtocolContext::new(config, Arc::new(Recorder::default()));
    let key = Object::generic();
    key.set_value("name", TypedData::from("omapi-key")).unwrap();
    let caller = Object::generic();
    let protocol = connect(&caller, "127.0.0.1", addr.port(), &ctx, Some(key.clone()))
        .await
        .unwrap();
    blocking_wait(&caller).await.unwrap();

    let this = protocol.downcast_ref::<Protocol>().unwrap();
    assert_eq!(this.authinfo(), Some(key));
    assert_eq!(this.context().config.buffer_size, 512);
    assert!(this.context().handles.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_reply_round_trip() {
    let server_handler = Arc::new(Responder::default());
    let (_server, _listener, addr) = start_server(server_handler.clone()).await;
    let replies = Arc::new(Recorder::default());
    let (caller, protocol) = client(addr, replies.clone()).await;
    blocking_wait(&caller).await.unwrap();

    let request = Message::with_op(Opcode::Open);
    request.set_value("type", TypedData::from("host")).unwrap();
    let host = Object::generic();
    host.set_value("name", TypedData::from("ns1")).unwrap();
    request.set_value("object", TypedData::Object(host)).unwrap();
    send_message(&protocol, &request, None, None).unwrap();
    blocking_wait(&caller).await.unwrap();

    let request_id = request.downcast_ref::<Message>().unwrap().id();
    let received = replies.taken();
    assert_eq!(received.len(), 1);
    let reply = received[0].downcast_ref::<Message>().unwrap();
    assert_eq!(reply.op(), Opcode::Status.as_u32());
    assert_eq!(reply.rid(), request_id);
    assert_eq!(reply.value("result").and_then(|v| v.as_u32()), Some(0));
    assert_eq!(
        reply.value("message").as_ref().and_then(TypedData::as_str),
        Some("ok")
    );

    let seen = server_handler.seen.taken();
    assert_eq!(seen.len(), 1);
    let got = seen[0].downcast_ref::<Message>().unwrap();
    assert_eq!(got.op(), Opcode::Open.as_u32());
    assert_eq!(got.value("type").as_ref().and_then(TypedData::as_str), Some("host"));
    let object = got.object().unwrap();
    assert_eq!(object.get_value("name").unwrap().as_str(), Some("ns1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipelined_requests_all_answered() {
    let (_server, _listener, addr) = start_server(Arc::new(Responder::default())).await;
    let replies = Arc::new(Recorder::default());
    let (caller, protocol) = client(addr, replies.clone()).await;
    blocking_wait(&caller).await.unwrap();

    for _ in 0..3 {
        send_message(&protocol, &Message::with_op(Opcode::Refresh), None, None).unwrap();
    }
    blocking_wait(&caller).await.unwrap();
    assert_eq!(replies.taken().len(), 3);
}

#[tokio::test]
async fn test_fragmented_request_from_raw_peer() {
    let (_server, _listener, addr) = start_server(Arc::new(Responder::default())).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();

    let request = Message::with_op(Opcode::Open);
    request.set_value("type", TypedData::from("lease")).unwrap();
    let header = MessageHeader {
        op: Opcode::Open.as_u32(),
        id: 41,
        ..Default::default()
    };
    let mut stream = encode_intro(100, 24).to_vec();
    stream.extend_from_slice(&encode_message(&request, &header, 24, None).unwrap());
    for piece in stream.chunks(3) {
        peer.write_all(piece).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut decoder = MessageDecoder::new(&OmapiConfig::default());
    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut bytes = vec![0u8; decoder.need()];
            peer.read_exact(&mut bytes).await.unwrap();
            if let Decoded::Message(message) = decoder.feed(&bytes).unwrap() {
                return message;
            }
        }
    })
    .await
    .unwrap();

    let reply = reply.downcast_ref::<Message>().unwrap();
    assert_eq!(reply.op(), Opcode::Status.as_u32());
    assert_eq!(reply.rid(), 41);
}

#[tokio::test]
async fn test_version_mismatch_closes_connection() {
    let server_handler = Arc::new(Recorder::default());
    let (_server, _listener, addr) = start_server(server_handler.clone()).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();
    peer.write_all(&encode_intro(99, 24)).await.unwrap();

    let mut received = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received)).await;
    assert!(read.is_ok(), "server kept the connection open");
    // Nothing but (part of) the server's own handshake precedes the close.
    assert!(encode_intro(100, 24).starts_with(&received));
    assert!(server_handler.taken().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_disconnect_fails_pending_wait() {
    // The server records but never answers.
    let (_server, _listener, addr) = start_server(Arc::new(Recorder::default())).await;
    let (caller, protocol) = client(addr, Arc::new(Recorder::default())).await;
    blocking_wait(&caller).await.unwrap();

    send_message(&protocol, &Message::with_op(Opcode::Open), None, None).unwrap();
    let pending = {
        let caller = caller.clone();
        tokio::task::spawn_blocking(move || wait(&caller))
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    disconnect(&caller, true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(OmapiError::ConnectionClosed)));
    assert!(matches!(
        send_message(&protocol, &Message::with_op(Opcode::Open), None, None),
        Err(OmapiError::ConnectionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_chain_torn_down_after_close() {
    let (_server, _listener, addr) = start_server(Arc::new(Recorder::default())).await;
    let (caller, protocol) = client(addr, Arc::new(Recorder::default())).await;
    blocking_wait(&caller).await.unwrap();

    let connection = protocol.outer().unwrap().downgrade();
    let weak_protocol = protocol.downgrade();
    disconnect(&caller, true).unwrap();
    drop(protocol);
    drop(caller);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(weak_protocol.is_destroyed());
    assert!(connection.is_destroyed());
}

#[tokio::test]
async fn test_server_chain_survives_while_listening() {
    let (server, listener, _addr) = start_server(Arc::new(Recorder::default())).await;
    let layer = listener.inner().unwrap();
    assert_eq!(layer.type_name(), "protocol-listener");
    assert_eq!(layer.inner(), Some(server.clone()));

    let weak = listener.downgrade();
    drop(layer);
    drop(listener);
    assert!(!weak.is_destroyed());
    drop(server);
    assert!(weak.is_destroyed());
}
