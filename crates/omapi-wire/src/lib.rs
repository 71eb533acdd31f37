//! OMAPI wire layer: objects, connections and the protocol engine.
//!
//! Server-side objects are exposed to remote clients over a persistent TCP
//! connection using a typed name/value wire format.
//!
//! ## Architecture
//!
//! - **Object**: reference-counted entity that layers into inner/outer
//!   chains; unhandled requests fall through to the inner object
//! - **HandleTable**: numeric handles peers use to address published objects
//! - **Connection**: requirement-driven buffered I/O on a TCP stream
//! - **Listener**: accepts connections and announces them inward
//! - **Protocol**: handshake, message encoding and the incremental decoder
//! - **MessageHandler**: trait receiving every complete inbound message

pub mod codec;
pub mod connection;
pub mod generic;
pub mod handle;
pub mod listener;
pub mod message;
pub mod object;
pub mod protocol;
pub mod value;

pub use codec::{Decoded, MessageDecoder, ProtocolState};
pub use connection::{Connection, ConnectionState};
pub use generic::GenericObject;
pub use handle::HandleTable;
pub use listener::Listener;
pub use message::{Message, MessageHeader};
pub use object::{Object, ObjectBehavior, Signal, WeakObject};
pub use protocol::{
    connect, disconnect, protocol_listen, send_message, send_status, send_update, wait,
    wait_timeout, MessageHandler, Protocol, ProtocolContext, ProtocolListener,
};
pub use value::{TypedData, ValueWriter};
