//! Wire codec: handshake and message encoding, and the incremental decoder.
//!
//! The decoder never reads from a socket itself. The connection layer asks it
//! how many bytes the current state needs ([`MessageDecoder::need`]), waits
//! until that many are buffered, and hands exactly those bytes to
//! [`MessageDecoder::feed`]. Each call consumes one requirement and advances
//! the state machine by one step, so decoding resumes correctly across any
//! TCP fragmentation boundary.

use crate::handle::HandleTable;
use crate::message::{Message, MessageHeader};
use crate::object::Object;
use crate::value::{TypedData, ValueWriter};
use bytes::{Buf, BufMut, BytesMut};
use omapi_types::{OmapiConfig, OmapiError, OmapiResult};
use tracing::trace;

/// Size of the handshake: version and header size.
pub const INTRO_SIZE: usize = 8;

/// Parser state. Payload-carrying states hold the byte count they wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    IntroWait,
    HeaderWait,
    NameLengthWait,
    NameWait(usize),
    ValueLengthWait,
    ValueWait(usize),
    SignatureWait(usize),
}

/// What one step of decoding produced.
#[derive(Debug)]
pub enum Decoded {
    /// More bytes are needed; nothing is complete yet.
    Pending,
    /// The peer's handshake was accepted.
    Intro { version: u32, header_size: u32 },
    /// A complete inbound message.
    Message(Object),
}

/// Byte-incremental decoder for one direction of a connection.
pub struct MessageDecoder {
    state: ProtocolState,
    local_version: u32,
    header_size: u32,
    max_value_len: u32,
    reading_message_values: bool,
    authlen: u32,
    message: Option<Object>,
    name: Option<String>,
}

impl MessageDecoder {
    pub fn new(config: &OmapiConfig) -> Self {
        Self {
            state: ProtocolState::IntroWait,
            local_version: config.protocol_version,
            header_size: MessageHeader::SIZE as u32,
            max_value_len: config.max_value_len,
            reading_message_values: true,
            authlen: 0,
            message: None,
            name: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Header size the peer announced in its handshake.
    pub fn header_size(&self) -> u32 {
        self.header_size
    }

    /// Start over, waiting for a handshake.
    pub fn reset(&mut self) {
        self.state = ProtocolState::IntroWait;
        self.abandon();
    }

    /// Drop any partially decoded message.
    pub fn abandon(&mut self) {
        self.message = None;
        self.name = None;
        self.authlen = 0;
        self.reading_message_values = true;
    }

    /// Number of bytes the current state consumes.
    pub fn need(&self) -> usize {
        match self.state {
            ProtocolState::IntroWait => INTRO_SIZE,
            ProtocolState::HeaderWait => self.header_size as usize,
            ProtocolState::NameLengthWait => 2,
            ProtocolState::ValueLengthWait => 4,
            ProtocolState::NameWait(n)
            | ProtocolState::ValueWait(n)
            | ProtocolState::SignatureWait(n) => n,
        }
    }

    /// Consume exactly [`need`](Self::need) bytes and advance one step.
    pub fn feed(&mut self, mut bytes: &[u8]) -> OmapiResult<Decoded> {
        if bytes.len() != self.need() {
            return Err(OmapiError::Protocol(format!(
                "decoder in {:?} needs {} bytes, got {}",
                self.state,
                self.need(),
                bytes.len()
            )));
        }

        match self.state {
            ProtocolState::IntroWait => {
                let version = bytes.get_u32();
                let header_size = bytes.get_u32();
                if version != self.local_version {
                    return Err(OmapiError::VersionMismatch {
                        local: self.local_version,
                        remote: version,
                    });
                }
                if (header_size as usize) < MessageHeader::SIZE {
                    return Err(OmapiError::Protocol(format!(
                        "declared header size {header_size} is smaller than {}",
                        MessageHeader::SIZE
                    )));
                }
                self.check_len("header size", header_size)?;
                self.header_size = header_size;
                self.state = ProtocolState::HeaderWait;
                Ok(Decoded::Intro {
                    version,
                    header_size,
                })
            }

            ProtocolState::HeaderWait => {
                // Anything past the fixed fields is padding.
                let header = MessageHeader::decode(&mut bytes);
                self.check_len("authenticator length", header.authlen)?;
                let message = Message::create();
                if let Some(inner) = message.downcast_ref::<Message>() {
                    inner.set_header(header);
                }
                trace!(op = header.op, id = header.id, "OMAPI: decoding message");
                self.message = Some(message);
                self.authlen = header.authlen;
                self.reading_message_values = true;
                self.state = ProtocolState::NameLengthWait;
                Ok(Decoded::Pending)
            }

            ProtocolState::NameLengthWait => {
                let len = bytes.get_u16() as usize;
                if len > 0 {
                    self.state = ProtocolState::NameWait(len);
                    return Ok(Decoded::Pending);
                }
                if self.reading_message_values {
                    self.reading_message_values = false;
                    return Ok(Decoded::Pending);
                }
                if self.authlen == 0 {
                    return self.finish();
                }
                self.state = ProtocolState::SignatureWait(self.authlen as usize);
                Ok(Decoded::Pending)
            }

            ProtocolState::NameWait(_) => {
                let name = String::from_utf8(bytes.to_vec()).map_err(|_| {
                    OmapiError::Protocol("attribute name is not valid UTF-8".into())
                })?;
                self.name = Some(name);
                self.state = ProtocolState::ValueLengthWait;
                Ok(Decoded::Pending)
            }

            ProtocolState::ValueLengthWait => {
                let len = bytes.get_u32();
                self.check_len("value length", len)?;
                if len == 0 {
                    self.apply(Vec::new())?;
                } else {
                    self.state = ProtocolState::ValueWait(len as usize);
                }
                Ok(Decoded::Pending)
            }

            ProtocolState::ValueWait(_) => {
                self.apply(bytes.to_vec())?;
                Ok(Decoded::Pending)
            }

            ProtocolState::SignatureWait(_) => {
                // Carried, not verified.
                self.current()?
                    .set_value("authenticator", TypedData::Data(bytes.to_vec()))?;
                self.finish()
            }
        }
    }

    fn check_len(&self, what: &str, len: u32) -> OmapiResult<()> {
        if len > self.max_value_len {
            return Err(OmapiError::Protocol(format!(
                "{what} {len} exceeds limit {}",
                self.max_value_len
            )));
        }
        Ok(())
    }

    fn current(&self) -> OmapiResult<&Object> {
        self.message
            .as_ref()
            .ok_or_else(|| OmapiError::Protocol("no message in progress".into()))
    }

    /// Store the decoded pair and go back for the next name.
    fn apply(&mut self, value: Vec<u8>) -> OmapiResult<()> {
        let name = self
            .name
            .take()
            .ok_or_else(|| OmapiError::Protocol("value without a name".into()))?;
        let message = self.current()?;
        let value = TypedData::Data(value);
        if self.reading_message_values {
            message.set_value(&name, value)?;
        } else {
            let object = message
                .downcast_ref::<Message>()
                .map(Message::object_or_create)
                .ok_or_else(|| OmapiError::Protocol("message in progress has wrong type".into()))?;
            object.set_value(&name, value)?;
        }
        self.state = ProtocolState::NameLengthWait;
        Ok(())
    }

    fn finish(&mut self) -> OmapiResult<Decoded> {
        let message = self
            .message
            .take()
            .ok_or_else(|| OmapiError::Protocol("no message in progress".into()))?;
        self.abandon();
        self.state = ProtocolState::HeaderWait;
        Ok(Decoded::Message(message))
    }
}

/// Encode a handshake.
pub fn encode_intro(version: u32, header_size: u32) -> [u8; INTRO_SIZE] {
    let mut intro = [0u8; INTRO_SIZE];
    intro[..4].copy_from_slice(&version.to_be_bytes());
    intro[4..].copy_from_slice(&header_size.to_be_bytes());
    intro
}

/// Encode a message: header (padded to `header_size`), message-scoped
/// values, terminator, the attached object's values, terminator.
pub fn encode_message(
    message: &Object,
    header: &MessageHeader,
    header_size: u32,
    handles: Option<&HandleTable>,
) -> OmapiResult<BytesMut> {
    let body = message.downcast_ref::<Message>().ok_or_else(|| {
        OmapiError::InvalidArgument(format!("cannot send a {} object", message.type_name()))
    })?;

    let mut buf = BytesMut::with_capacity(header_size as usize + 64);
    header.encode(&mut buf);
    buf.put_bytes(0, (header_size as usize).saturating_sub(MessageHeader::SIZE));

    let mut writer = ValueWriter::new(&mut buf, handles);
    message.stuff_values(&mut writer)?;
    writer.terminate();
    if let Some(object) = body.object() {
        object.stuff_values(&mut writer)?;
    }
    writer.terminate();
    Ok(buf)
}
