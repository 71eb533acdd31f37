//! The message object: one protocol exchange.

use crate::object::{Object, ObjectBehavior};
use crate::value::{TypedData, ValueWriter};
use bytes::{Buf, BufMut};
use omapi_types::{OmapiError, OmapiResult};
use std::sync::{Mutex, MutexGuard};

/// The fixed part of a message header, in wire order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub authid: u32,
    pub authlen: u32,
    pub op: u32,
    pub handle: u32,
    pub id: u32,
    pub rid: u32,
}

impl MessageHeader {
    /// Encoded size of the fixed header.
    pub const SIZE: usize = 24;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.authid);
        buf.put_u32(self.authlen);
        buf.put_u32(self.op);
        buf.put_u32(self.handle);
        buf.put_u32(self.id);
        buf.put_u32(self.rid);
    }

    /// Decode the fixed header. The caller guarantees 24 bytes are present.
    pub fn decode(buf: &mut impl Buf) -> Self {
        Self {
            authid: buf.get_u32(),
            authlen: buf.get_u32(),
            op: buf.get_u32(),
            handle: buf.get_u32(),
            id: buf.get_u32(),
            rid: buf.get_u32(),
        }
    }
}

#[derive(Default)]
struct MessageState {
    header: MessageHeader,
    authenticator: Option<Vec<u8>>,
    object: Option<Object>,
    values: Vec<(String, TypedData)>,
}

/// Message object behaviour.
///
/// The header attribute names `op`, `handle`, `id`, `rid` and `authid` map to
/// header fields, `authenticator` to the carried authenticator payload and
/// `object` to the attached object. Every other name is a message-scoped
/// value.
#[derive(Default)]
pub struct Message {
    state: Mutex<MessageState>,
}

impl Message {
    /// Create an empty message.
    pub fn create() -> Object {
        Object::create(Message::default())
    }

    /// Create a message with the given opcode.
    pub fn with_op(op: impl Into<u32>) -> Object {
        let message = Message::default();
        message.lock().header.op = op.into();
        Object::create(message)
    }

    fn lock(&self) -> MutexGuard<'_, MessageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn header(&self) -> MessageHeader {
        self.lock().header
    }

    pub fn op(&self) -> u32 {
        self.lock().header.op
    }

    pub fn id(&self) -> u32 {
        self.lock().header.id
    }

    pub fn rid(&self) -> u32 {
        self.lock().header.rid
    }

    pub fn handle(&self) -> u32 {
        self.lock().header.handle
    }

    pub fn authenticator(&self) -> Option<Vec<u8>> {
        self.lock().authenticator.clone()
    }

    /// The attached object, if any.
    pub fn object(&self) -> Option<Object> {
        self.lock().object.clone()
    }

    /// Message-scoped values in arrival order.
    pub fn values(&self) -> Vec<(String, TypedData)> {
        self.lock().values.clone()
    }

    pub fn value(&self, name: &str) -> Option<TypedData> {
        self.lock()
            .values
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.clone())
    }

    pub(crate) fn set_header(&self, header: MessageHeader) {
        self.lock().header = header;
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.lock().header.id = id;
    }

    /// The attached object, creating a generic one on first use.
    pub(crate) fn object_or_create(&self) -> Object {
        self.lock().object.get_or_insert_with(Object::generic).clone()
    }
}

fn header_field<'a>(header: &'a mut MessageHeader, name: &str) -> Option<&'a mut u32> {
    match name {
        "op" => Some(&mut header.op),
        "handle" => Some(&mut header.handle),
        "id" => Some(&mut header.id),
        "rid" => Some(&mut header.rid),
        "authid" => Some(&mut header.authid),
        _ => None,
    }
}

impl ObjectBehavior for Message {
    fn type_name(&self) -> &'static str {
        "message"
    }

    fn set_value(&self, _this: &Object, name: &str, value: TypedData) -> OmapiResult<()> {
        let mut state = self.lock();
        if let Some(field) = header_field(&mut state.header, name) {
            *field = value.as_u32().ok_or_else(|| {
                OmapiError::InvalidArgument(format!("{name} must be a 32-bit integer"))
            })?;
            return Ok(());
        }
        let released = match name {
            "authenticator" => {
                let bytes = value.as_bytes().map(<[u8]>::to_vec).ok_or_else(|| {
                    OmapiError::InvalidArgument("authenticator must be data".into())
                })?;
                state.authenticator = Some(bytes);
                None
            }
            "object" => match value {
                TypedData::Object(object) => state.object.replace(object).map(TypedData::Object),
                _ => {
                    return Err(OmapiError::InvalidArgument(
                        "object must be an object reference".into(),
                    ))
                }
            },
            _ => match state.values.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, slot)) => Some(std::mem::replace(slot, value)),
                None => {
                    state.values.push((name.to_string(), value));
                    None
                }
            },
        };
        drop(state);
        drop(released);
        Ok(())
    }

    fn get_value(&self, this: &Object, name: &str) -> OmapiResult<TypedData> {
        let found = {
            let mut state = self.lock();
            if let Some(field) = header_field(&mut state.header, name) {
                return Ok(TypedData::Int(*field));
            }
            match name {
                "authenticator" => state.authenticator.clone().map(TypedData::Data),
                "object" => state.object.clone().map(TypedData::Object),
                _ => state
                    .values
                    .iter()
                    .find(|(existing, _)| existing == name)
                    .map(|(_, value)| value.clone()),
            }
        };
        match found {
            Some(value) => Ok(value),
            None => this.pass_get_value(name),
        }
    }

    fn stuff_values(&self, _this: &Object, out: &mut ValueWriter<'_>) -> OmapiResult<()> {
        for (name, value) in &self.values() {
            out.put(name, value)?;
        }
        Ok(())
    }

    fn destroy(&self) {
        let state = std::mem::take(&mut *self.lock());
        drop(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use omapi_types::Opcode;

    #[test]
    fn test_header_fields_route_to_header() {
        let object = Message::with_op(Opcode::Status);
        object.set_value("rid", TypedData::Int(7)).unwrap();
        object
            .set_value("handle", TypedData::Data(vec![0, 0, 0, 3]))
            .unwrap();

        let message = object.downcast_ref::<Message>().unwrap();
        assert_eq!(message.op(), 5);
        assert_eq!(message.rid(), 7);
        assert_eq!(message.handle(), 3);
        assert!(message.values().is_empty());
        assert_eq!(object.get_value("rid").unwrap(), TypedData::Int(7));
    }

    #[test]
    fn test_header_field_rejects_non_integer() {
        let object = Message::create();
        assert!(matches!(
            object.set_value("id", TypedData::from("seven")),
            Err(OmapiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_other_names_are_message_values() {
        let object = Message::create();
        object.set_value("result", TypedData::Int(0)).unwrap();
        object.set_value("message", TypedData::from("ok")).unwrap();
        object.set_value("result", TypedData::Int(1)).unwrap();

        let message = object.downcast_ref::<Message>().unwrap();
        let names: Vec<String> = message.values().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["result", "message"]);
        assert_eq!(message.value("result"), Some(TypedData::Int(1)));
    }

    #[test]
    fn test_attach_object() {
        let object = Message::create();
        let target = Object::generic();
        object
            .set_value("object", TypedData::Object(target.clone()))
            .unwrap();
        let message = object.downcast_ref::<Message>().unwrap();
        assert_eq!(message.object(), Some(target.clone()));

        assert!(matches!(
            object.set_value("object", TypedData::Int(1)),
            Err(OmapiError::InvalidArgument(_))
        ));

        // Attaching again releases the previous object.
        let weak = target.downgrade();
        drop(target);
        object
            .set_value("object", TypedData::Object(Object::generic()))
            .unwrap();
        assert!(weak.is_destroyed());
    }

    #[test]
    fn test_stuff_values_skips_header_and_object() {
        let object = Message::with_op(Opcode::Open);
        object.set_value("name", TypedData::from("x")).unwrap();
        object
            .set_value("object", TypedData::Object(Object::generic()))
            .unwrap();

        let mut buf = BytesMut::new();
        object
            .stuff_values(&mut ValueWriter::new(&mut buf, None))
            .unwrap();
        assert_eq!(&buf[..], &[0, 4, b'n', b'a', b'm', b'e', 0, 0, 0, 1, b'x']);
    }

    #[test]
    fn test_header_wire_order() {
        let header = MessageHeader {
            authid: 1,
            authlen: 2,
            op: 3,
            handle: 4,
            id: 5,
            rid: 6,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MessageHeader::SIZE);
        assert_eq!(&buf[..8], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(MessageHeader::decode(&mut buf.freeze()), header);
    }
}
