//! Typed attribute values and the name/value wire encoding.

use crate::handle::HandleTable;
use crate::object::Object;
use bytes::{BufMut, BytesMut};
use omapi_types::{OmapiError, OmapiResult};

/// A value stored under an attribute name.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedData {
    Int(u32),
    String(String),
    Data(Vec<u8>),
    Object(Object),
}

impl TypedData {
    /// Integer view. Four-byte `Data` is read as big-endian, which is how
    /// integers arrive off the wire.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TypedData::Int(value) => Some(*value),
            TypedData::Data(bytes) => <[u8; 4]>::try_from(bytes.as_slice())
                .ok()
                .map(u32::from_be_bytes),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TypedData::String(s) => Some(s.as_bytes()),
            TypedData::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// String view; `Data` qualifies when it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedData::String(s) => Some(s),
            TypedData::Data(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            TypedData::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl From<u32> for TypedData {
    fn from(value: u32) -> Self {
        TypedData::Int(value)
    }
}

impl From<&str> for TypedData {
    fn from(value: &str) -> Self {
        TypedData::String(value.to_string())
    }
}

impl From<String> for TypedData {
    fn from(value: String) -> Self {
        TypedData::String(value)
    }
}

impl From<Vec<u8>> for TypedData {
    fn from(value: Vec<u8>) -> Self {
        TypedData::Data(value)
    }
}

impl From<&[u8]> for TypedData {
    fn from(value: &[u8]) -> Self {
        TypedData::Data(value.to_vec())
    }
}

impl From<Object> for TypedData {
    fn from(value: Object) -> Self {
        TypedData::Object(value)
    }
}

/// Appends name/value pairs to an outgoing message body.
///
/// Each pair is a `u16` name length, the name, a `u32` value length and the
/// value. Objects travel as their 4-byte handle; with a handle table present
/// they are published first so the peer can refer back to them.
pub struct ValueWriter<'a> {
    buf: &'a mut BytesMut,
    handles: Option<&'a HandleTable>,
}

impl<'a> ValueWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, handles: Option<&'a HandleTable>) -> Self {
        Self { buf, handles }
    }

    pub fn put(&mut self, name: &str, value: &TypedData) -> OmapiResult<()> {
        if name.is_empty() {
            return Err(OmapiError::InvalidArgument(
                "attribute names cannot be empty".into(),
            ));
        }
        let name_len = u16::try_from(name.len()).map_err(|_| {
            OmapiError::InvalidArgument(format!("attribute name of {} bytes", name.len()))
        })?;

        let handle_bytes;
        let payload: &[u8] = match value {
            TypedData::Int(v) => {
                handle_bytes = v.to_be_bytes();
                &handle_bytes
            }
            TypedData::String(s) => s.as_bytes(),
            TypedData::Data(bytes) => bytes,
            TypedData::Object(object) => {
                let handle = match self.handles {
                    Some(table) => table.publish(object),
                    None => object.handle(),
                };
                handle_bytes = handle.to_be_bytes();
                &handle_bytes
            }
        };
        let value_len = u32::try_from(payload.len()).map_err(|_| {
            OmapiError::InvalidArgument(format!("value for {name} is too large"))
        })?;

        self.buf.put_u16(name_len);
        self.buf.put_slice(name.as_bytes());
        self.buf.put_u32(value_len);
        self.buf.put_slice(payload);
        Ok(())
    }

    /// Write the zero-length name that ends a value list.
    pub fn terminate(&mut self) {
        self.buf.put_u16(0);
    }
}
