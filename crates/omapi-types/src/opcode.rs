//! Protocol opcodes.
//!
//! The wire layer is opcode-agnostic: it carries the header field as a raw
//! `u32`. These names exist for the message handlers and for callers that
//! build outgoing messages.

use std::fmt;

/// Well-known OMAPI opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Open = 1,
    Refresh = 2,
    Update = 3,
    Notify = 4,
    Status = 5,
    Delete = 6,
}

impl Opcode {
    /// Decode a header opcode, returning `None` for values we have no name for.
    pub fn from_u32(op: u32) -> Option<Self> {
        match op {
            1 => Some(Self::Open),
            2 => Some(Self::Refresh),
            3 => Some(Self::Update),
            4 => Some(Self::Notify),
            5 => Some(Self::Status),
            6 => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a lowercase opcode name as typed on a command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "refresh" => Some(Self::Refresh),
            "update" => Some(Self::Update),
            "notify" => Some(Self::Notify),
            "status" => Some(Self::Status),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Refresh => "refresh",
            Self::Update => "update",
            Self::Notify => "notify",
            Self::Status => "status",
            Self::Delete => "delete",
        }
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op.as_u32()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::Status.as_u32(), 5);
        assert_eq!(Opcode::from_u32(3), Some(Opcode::Update));
        assert_eq!(Opcode::from_u32(0), None);
        assert_eq!(Opcode::from_u32(42), None);
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::from_name("OPEN"), Some(Opcode::Open));
        assert_eq!(Opcode::from_name("bogus"), None);
        assert_eq!(Opcode::Delete.to_string(), "delete");
    }
}
