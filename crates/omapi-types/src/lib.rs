//! Core types for the Object Management API (OMAPI).
//!
//! This crate defines the pieces shared by the wire layer and the binaries:
//! the error taxonomy, the status codes sent back to peers, the protocol
//! opcodes, and the service configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod opcode;

pub use config::{load_config, OmapiConfig};
pub use error::{OmapiError, OmapiResult, StatusCode};
pub use opcode::Opcode;
