// HL7 v2 over MLLP

pub mod error;
pub mod hl7;
pub mod mllp;

// Re-exports
pub use error::{ProtocolError, Result};
pub use hl7::SystemMessage;
pub use mllp::MllpTransport;
