//! 3-Space protocol
//!
//! - `codec`: typed big-endian field encode/decode
//! - `commands`: static command table
//! - `framing`: command frames, checksums and the response header

pub mod codec;
pub mod commands;
pub mod framing;

pub use codec::{CommandFrame, Field, FieldType, ResponseFrame};
pub use commands::{code, lookup, CommandSpec, LegacyPolicy};
pub use framing::{Addressing, ResponseHeader};
