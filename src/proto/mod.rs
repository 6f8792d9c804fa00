//! The message protocol spoken on the bus and between daemons.

pub mod codec;
pub mod message;

pub use codec::{CodecError, MessageReader, decode, encode, write_message};
pub use message::{Message, commands};
