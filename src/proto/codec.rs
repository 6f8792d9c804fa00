//! Wire codec: newline-delimited JSON.
//!
//! One message per line on every stream the daemon speaks: the bus
//! connection and the direct peer channels use the same framing.

use std::io::{BufRead, Write};

use thiserror::Error;

use super::message::Message;

/// Refuse absurd lines before handing them to the JSON parser.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(msg: &Message) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<Message, CodecError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(CodecError::LineTooLong);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), CodecError> {
    let line = encode(msg)?;
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Pull messages off a buffered stream one line at a time.
pub struct MessageReader<R> {
    reader: R,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next message, or `None` on a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<Message>, CodecError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            if n > MAX_LINE_BYTES {
                return Err(CodecError::LineTooLong);
            }
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(decode(&line)?));
        }
    }
}
