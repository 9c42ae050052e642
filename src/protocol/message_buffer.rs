//! Message buffer for accumulating partial reads.
//!
//! strest messages are concatenated JSON objects with no length prefix,
//! so message boundaries are only known once the closing brace of a
//! top-level object has been seen. Bytes are accumulated in a `BytesMut`
//! and scanned once: the scanner keeps its nesting depth and string state
//! between pushes, and each complete object slice is handed to
//! `serde_json`. A trailing partial object stays buffered until more bytes
//! arrive.
//!
//! # Example
//!
//! ```
//! use strest_client::protocol::{MessageBuffer, Response};
//!
//! let mut buffer = MessageBuffer::<Response>::new();
//! let wire = br#"{"strest":{"txn":{"id":"rs1","status":"completed"}}}{"strest":"#;
//!
//! let messages = buffer.push(wire).unwrap();
//! assert_eq!(messages.len(), 1);
//! assert_eq!(messages[0].txn_id(), "rs1");
//! assert!(!buffer.is_empty());
//! ```

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;

use crate::error::{StrestError, Result};

/// Default maximum size of a single buffered message (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Buffer that turns a byte stream into a sequence of decoded messages.
pub struct MessageBuffer<T> {
    /// Accumulated bytes not yet decoded.
    buffer: BytesMut,
    /// Where the partial object at the front of `buffer` stands.
    scan: ScanState,
    /// Upper bound on an incomplete message.
    max_message_size: usize,
    _marker: PhantomData<fn() -> T>,
}

/// Progress through the object at the front of the buffer.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    /// Next unscanned byte, relative to the start of the buffer.
    pos: usize,
    /// Open `{`/`[` count; zero between messages.
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl<T: DeserializeOwned> MessageBuffer<T> {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            scan: ScanState::default(),
            max_message_size,
            _marker: PhantomData,
        }
    }

    /// Push data into the buffer and decode all complete messages.
    ///
    /// Each byte is scanned once, however the message is fragmented.
    ///
    /// # Errors
    ///
    /// Returns an error if anything other than whitespace appears between
    /// objects, if a complete object does not decode as `T`, or if an
    /// incomplete message grows past the configured maximum. The buffer
    /// should be discarded after an error; the stream position is no longer
    /// known.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<T>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        // End of the last complete message (or skipped whitespace).
        let mut consumed = 0;
        let scan = &mut self.scan;

        while scan.pos < self.buffer.len() {
            let byte = self.buffer[scan.pos];
            scan.pos += 1;

            if scan.depth == 0 {
                match byte {
                    b'{' => scan.depth = 1,
                    b if b.is_ascii_whitespace() => consumed = scan.pos,
                    b => {
                        return Err(StrestError::Protocol(format!(
                            "unexpected byte 0x{:02x} between messages",
                            b
                        )))
                    }
                }
                continue;
            }

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth -= 1;
                    if scan.depth == 0 {
                        messages.push(serde_json::from_slice(&self.buffer[consumed..scan.pos])?);
                        consumed = scan.pos;
                    }
                }
                _ => {}
            }
        }

        self.buffer.advance(consumed);
        scan.pos -= consumed;

        if self.buffer.len() > self.max_message_size {
            return Err(StrestError::Protocol(format!(
                "Buffered message size {} exceeds maximum {}",
                self.buffer.len(),
                self.max_message_size
            )));
        }

        Ok(messages)
    }

    /// Number of buffered, undecoded bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no partial message is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T: DeserializeOwned> Default for MessageBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
