//! The shared buffer carrying the single in-flight message.
//!
//! Wire format: one byte per ASCII character followed by a zero byte. No
//! length prefix, no checksum; the terminator is the only framing. The
//! segment is opened and mapped for every transfer and unmapped right after,
//! so a crash mid-transfer affects only that exchange.

use crate::error::{Error, Result};
use crate::provision::Role;
use crate::shm::{self, Shm};

/// Default capacity of the shared buffer, terminator included.
pub const MAX_LENGTH: usize = 1024;

const TERMINATOR: u8 = 0;

/// Encodes `text` into a terminated frame. Fails before anything is written
/// if the text is not plain ASCII or does not fit `capacity` with its
/// terminator.
pub fn encode(text: &str, capacity: usize) -> Result<Vec<u8>> {
    if !text.is_ascii() {
        return Err(Error::InvalidPayload("text must be ASCII"));
    }
    if text.bytes().any(|b| b == TERMINATOR) {
        return Err(Error::InvalidPayload("text cannot contain a NUL byte"));
    }
    if text.len() + 1 > capacity {
        return Err(Error::PayloadTooLarge {
            len: text.len(),
            capacity,
        });
    }
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(TERMINATOR);
    Ok(frame)
}

/// Decodes the text in front of the first zero byte.
pub fn decode(bytes: &[u8]) -> Result<String> {
    let end = bytes
        .iter()
        .position(|&b| b == TERMINATOR)
        .ok_or(Error::Unterminated)?;
    let text = &bytes[..end];
    if !text.is_ascii() {
        return Err(Error::InvalidPayload("buffer holds non-ASCII bytes"));
    }
    // ASCII is valid UTF-8.
    Ok(text.iter().map(|&b| b as char).collect())
}

/// The buffer segment as one side of the channel sees it. Only the Server
/// may create the segment; a Client that finds it missing gets
/// [`Error::NotFound`] rather than leaving an orphan name behind.
#[derive(Debug, Clone)]
pub(crate) struct BufferTarget {
    pub name: String,
    pub capacity: usize,
    pub create: bool,
}

impl BufferTarget {
    pub fn for_role(role: Role, name: &str, capacity: usize) -> Self {
        BufferTarget {
            name: name.into(),
            capacity,
            create: role == Role::Server,
        }
    }

    /// Makes sure the segment exists, creating it if this side may.
    pub fn ensure(&self) -> Result<()> {
        self.map().map(drop)
    }

    /// Copies an encoded frame into the segment.
    pub fn write_frame(&self, frame: &[u8]) -> Result<()> {
        debug_assert!(frame.len() <= self.capacity);
        let mut shm = self.map()?;
        shm[..frame.len()].copy_from_slice(frame);
        tracing::trace!(name = %shm.name(), len = frame.len(), "frame written");
        Ok(())
    }

    /// Reads the message the segment currently holds.
    pub fn read_message(&self) -> Result<String> {
        let shm = self.map()?;
        decode(&shm)
    }

    fn map(&self) -> Result<Shm> {
        Shm::options()
            .create(self.create)
            .mode(shm::WORLD_ACCESSIBLE)
            .len(self.capacity)
            .open(&self.name)
    }
}
