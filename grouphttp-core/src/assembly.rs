//! Bounded reassembly of one inbound request body.
//! The host feeds body frames as they arrive and takes the message bytes at end of stream.

use bytes::{Bytes, BytesMut};

use crate::endpoint::PeerEndpoint;

/// Buffer capacity when the request does not declare a length.
pub const DEFAULT_INITIAL_CAPACITY: usize = 1024;

/// Growable buffer for one request, never larger than `max_content_length`.
#[derive(Debug)]
pub struct InboundAssembly {
    sender: PeerEndpoint,
    max_content_length: usize,
    buf: BytesMut,
    complete: bool,
}

impl InboundAssembly {
    /// Start assembling a body from `sender`. A declared length above the limit is rejected
    /// before anything is allocated.
    pub fn new(
        sender: PeerEndpoint,
        declared_length: Option<u64>,
        max_content_length: usize,
    ) -> Result<Self, AssemblyError> {
        let capacity = match declared_length {
            Some(len) if len > max_content_length as u64 => {
                return Err(AssemblyError::TooLarge {
                    length: len,
                    max: max_content_length,
                })
            }
            Some(len) => len as usize,
            None => DEFAULT_INITIAL_CAPACITY.min(max_content_length),
        };
        Ok(Self {
            sender,
            max_content_length,
            buf: BytesMut::with_capacity(capacity),
            complete: false,
        })
    }

    pub fn sender(&self) -> &PeerEndpoint {
        &self.sender
    }

    pub fn received(&self) -> usize {
        self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Append one body frame. Fails once the accumulated body would exceed the limit;
    /// a body exactly at the limit is accepted.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), AssemblyError> {
        if self.complete {
            return Err(AssemblyError::AlreadyComplete);
        }
        let total = self.buf.len() as u64 + chunk.len() as u64;
        if total > self.max_content_length as u64 {
            return Err(AssemblyError::TooLarge {
                length: total,
                max: self.max_content_length,
            });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// End of stream: hands over the message bytes. Further pushes fail.
    pub fn finish(&mut self) -> Bytes {
        self.complete = true;
        self.buf.split().freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("content of {length} bytes exceeds maximum of {max}")]
    TooLarge { length: u64, max: usize },
    #[error("body already complete")]
    AlreadyComplete,
}
