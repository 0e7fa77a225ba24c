//! Request bodies: sized, restartable sequences of byte chunks.

use bytes::Bytes;

/// Content type of every transport message.
pub const MESSAGE_CONTENT_TYPE: &str = "application/x-jgroups-message";

/// A request body. `chunks()` must yield the same bytes from the start on every call,
/// because a client may need to read the body more than once (length probing, retries).
pub trait ContentSource: Send + Sync {
    fn content_type(&self) -> &str;

    /// Declared length, if known up front. When present it equals the sum of chunk sizes.
    fn length(&self) -> Option<u64>;

    fn chunks(&self) -> Box<dyn Iterator<Item = Bytes> + Send + '_>;
}

/// Declared length, or the sum of chunk sizes when the source does not declare one.
/// Draining costs one full pass over the source.
pub fn content_length(source: &dyn ContentSource) -> Result<u64, ContentError> {
    if let Some(len) = source.length() {
        return Ok(len);
    }
    source
        .chunks()
        .try_fold(0u64, |acc, c| acc.checked_add(c.len() as u64))
        .ok_or(ContentError::LengthOverflow)
}

/// Fixed window of a byte buffer. The window is copied on construction,
/// so the caller may reuse its buffer as soon as `new` returns.
#[derive(Debug, Clone)]
pub struct BytesContent {
    content_type: String,
    data: Bytes,
}

impl BytesContent {
    pub fn new(
        content_type: impl Into<String>,
        bytes: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<Self, ContentError> {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= bytes.len())
            .ok_or(ContentError::OutOfBounds {
                offset,
                length,
                available: bytes.len(),
            })?;
        Ok(Self {
            content_type: content_type.into(),
            data: Bytes::copy_from_slice(&bytes[offset..end]),
        })
    }

    /// Wraps an owned buffer without copying.
    pub fn from_bytes(content_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            content_type: content_type.into(),
            data,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl ContentSource for BytesContent {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn chunks(&self) -> Box<dyn Iterator<Item = Bytes> + Send + '_> {
        Box::new(std::iter::once(self.data.clone()))
    }
}

/// Content of undeclared length split into fixed-size chunks (e.g. a stream that was buffered
/// without a header). Used by clients that must compute the length themselves.
#[derive(Debug, Clone)]
pub struct ChunkedContent {
    content_type: String,
    chunks: Vec<Bytes>,
}

impl ChunkedContent {
    pub fn new(content_type: impl Into<String>, chunks: Vec<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            chunks,
        }
    }
}

impl ContentSource for ChunkedContent {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn length(&self) -> Option<u64> {
        None
    }

    fn chunks(&self) -> Box<dyn Iterator<Item = Bytes> + Send + '_> {
        Box::new(self.chunks.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("window {offset}+{length} exceeds buffer of {available} bytes")]
    OutOfBounds {
        offset: usize,
        length: usize,
        available: usize,
    },
    #[error("content length overflows u64")]
    LengthOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_copied() {
        let mut buf = b"xxhello!".to_vec();
        let content = BytesContent::new(MESSAGE_CONTENT_TYPE, &buf, 2, 5).unwrap();
        buf.iter_mut().for_each(|b| *b = 0);
        let body: Vec<u8> = content.chunks().flat_map(|c| c.to_vec()).collect();
        assert_eq!(body, b"hello");
        assert_eq!(content.length(), Some(5));
        assert_eq!(content.content_type(), MESSAGE_CONTENT_TYPE);
    }

    #[test]
    fn chunks_restart_from_beginning() {
        let content = BytesContent::new("a/b", b"abc", 0, 3).unwrap();
        let first: Vec<Bytes> = content.chunks().collect();
        let second: Vec<Bytes> = content.chunks().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn window_out_of_bounds() {
        assert!(matches!(
            BytesContent::new("a/b", b"abc", 2, 2),
            Err(ContentError::OutOfBounds { .. })
        ));
        assert!(BytesContent::new("a/b", b"abc", usize::MAX, 2).is_err());
    }

    #[test]
    fn undeclared_length_is_drained() {
        let content = ChunkedContent::new(
            "a/b",
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
        );
        assert_eq!(content.length(), None);
        assert_eq!(content_length(&content).unwrap(), 5);
        assert_eq!(content.chunks().count(), 2);
    }
}
