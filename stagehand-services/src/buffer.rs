use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use stagehand_core::SinkRef;

/// An immutable byte range handed to a connection for writing, or received
/// from one.
///
/// The optional completion sink receives the drain or clog notification of a
/// write; the tag lets the application correlate that notification with its
/// own state.
#[derive(Clone)]
pub struct Buffer {
    data: Bytes,
    offset: usize,
    size: usize,
    completion: Option<SinkRef>,
    tag: Option<Arc<dyn Any + Send + Sync>>,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len();
        Self {
            data,
            offset: 0,
            size,
            completion: None,
            tag: None,
        }
    }

    /// A view of `size` bytes starting at `offset`; `None` if out of range.
    pub fn slice(data: impl Into<Bytes>, offset: usize, size: usize) -> Option<Self> {
        let data = data.into();
        let end = offset.checked_add(size)?;
        if end > data.len() {
            return None;
        }
        Some(Self {
            data,
            offset,
            size,
            completion: None,
            tag: None,
        })
    }

    pub fn with_completion(mut self, completion: SinkRef) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_tag<T: Any + Send + Sync>(mut self, tag: T) -> Self {
        self.tag = Some(Arc::new(tag));
        self
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn completion(&self) -> Option<&SinkRef> {
        self.completion.as_ref()
    }

    pub fn tag<T: Any>(&self) -> Option<&T> {
        self.tag.as_deref().and_then(|t| t.downcast_ref())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("completion", &self.completion.as_ref().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_range_checked() {
        let buf = Buffer::slice(&b"hello world"[..], 6, 5).unwrap();
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.len(), 5);
        assert!(Buffer::slice(&b"hello"[..], 3, 3).is_none());
        assert!(Buffer::slice(&b"hello"[..], usize::MAX, 2).is_none());
        assert!(Buffer::new(Bytes::new()).is_empty());
    }

    #[test]
    fn tags_downcast_to_their_type() {
        let buf = Buffer::new("x").with_tag(42u32);
        assert_eq!(buf.tag::<u32>(), Some(&42));
        assert_eq!(buf.tag::<String>(), None);
    }
}
