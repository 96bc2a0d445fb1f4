use bytes::{Bytes, BytesMut};

/// Smallest part S3 accepts is 5 MiB; parts are cut once this much is buffered.
pub(crate) const PART_SIZE: usize = 8 * 1024 * 1024;

/// Accumulates stream chunks into multipart upload parts.
#[derive(Debug)]
pub(crate) struct PartBuffer {
    buf: BytesMut,
    part_size: usize,
}

impl Default for PartBuffer {
    fn default() -> Self {
        Self::with_part_size(PART_SIZE)
    }
}

impl PartBuffer {
    pub(crate) fn with_part_size(part_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(part_size),
            part_size,
        }
    }

    /// Returns a full part once enough bytes have accumulated.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() >= self.part_size {
            Some(self.buf.split().freeze())
        } else {
            None
        }
    }

    /// Whatever is left. `None` if nothing is.
    pub(crate) fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}
