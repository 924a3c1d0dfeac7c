//! Pull-style file feeding for the module's streaming trace reads.
//!
//! The module ingests an opened trace file incrementally: it asks for
//! `(offset, length)` and the adapter answers out of whatever blob is
//! currently installed. Short reads are part of the contract; the module's own
//! logic decides how to react to them.

use std::rc::Rc;

/// A file-like byte source the module can read incrementally.
pub trait BlobSource {
    fn len(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning the count copied.
    /// Reads past the end return fewer bytes (possibly zero), never an error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory blob source, used by tests and for small traces already held in
/// memory.
pub struct MemoryBlob {
    bytes: Vec<u8>,
}

impl MemoryBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl BlobSource for MemoryBlob {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= self.bytes.len() {
            return 0;
        }
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        n
    }
}

/// Answers the module's pull requests from the currently installed blob.
///
/// `set_blob` mid-stream is last-writer-wins for the *next* read; an already
/// answered read is never revisited.
#[derive(Default)]
pub(crate) struct StreamingAdapter {
    blob: Option<Rc<dyn BlobSource>>,
}

impl StreamingAdapter {
    pub fn set_blob(&mut self, blob: Rc<dyn BlobSource>) {
        self.blob = Some(blob);
    }

    pub fn clear(&mut self) {
        self.blob = None;
    }

    pub fn has_blob(&self) -> bool {
        self.blob.is_some()
    }

    /// A missing blob or a fully out-of-range request reads as empty; a
    /// partially out-of-range request is clamped to the blob's end.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let Some(blob) = &self.blob else {
            return Vec::new();
        };
        let total = blob.len();
        if offset >= total {
            return Vec::new();
        }
        let available = usize::try_from(total - offset)
            .unwrap_or(usize::MAX)
            .min(len);
        let mut buf = vec![0u8; available];
        let n = blob.read_at(offset, &mut buf);
        buf.truncate(n);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_clamped_to_the_blob() {
        let mut adapter = StreamingAdapter::default();
        adapter.set_blob(Rc::new(MemoryBlob::new(vec![1, 2, 3, 4, 5])));
        assert_eq!(adapter.read(0, 3), vec![1, 2, 3]);
        assert_eq!(adapter.read(3, 10), vec![4, 5]);
        assert_eq!(adapter.read(5, 1), Vec::<u8>::new());
        assert_eq!(adapter.read(100, 1), Vec::<u8>::new());
    }

    #[test]
    fn missing_blob_reads_empty() {
        let adapter = StreamingAdapter::default();
        assert!(!adapter.has_blob());
        assert_eq!(adapter.read(0, 16), Vec::<u8>::new());
    }

    #[test]
    fn set_blob_is_last_writer_wins() {
        let mut adapter = StreamingAdapter::default();
        adapter.set_blob(Rc::new(MemoryBlob::new(vec![1; 4])));
        assert_eq!(adapter.read(0, 2), vec![1, 1]);
        adapter.set_blob(Rc::new(MemoryBlob::new(vec![2; 4])));
        assert_eq!(adapter.read(0, 2), vec![2, 2]);
        adapter.clear();
        assert_eq!(adapter.read(0, 2), Vec::<u8>::new());
    }
}
