//! Byte sources, destinations, and the outbound buffer wrapper.
//!
//! A registered buffer is any seekable byte source; the peer pulls it slice
//! by slice, so the only requirements are "tell me your length" (seek to
//! end) and "give me bytes `[start, end)`".  Destinations are the write-side
//! mirror: seekable sinks the reassembled buffer is committed into.

use std::any::Any;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Source / destination traits
// ---------------------------------------------------------------------------

/// A seekable byte source of known length (length is observed by seeking to
/// the end).  Anything `Read + Seek + Send` qualifies: in-memory cursors,
/// files, custom readers.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A seekable byte sink for reassembled buffers.
///
/// The `as_any` accessors let consumers recover the concrete destination
/// they provided (or the default [`MemoryDestination`]) when the completion
/// callback hands the filled sink back as a trait object.
pub trait WriteSeek: Write + Seek + Send + Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Write + Seek + Send + Any> WriteSeek for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// In-memory destination
// ---------------------------------------------------------------------------

/// Size-exact in-memory destination, used by the default provide-destination
/// callback.
#[derive(Debug)]
pub struct MemoryDestination {
    inner: Cursor<Vec<u8>>,
}

impl MemoryDestination {
    /// Allocate a zero-filled destination of exactly `size` bytes.
    pub fn with_size(size: u64) -> io::Result<Self> {
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer size overflow"))?;
        Ok(Self {
            inner: Cursor::new(vec![0; size]),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.inner.get_ref()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Write for MemoryDestination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for MemoryDestination {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

// ---------------------------------------------------------------------------
// Buffer wrapper
// ---------------------------------------------------------------------------

/// A registered outbound buffer: its id, its seekable source, and the
/// request id of the announce that advertised it.
///
/// Size and slice queries both seek the source, so they serialize on the
/// wrapper's own lock; the source is not assumed reentrant.
pub struct BufferWrapper {
    buffer_id: String,
    request_id: Mutex<Option<u64>>,
    source: Mutex<Box<dyn ReadSeek>>,
}

impl BufferWrapper {
    pub(crate) fn new(buffer_id: String, source: Box<dyn ReadSeek>) -> Self {
        Self {
            buffer_id,
            request_id: Mutex::new(None),
            source: Mutex::new(source),
        }
    }

    pub fn buffer_id(&self) -> &str {
        &self.buffer_id
    }

    /// Record the announce request id.  Refreshed on every announce attempt:
    /// retries mint a fresh request id while the buffer id stays stable.
    pub(crate) fn set_request_id(&self, id: u64) {
        *lock(&self.request_id) = Some(id);
    }

    /// The request id of the in-flight announce, once assigned.
    pub fn request_id(&self) -> Option<u64> {
        *lock(&self.request_id)
    }

    /// Byte length of the source.
    pub fn size(&self) -> io::Result<u64> {
        let mut source = lock(&self.source);
        source.seek(SeekFrom::End(0))
    }

    /// Read bytes `[start, end)` from the source.
    ///
    /// The length probe, the seek, and the read happen under one lock hold
    /// so concurrent size and slice queries cannot interleave seeks.
    pub fn slice(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        if end < start {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "slice end precedes start",
            ));
        }

        let mut source = lock(&self.source);

        let size = source.seek(SeekFrom::End(0))?;
        if end > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "slice end exceeds buffer size",
            ));
        }

        let len = usize::try_from(end - start)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "slice length overflow"))?;
        source.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0; len];
        source.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper_over(data: &[u8]) -> BufferWrapper {
        BufferWrapper::new("b1".into(), Box::new(Cursor::new(data.to_vec())))
    }

    #[test]
    fn size_reports_source_length() {
        assert_eq!(wrapper_over(&[0; 1500]).size().unwrap(), 1500);
        assert_eq!(wrapper_over(&[]).size().unwrap(), 0);
    }

    #[test]
    fn slice_returns_exact_range() {
        let wrapper = wrapper_over(b"hello, world");
        assert_eq!(wrapper.slice(0, 5).unwrap(), b"hello");
        assert_eq!(wrapper.slice(7, 12).unwrap(), b"world");
        assert_eq!(wrapper.slice(3, 3).unwrap(), b"");
    }

    #[test]
    fn slice_interleaves_with_size_queries() {
        // Size queries seek to the end; a following slice must still read
        // from the right offset.
        let wrapper = wrapper_over(b"0123456789");
        assert_eq!(wrapper.size().unwrap(), 10);
        assert_eq!(wrapper.slice(2, 6).unwrap(), b"2345");
        assert_eq!(wrapper.size().unwrap(), 10);
        assert_eq!(wrapper.slice(0, 2).unwrap(), b"01");
    }

    #[test]
    fn slice_rejects_bad_ranges() {
        let wrapper = wrapper_over(b"0123456789");
        assert!(wrapper.slice(6, 4).is_err());
        assert!(wrapper.slice(0, 11).is_err());
        assert!(wrapper.slice(11, 11).is_err());
    }

    #[test]
    fn request_id_roundtrip() {
        let wrapper = wrapper_over(b"x");
        assert_eq!(wrapper.request_id(), None);
        wrapper.set_request_id(42);
        assert_eq!(wrapper.request_id(), Some(42));
        // A retry refreshes the recorded id.
        wrapper.set_request_id(43);
        assert_eq!(wrapper.request_id(), Some(43));
    }

    #[test]
    fn memory_destination_is_size_exact() {
        let mut dest = MemoryDestination::with_size(5).unwrap();
        assert_eq!(dest.seek(SeekFrom::End(0)).unwrap(), 5);
        dest.seek(SeekFrom::Start(1)).unwrap();
        dest.write_all(b"abc").unwrap();
        assert_eq!(dest.bytes(), b"\0abc\0");
    }
}
