//! Framed byte buffer over a byte stream.
//!
//! A [`FramedBuffer`] owns one read buffer and one write buffer. Parsing code
//! asks for a contiguous run of bytes via [`FramedBuffer::ensure`]; backend
//! message types then borrow directly out of that buffer (see
//! [`crate::protocol::backend`]) instead of allocating. Encoding code appends
//! to the write buffer and calls [`FramedBuffer::flush`] once a frame (or a
//! batch of frames) is complete.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::protocol::backend::RawMessage;

/// Default initial capacity for both halves of the buffer.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Length-prefixed framed buffer wrapping a `Read + Write` transport.
pub struct FramedBuffer<S> {
    stream: S,
    read_buf: Vec<u8>,
    read_start: usize,
    read_end: usize,
    write_buf: Vec<u8>,
}

impl<S: Read + Write> FramedBuffer<S> {
    /// Wrap a stream with the given initial buffer capacity.
    pub fn new(stream: S, capacity: usize) -> Self {
        Self {
            stream,
            read_buf: vec![0u8; capacity],
            read_start: 0,
            read_end: 0,
            write_buf: Vec::with_capacity(capacity),
        }
    }

    /// Borrow the underlying stream (for peer address introspection, etc).
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Borrow the underlying stream mutably (for TLS upgrade).
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume self and return the underlying stream.
    pub fn into_stream(self) -> S {
        self.stream
    }

    fn buffered(&self) -> usize {
        self.read_end - self.read_start
    }

    /// Ensure at least `n` contiguous bytes are available starting at the
    /// current read position, reading from the stream as needed. Grows the
    /// read buffer if `n` exceeds its capacity.
    pub fn ensure(&mut self, n: usize) -> Result<()> {
        if self.buffered() >= n {
            return Ok(());
        }

        // Compact: move unread bytes to the front before growing/refilling.
        if self.read_start > 0 {
            self.read_buf.copy_within(self.read_start..self.read_end, 0);
            self.read_end -= self.read_start;
            self.read_start = 0;
        }

        if self.read_buf.len() < n {
            self.read_buf.resize(n, 0);
        }

        while self.buffered() < n {
            let read = self.stream.read(&mut self.read_buf[self.read_end..])?;
            if read == 0 {
                return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            self.read_end += read;
        }

        Ok(())
    }

    /// Like [`Self::ensure`], but for payloads too large to keep resident in
    /// the reusable read buffer (e.g. a multi-megabyte CopyData chunk):
    /// reads directly into a freshly allocated `Vec` instead of growing the
    /// shared buffer permanently.
    pub fn ensure_or_allocate_temp(&mut self, n: usize) -> Result<Vec<u8>> {
        const INLINE_LIMIT: usize = 64 * 1024;

        if n <= INLINE_LIMIT || n <= self.read_buf.capacity() {
            self.ensure(n)?;
            return Ok(self.read_buf[self.read_start..self.read_start + n].to_vec());
        }

        let mut temp = vec![0u8; n];
        let buffered = self.buffered().min(n);
        temp[..buffered]
            .copy_from_slice(&self.read_buf[self.read_start..self.read_start + buffered]);
        self.read_start += buffered;

        let mut filled = buffered;
        while filled < n {
            let read = self.stream.read(&mut temp[filled..])?;
            if read == 0 {
                return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
            filled += read;
        }

        Ok(temp)
    }

    /// Discard `n` bytes from the read position without copying them out,
    /// used by `DataRowLoadingMode::Skip`.
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            let avail = self.buffered();
            if avail == 0 {
                self.ensure(1.min(n))?;
                continue;
            }
            let take = avail.min(n);
            self.read_start += take;
            n -= take;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> &[u8] {
        let start = self.read_start;
        self.read_start += n;
        &self.read_buf[start..start + n]
    }

    /// Read one full backend message: a type byte, a 4-byte length (itself
    /// included), and the payload. The returned [`RawMessage`] borrows
    /// directly from the internal read buffer.
    pub fn read_message(&mut self) -> Result<RawMessage<'_>> {
        self.ensure(1)?;
        let type_byte = self.read_buf[self.read_start];
        self.read_start += 1;

        self.ensure(4)?;
        let len_bytes = self.take(4);
        let length = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let payload_len = (length as usize).saturating_sub(4);

        self.ensure(payload_len)?;
        let payload = self.take(payload_len);

        Ok(RawMessage::new(type_byte, payload))
    }

    /// Read a single raw byte without framing (used for the SSLRequest /
    /// GSSENCRequest 'S'/'N' reply and CancelRequest's lack thereof).
    pub fn read_raw_byte(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.take(1)[0])
    }

    /// Bytes of write-buffer headroom before the next flush would need to
    /// grow the buffer. Chunking encoders use this to decide whether to
    /// write into the buffer or emit directly to the stream.
    pub fn write_space_left(&self) -> usize {
        self.write_buf.capacity() - self.write_buf.len()
    }

    /// Append to the pending write buffer without touching the network.
    pub fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.write_buf
    }

    /// Flush the write buffer to the stream.
    pub fn flush(&mut self) -> Result<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf)?;
            self.write_buf.clear();
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Flush the write buffer, then write `data` straight to the stream,
    /// bypassing the buffer entirely. Used by chunking frontend messages
    /// (large COPY payloads, oversized bind parameters) to avoid copying.
    pub fn write_direct(&mut self, data: &[u8]) -> Result<()> {
        self.flush()?;
        self.stream.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn cursor_stream(data: &[u8]) -> FramedBuffer<Cursor<Vec<u8>>> {
        FramedBuffer::new(Cursor::new(data.to_vec()), 16)
    }

    #[test]
    fn reads_a_framed_message() {
        let mut payload = Vec::new();
        payload.push(b'Z');
        payload.extend_from_slice(&5i32.to_be_bytes());
        payload.push(b'I');

        let mut buf = cursor_stream(&payload);
        let msg = buf.read_message().unwrap();
        assert_eq!(msg.type_byte, b'Z');
        assert_eq!(msg.payload, &[b'I']);
    }

    #[test]
    fn grows_read_buffer_for_large_messages() {
        let mut payload = Vec::new();
        payload.push(b'D');
        let body = vec![7u8; 4096];
        payload.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        payload.extend_from_slice(&body);

        let mut buf = cursor_stream(&payload);
        let msg = buf.read_message().unwrap();
        assert_eq!(msg.payload.len(), 4096);
        assert!(msg.payload.iter().all(|&b| b == 7));
    }

    #[test]
    fn unexpected_eof_is_an_io_error() {
        let mut buf = cursor_stream(&[b'Z', 0, 0, 0]);
        let err = buf.read_message().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn skip_discards_without_retaining() {
        let mut payload = vec![1u8, 2, 3, 4, 5];
        payload.extend_from_slice(b"rest");
        let mut buf = cursor_stream(&payload);
        buf.skip(5).unwrap();
        let tail = buf.ensure_or_allocate_temp(4).unwrap();
        assert_eq!(tail, b"rest");
    }
}
