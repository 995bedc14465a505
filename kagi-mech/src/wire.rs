//! Frame codec shared by every built-in mechanism message.
//!
//! A frame is `[kind u8][len u16 BE][body]`. The fixed header lets a receiver
//! tell a complete message from a prefix, which is what allows the negotiation
//! layer to split oversized messages into chunks and reassemble them on the
//! other side without understanding their content.

use crate::error::Error;

/// Length of the `[kind][len]` frame header.
pub const HEADER_LEN: usize = 3;

/// Maximum body length of a single frame.
pub const BODY_LEN_MAX: usize = u16::MAX as usize;

/// Total length of the frame starting with `prefix`, if the header is complete.
///
/// Returns `None` while fewer than [`HEADER_LEN`] bytes are available.
pub fn frame_len(prefix: &[u8]) -> Option<usize> {
    if prefix.len() < HEADER_LEN {
        return None;
    }
    let body = u16::from_be_bytes([prefix[1], prefix[2]]) as usize;
    Some(HEADER_LEN + body)
}

/// Parse a complete frame, returning its kind and body.
///
/// The frame must be exactly as long as its header announces.
pub fn read_frame(message: &[u8]) -> Result<(u8, &[u8]), Error> {
    let total = frame_len(message).ok_or(Error::BadMessage)?;
    if message.len() != total {
        return Err(Error::BadMessage);
    }
    Ok((message[0], &message[HEADER_LEN..]))
}

/// Parse a complete frame that must be of kind `expected`.
pub fn expect_frame(message: &[u8], expected: u8) -> Result<&[u8], Error> {
    match read_frame(message)? {
        (kind, body) if kind == expected => Ok(body),
        _ => Err(Error::BadMessage),
    }
}

/// Builds a frame body, then seals it with its header.
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new(kind: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(kind);
        buf.extend_from_slice(&[0, 0]);
        Self { buf }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Append raw bytes without a length prefix.
    pub fn put_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Append a u16-length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) -> Result<&mut Self, Error> {
        let len = u16::try_from(v.len()).map_err(|_| Error::MessageTooLarge)?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(v);
        Ok(self)
    }

    pub fn put_str(&mut self, v: &str) -> Result<&mut Self, Error> {
        self.put_bytes(v.as_bytes())
    }

    /// Fill in the header length and return the finished frame.
    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        let body = self.buf.len() - HEADER_LEN;
        let len = u16::try_from(body).map_err(|_| Error::MessageTooLarge)?;
        self.buf[1..HEADER_LEN].copy_from_slice(&len.to_be_bytes());
        Ok(self.buf)
    }
}

/// Cursor over a frame body. Every read is bounds-checked; nothing panics on
/// peer input.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        let (&v, rest) = self.buf.split_first().ok_or(Error::BadMessage)?;
        self.buf = rest;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        let raw = self.raw(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read exactly `len` raw bytes.
    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < len {
            return Err(Error::BadMessage);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.raw(N)?);
        Ok(out)
    }

    /// Read a u16-length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        self.raw(u16::from_be_bytes([hi, lo]) as usize)
    }

    pub fn str(&mut self) -> Result<&'a str, Error> {
        core::str::from_utf8(self.bytes()?).map_err(|_| Error::BadMessage)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        core::mem::take(&mut self.buf)
    }

    /// Fail unless the whole body has been consumed.
    pub fn finish(self) -> Result<(), Error> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::BadMessage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_needs_full_header() {
        assert_eq!(frame_len(&[]), None);
        assert_eq!(frame_len(&[0x01, 0x00]), None);
        assert_eq!(frame_len(&[0x01, 0x00, 0x05]), Some(8));
    }

    #[test]
    fn writer_reader_fields() {
        let mut w = FrameWriter::new(0x42);
        w.put_u8(7).put_u32(0xdead_beef);
        w.put_str("alice").unwrap();
        w.put_raw(&[1, 2, 3]);
        let frame = w.finish().unwrap();
        assert_eq!(frame_len(&frame), Some(frame.len()));

        let body = expect_frame(&frame, 0x42).unwrap();
        let mut r = Reader::new(body);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.str().unwrap(), "alice");
        assert_eq!(r.array::<3>().unwrap(), [1, 2, 3]);
        r.finish().unwrap();
    }

    #[test]
    fn wrong_kind_rejected() {
        let frame = FrameWriter::new(0x01).finish().unwrap();
        assert_eq!(expect_frame(&frame, 0x02), Err(Error::BadMessage));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = FrameWriter::new(0x01).finish().unwrap();
        frame.push(0);
        assert_eq!(read_frame(&frame), Err(Error::BadMessage));
    }

    #[test]
    fn truncated_field_rejected() {
        let mut r = Reader::new(&[0x00, 0x09, b'a']);
        assert_eq!(r.bytes(), Err(Error::BadMessage));
    }

    #[test]
    fn oversized_field_rejected() {
        let big = vec![0u8; BODY_LEN_MAX + 1];
        let mut w = FrameWriter::new(0x01);
        assert!(w.put_bytes(&big).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut w = FrameWriter::new(0x01);
        w.put_raw(&vec![0u8; BODY_LEN_MAX + 1]);
        assert_eq!(w.finish(), Err(Error::MessageTooLarge));
    }
}
