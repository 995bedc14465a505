//! Splitting outgoing mechanism messages into bounded chunks and
//! reassembling incoming ones.
//!
//! The transport may cap the size of a single token. A sender whose message
//! exceeds the cap hands it out one chunk per round; the peer answers each
//! intermediate chunk with the empty token. The receiver cannot parse
//! mechanism messages itself, so it asks the provider how long the message
//! announced by the buffered prefix is and waits until that many bytes have
//! arrived.

use std::collections::VecDeque;

use kagi_mech::wire;

/// Error indicating that chunked input does not add up to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidChunk {
    /// More bytes arrived than the message announced.
    TrailingBytes,
    /// The buffered message grew past [`InboundAssembler::MESSAGE_LEN_MAX`].
    TooLarge,
}

impl std::fmt::Display for InvalidChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrailingBytes => write!(f, "chunk runs past the end of the message"),
            Self::TooLarge => write!(f, "chunked message exceeds the size limit"),
        }
    }
}

/// Queue of chunks still owed to the peer.
#[derive(Debug, Default)]
pub struct OutboundChunks {
    chunks: VecDeque<Vec<u8>>,
    /// Whether the message being drained completed the mechanism.
    finished: bool,
}

impl OutboundChunks {
    /// Chunks of a previous message remain to be sent.
    pub fn is_draining(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Take a new message and return the first token to send.
    ///
    /// With no limit, or a message that fits, the message itself is returned.
    /// `finished` is only reported together with the last chunk.
    pub fn load(
        &mut self,
        message: Vec<u8>,
        chunk_size: Option<usize>,
        finished: bool,
    ) -> (Vec<u8>, bool) {
        match chunk_size {
            Some(size) if size > 0 && message.len() > size => {
                self.chunks = message.chunks(size).map(<[u8]>::to_vec).collect();
                self.finished = finished;
                self.next().unwrap_or_default()
            }
            _ => (message, finished),
        }
    }

    /// The next chunk, and whether it is the last one of a finishing message.
    pub fn next(&mut self) -> Option<(Vec<u8>, bool)> {
        let chunk = self.chunks.pop_front()?;
        Some((chunk, self.chunks.is_empty() && self.finished))
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.finished = false;
    }
}

/// Result of feeding a chunk to an [`InboundAssembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum Assembly {
    /// More chunks are needed.
    Partial,
    Complete(Vec<u8>),
}

/// Accumulates chunks until a whole message is available.
#[derive(Debug, Default)]
pub struct InboundAssembler {
    buf: Vec<u8>,
}

impl InboundAssembler {
    /// Maximum length of a message buffered across chunks.
    ///
    /// Limits resource consumption from unauthenticated peers. One maximal
    /// frame plus its header fits.
    pub const MESSAGE_LEN_MAX: usize = wire::HEADER_LEN + wire::BODY_LEN_MAX;

    /// A message is partially buffered.
    pub fn is_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Add `chunk`; `message_len` reports the full length of the message a
    /// prefix belongs to, or `None` if it cannot tell yet.
    pub fn ingest(
        &mut self,
        chunk: &[u8],
        message_len: impl Fn(&[u8]) -> Option<usize>,
    ) -> Result<Assembly, InvalidChunk> {
        if self.buf.is_empty() && message_len(chunk) == Some(chunk.len()) {
            return Ok(Assembly::Complete(chunk.to_vec()));
        }

        self.buf.extend_from_slice(chunk);
        match message_len(&self.buf) {
            Some(len) if len == self.buf.len() => {
                Ok(Assembly::Complete(std::mem::take(&mut self.buf)))
            }
            Some(len) if len < self.buf.len() => {
                self.clear();
                Err(InvalidChunk::TrailingBytes)
            }
            _ if self.buf.len() > Self::MESSAGE_LEN_MAX => {
                self.clear();
                Err(InvalidChunk::TooLarge)
            }
            _ => Ok(Assembly::Partial),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kagi_mech::wire::FrameWriter;

    fn frame(body_len: usize) -> Vec<u8> {
        let mut w = FrameWriter::new(0x42);
        w.put_raw(&vec![0xAB; body_len]);
        w.finish().unwrap()
    }

    fn drain(outbound: &mut OutboundChunks, first: (Vec<u8>, bool)) -> Vec<(Vec<u8>, bool)> {
        let mut out = vec![first];
        while let Some(chunk) = outbound.next() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn message_within_limit_is_not_split() {
        let mut outbound = OutboundChunks::default();
        let msg = frame(10);
        let (first, finished) = outbound.load(msg.clone(), Some(64), true);
        assert_eq!(first, msg);
        assert!(finished);
        assert!(!outbound.is_draining());
    }

    #[test]
    fn finished_only_on_last_chunk() {
        let mut outbound = OutboundChunks::default();
        let msg = frame(20);
        let first = outbound.load(msg.clone(), Some(5), true);
        assert!(outbound.is_draining());

        let chunks = drain(&mut outbound, first);
        assert_eq!(chunks.len(), msg.len().div_ceil(5));
        assert!(chunks.iter().all(|(c, _)| c.len() <= 5));
        let flags: Vec<_> = chunks.iter().map(|(_, f)| *f).collect();
        assert!(flags[..flags.len() - 1].iter().all(|f| !f));
        assert_eq!(flags.last(), Some(&true));

        let joined: Vec<u8> = chunks.iter().flat_map(|(c, _)| c.iter().copied()).collect();
        assert_eq!(joined, msg);
    }

    #[test]
    fn reassembly_byte_by_byte() {
        let msg = frame(200);
        let mut inbound = InboundAssembler::default();
        for (i, byte) in msg.iter().enumerate() {
            let result = inbound.ingest(&[*byte], wire::frame_len).unwrap();
            if i < msg.len() - 1 {
                assert_eq!(result, Assembly::Partial, "should not be ready at byte {i}");
                assert!(inbound.is_partial());
            } else {
                assert_eq!(result, Assembly::Complete(msg.clone()));
            }
        }
        assert!(!inbound.is_partial());
    }

    #[test]
    fn whole_message_passes_straight_through() {
        let msg = frame(8);
        let mut inbound = InboundAssembler::default();
        assert_eq!(
            inbound.ingest(&msg, wire::frame_len).unwrap(),
            Assembly::Complete(msg)
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut msg = frame(8);
        let mut inbound = InboundAssembler::default();
        inbound.ingest(&msg[..4], wire::frame_len).unwrap();
        msg.push(0);
        assert_eq!(
            inbound.ingest(&msg[4..], wire::frame_len),
            Err(InvalidChunk::TrailingBytes)
        );
        assert!(!inbound.is_partial());
    }

    #[test]
    fn unframed_tokens_are_complete_as_delivered() {
        let mut inbound = InboundAssembler::default();
        assert_eq!(
            inbound.ingest(b"opaque", |p| Some(p.len())).unwrap(),
            Assembly::Complete(b"opaque".to_vec())
        );
    }

    #[test]
    fn unbounded_prefix_rejected() {
        let mut inbound = InboundAssembler::default();
        let chunk = vec![0u8; 4096];
        let mut result = Ok(Assembly::Partial);
        for _ in 0..=(InboundAssembler::MESSAGE_LEN_MAX / chunk.len()) {
            result = inbound.ingest(&chunk, |_| None);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(InvalidChunk::TooLarge));
    }
}
