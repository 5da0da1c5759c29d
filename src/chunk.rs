use crate::TlsError;
use bytes::BytesMut;

/// One-shot completion handler attached to a [`Chunk`].
///
/// `Ok(())` means the chunk was fully consumed by the engine (or, for an
/// inbound chunk that hit underflow, that the producer should send more
/// bytes). `Err` carries a steady-state encoding failure for this chunk.
pub type ChunkCallback = Box<dyn FnOnce(Result<(), TlsError>)>;

/// A queued unit of data plus its completion callback.
///
/// Outbound chunks hold plaintext waiting to be wrapped; inbound chunks hold
/// ciphertext waiting to be unwrapped. `data` is `None` for a pure shutdown
/// signal or an empty "wrap anyway" probe that only flushes handshake bytes.
pub struct Chunk {
    data: Option<BytesMut>,
    shutdown: bool,
    callback: Option<ChunkCallback>,
}

impl Chunk {
    pub fn new(data: Option<BytesMut>, shutdown: bool, callback: Option<ChunkCallback>) -> Self {
        Chunk {
            data,
            shutdown,
            callback,
        }
    }

    /// The unconsumed bytes of this chunk; empty when there is no buffer.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Marks `n` bytes as consumed by the engine.
    pub fn advance(&mut self, n: usize) {
        if let Some(buf) = &mut self.data {
            bytes::Buf::advance(buf, n);
        } else {
            debug_assert_eq!(n, 0);
        }
    }

    pub fn is_drained(&self) -> bool {
        self.data().is_empty()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Removes the callback. Once taken it can never fire a second time,
    /// because this slot is the only reference to it.
    pub fn take_callback(&mut self) -> Option<ChunkCallback> {
        self.callback.take()
    }

    pub fn take_data(&mut self) -> Option<BytesMut> {
        self.data.take()
    }

    pub fn set_data(&mut self, data: Option<BytesMut>) {
        self.data = data;
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.data().len())
            .field("shutdown", &self.shutdown)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_can_only_be_taken_once() {
        let mut chunk = Chunk::new(None, false, Some(Box::new(|_| {})));
        assert!(chunk.take_callback().is_some());
        assert!(chunk.take_callback().is_none());
    }

    #[test]
    fn advance_drains_data() {
        let mut chunk = Chunk::new(Some(BytesMut::from(&b"hello"[..])), false, None);
        assert!(!chunk.is_drained());
        chunk.advance(2);
        assert_eq!(chunk.data(), b"llo");
        chunk.advance(3);
        assert!(chunk.is_drained());
    }

    #[test]
    fn missing_data_reads_as_empty() {
        let chunk = Chunk::new(None, true, None);
        assert!(chunk.is_drained());
        assert!(chunk.is_shutdown());
        assert_eq!(chunk.data(), b"");
    }
}
