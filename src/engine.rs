//! Interfaces the embedding system must provide: the underlying crypto
//! engine and the trust manager used for peer verification.

use crate::EngineError;
use bytes::BytesMut;
use tokio_rustls::rustls::Certificate;

/// CPU-bound handshake work (key exchange math, certificate checks) that the
/// engine cannot perform inline. Runs on a worker pool, never on the script
/// thread.
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// Result status of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The call completed normally.
    Ok,
    /// The destination buffer has too little spare capacity; grow it and retry.
    BufferOverflow,
    /// The source does not hold a complete record; more input is needed.
    BufferUnderflow,
    /// The engine is closed in this direction.
    Closed,
}

/// What the engine's handshake state machine needs next.
///
/// The record layer drives this with an explicit `match`; the priority
/// ordering between these states is a correctness requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine must produce handshake bytes: call wrap.
    NeedWrap,
    /// The engine must consume handshake bytes: call unwrap.
    NeedUnwrap,
    /// The engine needs delegated tasks run before it can continue.
    NeedTask,
    /// The call that returned this status just completed the handshake.
    /// Reported exactly once, on the completing wrap or unwrap result.
    Finished,
    /// No handshake is in progress.
    NotHandshaking,
}

/// Outcome of one wrap or unwrap call.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: Status,
    pub handshake: HandshakeStatus,
    /// Bytes written into the destination buffer.
    pub bytes_produced: usize,
    /// Bytes consumed from the source slice.
    pub bytes_consumed: usize,
}

/// Client-authentication requirement applied to a server-mode engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// Ask for a client certificate but continue without one.
    Request,
    /// Refuse the handshake if the client presents no certificate.
    Require,
}

/// The underlying blocking crypto engine, treated as an opaque state machine.
///
/// `wrap` and `unwrap` must write at most `dst.capacity() - dst.len()` bytes
/// and report [`Status::BufferOverflow`] rather than growing `dst`; buffer
/// growth policy belongs to the record layer.
pub trait CryptoEngine {
    fn set_client_mode(&mut self, client: bool);

    fn set_client_auth(&mut self, auth: ClientAuth);

    /// Restricts the enabled cipher suites. An invalid list is an error the
    /// caller records for later delivery instead of propagating.
    fn set_cipher_suites(&mut self, suites: &[String]) -> Result<(), EngineError>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Encrypts bytes from `src` into `dst`. May produce handshake records
    /// even when `src` is empty.
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, EngineError>;

    /// Decrypts records from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, EngineError>;

    /// Signals that no more outbound application data will be produced.
    fn close_outbound(&mut self);

    /// Signals that no more inbound data will arrive.
    fn close_inbound(&mut self) -> Result<(), EngineError>;

    /// Removes one pending delegated task, if any. Called repeatedly until
    /// `None` when the engine reports [`HandshakeStatus::NeedTask`].
    fn take_delegated_task(&mut self) -> Option<DelegatedTask>;

    /// The peer's certificate chain, once the session has one.
    fn peer_certificates(&self) -> Option<Vec<Certificate>>;

    /// Negotiated cipher suite name, once known.
    fn cipher_suite(&self) -> Option<String>;

    /// Negotiated protocol version name, once known.
    fn protocol(&self) -> Option<String>;

    /// Hint for sizing the record-layer scratch buffers.
    fn packet_buffer_size(&self) -> usize;
}

/// Factory for [`CryptoEngine`] instances.
pub trait CryptoContext {
    /// Creates an engine. `endpoint` carries the target server name and port
    /// for client-mode, name-based session setup.
    fn create_engine(&self, endpoint: Option<(&str, u16)>) -> Box<dyn CryptoEngine>;
}

/// Decides whether a peer's certificate chain is trusted.
///
/// Which check runs depends on the local role: servers verify clients and
/// clients verify servers.
pub trait TrustManager {
    fn check_client_trusted(&self, chain: &[Certificate]) -> Result<(), EngineError>;

    fn check_server_trusted(&self, chain: &[Certificate]) -> Result<(), EngineError>;
}
