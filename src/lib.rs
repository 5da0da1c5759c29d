//! # Welcome to tls-record
//!
//! A non-blocking TLS record layer: drives a blocking, handshake-oriented
//! crypto engine from a single-threaded, callback-driven runtime without
//! ever blocking the calling thread.
//!
//! The central type is [`TlsConnection`]. Callers enqueue outbound plaintext
//! with [`TlsConnection::wrap`] and inbound ciphertext with
//! [`TlsConnection::unwrap`]; ciphertext and plaintext come back through
//! registered callbacks once the internal encode loop has pushed them through
//! the underlying [`CryptoEngine`]. CPU-bound handshake work is offloaded to a
//! [`TaskRunner`] and marshalled back onto the script thread through a
//! [`ScriptScheduler`], so the connection's state is only ever touched from
//! one thread.

mod buffer;
mod chunk;
mod connection;
mod engine;
mod flow;
mod runtime;


use std::sync::Arc;
use thiserror::Error;

pub use buffer::{cat_buffers, double_buffer, duplicate_buffer, zero_buffer};
pub use chunk::{Chunk, ChunkCallback};
pub use connection::{ReadCallback, Role, TlsConfig, TlsConnection, WriteCallback};
pub use engine::{
    ClientAuth, CryptoContext, CryptoEngine, DelegatedTask, EngineResult, HandshakeStatus, Status,
    TrustManager,
};
pub use flow::{FlowControl, PauseHelper};
pub use runtime::{
    ChannelScheduler, Domain, ScriptScheduler, SpawnBlockingPool, TaskCompletion, TaskRunner,
};

/// Errors produced by the underlying crypto engine or the trust manager.
///
/// Boxed so engine implementations can surface whatever error type their
/// crypto library uses.
pub type EngineError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A terminal TLS failure, recorded on the connection and delivered through
/// the error callback or a chunk's completion callback.
///
/// Cloneable so the same error can be stored for later inspection and
/// delivered to a callback.
#[derive(Error, Debug, Clone)]
pub enum TlsError {
    /// The underlying engine failed while wrapping or unwrapping a record.
    #[error("TLS engine error: {0}")]
    Engine(Arc<EngineError>),

    /// The peer presented no certificate chain, but one was required.
    #[error("peer has no certificates")]
    PeerUnverified,

    /// The trust manager rejected the peer's certificate chain.
    #[error("peer certificate rejected: {0}")]
    Untrusted(Arc<EngineError>),

    /// No trust manager was configured, so the peer cannot be verified.
    #[error("no trusted CAs configured")]
    NoTrustStore,

    /// The cipher suite list requested at construction was invalid.
    #[error("invalid cipher suite list: {0}")]
    InvalidCipherSuites(String),
}

impl TlsError {
    pub(crate) fn engine(err: EngineError) -> Self {
        TlsError::Engine(Arc::new(err))
    }

    pub(crate) fn untrusted(err: EngineError) -> Self {
        TlsError::Untrusted(Arc::new(err))
    }
}

/// Walks the source chain down to the innermost cause.
///
/// Diagnostic only: the error is recorded as-is, but logs show the root.
pub(crate) fn root_cause<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> &'a (dyn std::error::Error + 'static) {
    let mut cause = err;
    while let Some(source) = cause.source() {
        cause = source;
    }
    cause
}
