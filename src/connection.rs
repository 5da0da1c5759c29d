//! The non-blocking record layer around a blocking crypto engine, including
//! all the looping and wrapping and unwrapping.

use crate::buffer::{cat_buffers, double_buffer};
use crate::chunk::{Chunk, ChunkCallback};
use crate::engine::{
    ClientAuth, CryptoContext, CryptoEngine, HandshakeStatus, Status, TrustManager,
};
use crate::runtime::{Domain, ScriptScheduler, TaskCompletion, TaskRunner};
use crate::{EngineError, TlsError};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use tokio_rustls::rustls::Certificate;

/// Handshake role of this side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Construction parameters for a [`TlsConnection`].
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub role: Role,
    /// Ask the peer for a certificate (client authentication).
    pub request_cert: bool,
    /// Refuse the handshake when a requested certificate is missing.
    pub reject_unauthorized: bool,
    /// Target server name for client-mode, name-based session setup.
    pub server_name: Option<String>,
    pub server_port: u16,
    /// Restrict the enabled cipher suites. An invalid list is recorded as a
    /// verify error instead of failing construction.
    pub cipher_suites: Option<Vec<String>>,
}

impl TlsConfig {
    pub fn new(role: Role) -> Self {
        TlsConfig {
            role,
            request_cert: false,
            reject_unauthorized: false,
            server_name: None,
            server_port: 0,
            cipher_suites: None,
        }
    }
}

/// Receives ciphertext produced by the engine, the outbound-shutdown flag,
/// and the completion callback of the chunk that produced it (to be fired
/// once the ciphertext has actually been written out).
pub type WriteCallback = Box<dyn FnMut(Option<Bytes>, bool, Option<ChunkCallback>)>;

/// Receives decrypted plaintext and the inbound-shutdown (EOF) flag.
pub type ReadCallback = Box<dyn FnMut(Option<Bytes>, bool)>;

/// A TLS connection that never blocks.
///
/// All state is mutated exclusively from one logical thread (the script
/// thread) and there is no internal locking; do not call `wrap`/`unwrap`/
/// `shutdown` concurrently. The one cross-thread interaction is the
/// delegated-task handoff, which re-enters the loop only through
/// [`TlsConnection::resume_tasks`].
pub struct TlsConnection {
    engine: Box<dyn CryptoEngine>,
    trust_manager: Option<Arc<dyn TrustManager>>,
    pool: Arc<dyn TaskRunner>,
    scheduler: Arc<dyn ScriptScheduler>,
    domain: Option<Domain>,

    is_server: bool,
    request_cert: bool,

    outgoing: VecDeque<Chunk>,
    incoming: VecDeque<Chunk>,
    write_buf: BytesMut,
    read_buf: BytesMut,

    handshaking: bool,
    init_finished: bool,
    sent_shutdown: bool,
    received_shutdown: bool,

    error: Option<TlsError>,
    verify_error: Option<TlsError>,

    write_callback: Option<WriteCallback>,
    read_callback: Option<ReadCallback>,
    on_handshake_start: Option<Box<dyn FnMut()>>,
    on_handshake_done: Option<Box<dyn FnMut()>>,
    on_error: Option<Box<dyn FnMut(TlsError)>>,
}

impl TlsConnection {
    /// Builds a connection. Never fails: configuration problems (such as an
    /// invalid cipher suite list) are recorded and surface through the
    /// handshake-error channel on the first handshake attempt.
    pub fn new(
        config: TlsConfig,
        context: &dyn CryptoContext,
        trust_manager: Option<Arc<dyn TrustManager>>,
        pool: Arc<dyn TaskRunner>,
        scheduler: Arc<dyn ScriptScheduler>,
    ) -> Self {
        let is_server = config.role == Role::Server;

        let endpoint = if is_server {
            None
        } else {
            config
                .server_name
                .as_deref()
                .map(|name| (name, config.server_port))
        };
        let mut engine = context.create_engine(endpoint);

        engine.set_client_mode(!is_server);
        if config.request_cert {
            if config.reject_unauthorized {
                engine.set_client_auth(ClientAuth::Require);
            } else {
                engine.set_client_auth(ClientAuth::Request);
            }
        }

        let buf_size = engine.packet_buffer_size();
        debug!("allocating read and write buffers of size {buf_size}");

        let mut conn = TlsConnection {
            engine,
            trust_manager,
            pool,
            scheduler,
            domain: None,
            is_server,
            request_cert: config.request_cert,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            write_buf: BytesMut::with_capacity(buf_size),
            read_buf: BytesMut::with_capacity(buf_size),
            handshaking: false,
            init_finished: false,
            sent_shutdown: false,
            received_shutdown: false,
            error: None,
            verify_error: None,
            write_callback: None,
            read_callback: None,
            on_handshake_start: None,
            on_handshake_done: None,
            on_error: None,
        };

        // Applied last: the rest of initialization must succeed so the caller
        // has one uniform place to observe this failure later.
        if let Some(suites) = &config.cipher_suites {
            debug!("setting cipher suites {suites:?}");
            if let Err(err) = conn.engine.set_cipher_suites(suites) {
                conn.verify_error = Some(TlsError::InvalidCipherSuites(err.to_string()));
            }
        }

        conn
    }

    pub fn set_write_callback(&mut self, cb: WriteCallback) {
        self.write_callback = Some(cb);
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_callback = Some(cb);
    }

    pub fn set_handshake_start_callback(&mut self, cb: Box<dyn FnMut()>) {
        self.on_handshake_start = Some(cb);
    }

    pub fn set_handshake_done_callback(&mut self, cb: Box<dyn FnMut()>) {
        self.on_handshake_done = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: Box<dyn FnMut(TlsError)>) {
        self.on_error = Some(cb);
    }

    /// Caller context attached to delegated-task continuations.
    pub fn set_domain(&mut self, domain: Option<Domain>) {
        self.domain = domain;
    }

    pub fn error(&self) -> Option<&TlsError> {
        self.error.as_ref()
    }

    pub fn verify_error(&self) -> Option<&TlsError> {
        self.verify_error.as_ref()
    }

    pub fn is_init_finished(&self) -> bool {
        self.init_finished
    }

    pub fn is_sent_shutdown(&self) -> bool {
        self.sent_shutdown
    }

    pub fn is_received_shutdown(&self) -> bool {
        self.received_shutdown
    }

    /// Head of the peer's certificate chain, if the session has one.
    pub fn peer_certificate(&self) -> Option<Certificate> {
        self.engine.peer_certificates()?.into_iter().next()
    }

    pub fn cipher_suite(&self) -> Option<String> {
        self.engine.cipher_suite()
    }

    pub fn protocol(&self) -> Option<String> {
        self.engine.protocol()
    }

    /// Enqueues outbound plaintext to encrypt. `data` may be `None` or empty
    /// to flush pending handshake bytes.
    pub fn wrap(&mut self, data: Option<BytesMut>, callback: Option<ChunkCallback>) {
        self.outgoing.push_back(Chunk::new(data, false, callback));
        self.encode_loop();
    }

    /// Enqueues a request to close the outbound direction after draining.
    pub fn shutdown(&mut self, callback: Option<ChunkCallback>) {
        self.outgoing.push_back(Chunk::new(None, true, callback));
        self.encode_loop();
    }

    /// Closes the inbound direction immediately (nothing is queued), then
    /// forces one unwrap pass so the peer's EOF is observed, and re-runs the
    /// loop because we still want to wrap in this case.
    pub fn shutdown_inbound(&mut self, callback: Option<ChunkCallback>) {
        if let Err(err) = self.engine.close_inbound() {
            debug!("error closing inbound engine: {err}");
        }
        if let Some(cb) = callback {
            cb(Ok(()));
        }
        self.do_unwrap();
        self.encode_loop();
    }

    /// Enqueues inbound ciphertext to decrypt.
    pub fn unwrap(&mut self, data: BytesMut, callback: Option<ChunkCallback>) {
        self.incoming.push_back(Chunk::new(Some(data), false, callback));
        self.encode_loop();
    }

    /// Begins the handshake. Clients eagerly queue an empty wrap; servers
    /// wait passively for the first unwrap.
    pub fn start(&mut self) {
        if !self.is_server {
            self.wrap(None, None);
        }
    }

    /// Re-enters the encode loop after a delegated-task batch has finished.
    ///
    /// The embedder calls this on the script thread with the token its
    /// [`ScriptScheduler`] delivered. Each token resumes the loop once.
    pub fn resume_tasks(&mut self, _done: TaskCompletion) {
        self.encode_loop();
    }

    /// Runs the engine to a fixed point: services whichever direction the
    /// handshake state machine mandates first, then drains both queues until
    /// a step declines to make progress.
    fn encode_loop(&mut self) {
        loop {
            let status = self.engine.handshake_status();
            trace!(
                "engine status: {:?} incoming: {} outgoing: {}",
                status,
                self.incoming.len(),
                self.outgoing.len()
            );
            match status {
                HandshakeStatus::NeedWrap => {
                    // Always wrap, even if we have nothing to wrap
                    self.process_handshaking();
                    if !self.do_wrap() {
                        return;
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    self.process_handshaking();
                    if !self.do_unwrap() {
                        return;
                    }
                }
                HandshakeStatus::NeedTask => {
                    self.process_tasks();
                    return;
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    if self.outgoing.is_empty() && self.incoming.is_empty() {
                        return;
                    }
                    if !self.outgoing.is_empty() && !self.do_wrap() {
                        return;
                    }
                    if !self.incoming.is_empty() && !self.do_unwrap() {
                        return;
                    }
                }
            }
        }
    }

    /// Wraps whatever is at the head of the outgoing queue. Returns false if
    /// further processing should stop.
    fn do_wrap(&mut self) -> bool {
        let mut was_shutdown = false;
        if let Some(chunk) = self.outgoing.front() {
            if chunk.is_shutdown() {
                was_shutdown = true;
                // Signalled at most once, no matter how many times the
                // shutdown chunk is retried or re-queued.
                if !self.sent_shutdown {
                    trace!("sending close_outbound");
                    self.engine.close_outbound();
                    self.sent_shutdown = true;
                }
            }
        }

        let result = loop {
            // If we get here we call wrap, even if there is nothing to wrap.
            let res = {
                let src = self.outgoing.front().map(Chunk::data).unwrap_or(&[]);
                trace!("wrapping {} bytes", src.len());
                self.engine.wrap(src, &mut self.write_buf)
            };

            let res = match res {
                Ok(res) => res,
                Err(err) => {
                    let cb = self
                        .outgoing
                        .pop_front()
                        .and_then(|mut chunk| chunk.take_callback());
                    self.handle_encoding_error(cb, err);
                    return false;
                }
            };
            trace!("wrap result: {res:?}");

            if res.status == Status::BufferOverflow {
                // Retry the same call with more space; nothing was written.
                self.write_buf = double_buffer(mem::take(&mut self.write_buf));
                continue;
            }

            if res.bytes_consumed > 0 {
                if let Some(chunk) = self.outgoing.front_mut() {
                    chunk.advance(res.bytes_consumed);
                }
            }
            break res;
        };

        let mut cb = None;
        if self.init_finished && self.outgoing.front().is_some_and(Chunk::is_drained) {
            // Finished processing the current chunk, but don't deliver the
            // callback until the handshake is done in case the peer ended
            // before sending any data.
            let mut chunk = self.outgoing.pop_front().unwrap();
            cb = chunk.take_callback();
        }

        if result.handshake == HandshakeStatus::Finished {
            // This only gets delivered once, and we can't check for it later
            self.process_not_handshaking();
        }

        if result.bytes_produced > 0 {
            self.deliver_write_buffer(was_shutdown, cb);
        } else if let Some(cb) = cb {
            cb(Ok(()));
        }

        result.status == Status::Ok
    }

    /// Unwraps whatever is at the head of the incoming queue. Returns false
    /// if further processing should stop.
    fn do_unwrap(&mut self) -> bool {
        let result = loop {
            let res = {
                let src = self.incoming.front().map(Chunk::data).unwrap_or(&[]);
                trace!("unwrapping {} bytes", src.len());
                self.engine.unwrap(src, &mut self.read_buf)
            };

            let res = match res {
                Ok(res) => res,
                Err(err) => {
                    let cb = self
                        .incoming
                        .front_mut()
                        .and_then(Chunk::take_callback);
                    self.handle_encoding_error(cb, err);
                    return false;
                }
            };
            trace!("unwrap result: {res:?}");

            if res.status == Status::BufferOverflow {
                // Retry with more space in the output buffer
                self.read_buf = double_buffer(mem::take(&mut self.read_buf));
                continue;
            }

            if res.bytes_consumed > 0 {
                if let Some(chunk) = self.incoming.front_mut() {
                    chunk.advance(res.bytes_consumed);
                }
            }

            if res.status == Status::BufferUnderflow && !self.incoming.is_empty() {
                // Deliver the callback so that we get some more data.
                if let Some(cb) = self.incoming.front_mut().unwrap().take_callback() {
                    cb(Ok(()));
                }

                // Combine the first two chunks on the queue if they exist,
                // then try again with the complete record.
                if self.incoming.len() >= 2 {
                    let mut first = self.incoming.pop_front().unwrap();
                    let head = self.incoming.front_mut().unwrap();
                    let merged = cat_buffers(first.take_data(), head.take_data());
                    head.set_data(merged);
                    continue;
                }
            }
            break res;
        };

        let mut deliver_shutdown = false;
        if result.status == Status::Closed && !self.received_shutdown {
            self.received_shutdown = true;
            deliver_shutdown = true;
        }

        if self.incoming.front().is_some_and(Chunk::is_drained) {
            // Deliver the callback right now, because we are ready to consume
            // more data right now.
            let mut chunk = self.incoming.pop_front().unwrap();
            if let Some(cb) = chunk.take_callback() {
                cb(Ok(()));
            }
        }

        if result.handshake == HandshakeStatus::Finished {
            self.process_not_handshaking();
        }

        if result.bytes_produced > 0 || deliver_shutdown {
            self.deliver_read_buffer(deliver_shutdown);
        }

        result.status == Status::Ok
    }

    fn deliver_write_buffer(&mut self, shutdown: bool, cb: Option<ChunkCallback>) {
        if let Some(write_callback) = self.write_callback.as_mut() {
            let ciphertext = if self.write_buf.is_empty() {
                None
            } else {
                let bytes = self.write_buf.split().freeze();
                trace!(
                    "delivering {} bytes to the write callback, shutdown = {shutdown}",
                    bytes.len()
                );
                Some(bytes)
            };
            write_callback(ciphertext, shutdown, cb);
        } else {
            self.write_buf.clear();
            if let Some(cb) = cb {
                cb(Ok(()));
            }
        }
    }

    fn deliver_read_buffer(&mut self, shutdown: bool) {
        if let Some(read_callback) = self.read_callback.as_mut() {
            let plaintext = if self.read_buf.is_empty() {
                None
            } else {
                let bytes = self.read_buf.split().freeze();
                trace!(
                    "delivering {} bytes to the read callback, shutdown = {shutdown}",
                    bytes.len()
                );
                Some(bytes)
            };
            read_callback(plaintext, shutdown);
        } else {
            self.read_buf.clear();
        }
    }

    fn process_handshaking(&mut self) {
        if !self.handshaking && !self.sent_shutdown && !self.received_shutdown {
            self.handshaking = true;
            if let Some(cb) = self.on_handshake_start.as_mut() {
                cb();
            }
        }
    }

    /// Handshake completion. Runs exactly once per handshake: verifies the
    /// peer, then fires either the done callback or the error callback (never
    /// both; a verification failure suppresses the done signal).
    fn process_not_handshaking(&mut self) {
        if !self.handshaking {
            return;
        }
        self.check_peer_authorization();
        self.handshaking = false;
        self.init_finished = true;

        match self.verify_error.clone() {
            Some(err) => self.fire_error(err),
            None => {
                if let Some(cb) = self.on_handshake_done.as_mut() {
                    cb();
                }
            }
        }
    }

    /// Runs tasks that would block the engine in the worker pool, so that the
    /// script thread can keep on trucking. The loop resumes when the
    /// completion token comes back through the scheduler.
    fn process_tasks(&mut self) {
        let mut tasks = Vec::new();
        while let Some(task) = self.engine.take_delegated_task() {
            tasks.push(task);
        }
        trace!("submitting {} delegated tasks", tasks.len());

        let scheduler = Arc::clone(&self.scheduler);
        let domain = self.domain.clone();
        self.pool.submit(Box::new(move || {
            for task in tasks {
                task();
            }
            // Back to the script thread to keep running with the result.
            scheduler.enqueue(TaskCompletion::new(), domain);
        }));
    }

    /// Records a failure that is not tied to a specific queued chunk.
    fn handle_error(&mut self, err: TlsError) {
        debug!("TLS error: handshaking = {}: {err}", self.handshaking);
        if self.handshaking {
            self.verify_error = Some(err);
        } else {
            self.error = Some(err);
        }
    }

    /// Records a wrap/unwrap failure and routes it to the chunk's callback or
    /// the error callback, depending on whether the handshake has completed.
    fn handle_encoding_error(&mut self, cb: Option<ChunkCallback>, err: EngineError) {
        {
            let cause: &(dyn std::error::Error + 'static) = err.as_ref();
            debug!("TLS encoding error: {err} (root cause: {})", crate::root_cause(cause));
        }
        let err = TlsError::engine(err);

        self.error = Some(err.clone());
        if !self.init_finished {
            // Before the handshake completes there is no chunk to blame, so
            // this always becomes an error event.
            self.verify_error = Some(err.clone());
            self.fire_error(err);
        } else if let Some(cb) = cb {
            cb(Err(err));
        } else {
            self.fire_error(err);
        }
    }

    fn fire_error(&mut self, err: TlsError) {
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(err);
        }
    }

    /// Checks for peer verification errors, including those that require us
    /// to check manually and report back rather than just failing the
    /// handshake outright.
    fn check_peer_authorization(&mut self) {
        let chain = match self.engine.peer_certificates() {
            Some(chain) if !chain.is_empty() => chain,
            _ => {
                debug!("peer has no certificates");
                if !self.is_server || self.request_cert {
                    self.handle_error(TlsError::PeerUnverified);
                }
                return;
            }
        };

        let Some(trust_manager) = self.trust_manager.clone() else {
            self.handle_error(TlsError::NoTrustStore);
            return;
        };

        let checked = if self.is_server {
            trust_manager.check_client_trusted(&chain)
        } else {
            trust_manager.check_server_trusted(&chain)
        };
        match checked {
            Ok(()) => debug!("TLS peer is valid"),
            Err(err) => {
                debug!("error verifying TLS peer: {err}");
                self.handle_error(TlsError::untrusted(err));
            }
        }
    }
}
