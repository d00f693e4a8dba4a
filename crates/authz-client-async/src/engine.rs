//! Request orchestration
//!
//! [`AsyncEngine`] ties the decision cache, the request registry and the wire
//! session together behind the public API. It never blocks and never spawns:
//! the host's event loop calls [`AsyncEngine::process`] whenever the descriptor
//! from the latest [`StatusChange`] is ready, and every response callback runs
//! inside one of the engine's own calls.
//!
//! # Delivery rules
//!
//! - Every accepted request gets exactly one terminal callback.
//! - Callbacks never run before `create_request` has returned the request's id.
//!   Cache hits are delivered on the next `process`; the status switches to
//!   [`Status::ForReadWrite`] so the host calls it promptly. A hit still needs
//!   a connection to report: with the service unreachable, submission fails
//!   with [`Error::ConnectionFailed`] like any other.
//! - `cancel_request` runs the callback with [`Outcome::Cancel`] before
//!   returning. A late answer from the service is not delivered.
//! - Callbacks receive the engine and may create, cancel, or check the cache.
//!   The request is already retired when its callback runs.

use std::fmt;
use std::os::fd::RawFd;
use tracing::{debug, info, warn};

use crate::cache::DecisionCache;
use crate::config::Configuration;
use crate::decision::{CallCause, CheckKey, CheckKind, CheckResult, Outcome};
use crate::protocol::{Request, Response};
use crate::registry::{Cancellation, Registry, RequestId, RequestState, Resolution, Retired};
use crate::session::{Transport, UnixTransport, WireSession};
use crate::status::{Status, StatusChange, StatusNotifier};
use crate::Error;

/// Terminal callback of a request
pub type ResponseCallback<T> = Box<dyn FnOnce(&mut AsyncEngine<T>, RequestId, Outcome)>;

/// Non-blocking client engine
pub struct AsyncEngine<T: Transport> {
    config: Configuration,
    cache: DecisionCache,
    registry: Registry<ResponseCallback<T>>,
    session: WireSession<T>,
    notifier: StatusNotifier,
    /// Set once teardown starts; new requests are refused from then on
    finishing: bool,
}

impl AsyncEngine<UnixTransport> {
    /// Create an engine connected to the service socket at `config.socket_path`
    ///
    /// The status callback runs once before this returns, with the descriptor
    /// to watch and the initial readiness.
    pub fn initialize(
        config: Configuration,
        status_callback: impl FnMut(StatusChange) + 'static,
    ) -> Result<Self, Error> {
        let transport = UnixTransport::new(config.socket_path.clone());
        Self::with_transport(config, transport, status_callback)
    }
}

impl<T: Transport> AsyncEngine<T> {
    /// Create an engine over an arbitrary transport
    pub fn with_transport(
        config: Configuration,
        transport: T,
        status_callback: impl FnMut(StatusChange) + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;

        let mut session = WireSession::new(transport, &config);
        session.connect()?;

        let mut engine = Self {
            cache: DecisionCache::new(config.cache_size),
            registry: Registry::new(),
            session,
            notifier: StatusNotifier::new(status_callback),
            finishing: false,
            config,
        };
        engine.update_status();
        info!(
            cache_size = engine.config.cache_size,
            socket = %engine.config.socket_path.display(),
            "authorization client initialized"
        );
        Ok(engine)
    }

    /// Retire everything with [`Outcome::Finish`] and close the connection
    ///
    /// Dropping the engine does the same.
    pub fn finish(mut self) {
        self.shutdown();
    }

    /// Look a decision up in the local cache only
    pub fn check_cache(&mut self, key: &CheckKey) -> Option<CheckResult> {
        self.cache.lookup(key)
    }

    /// Submit a full check
    pub fn create_request<F>(&mut self, key: CheckKey, callback: F) -> Result<RequestId, Error>
    where
        F: FnOnce(&mut AsyncEngine<T>, RequestId, Outcome) + 'static,
    {
        self.submit(key, CheckKind::Full, Box::new(callback))
    }

    /// Submit a check the service answers without interactive steps
    pub fn create_simple_request<F>(&mut self, key: CheckKey, callback: F) -> Result<RequestId, Error>
    where
        F: FnOnce(&mut AsyncEngine<T>, RequestId, Outcome) + 'static,
    {
        self.submit(key, CheckKind::Simple, Box::new(callback))
    }

    /// Cancel a request whose callback has not run yet
    ///
    /// The callback runs with [`Outcome::Cancel`] before this returns.
    /// Returns [`Error::NotFound`] if the request already retired.
    pub fn cancel_request(&mut self, id: RequestId) -> Result<(), Error> {
        let Cancellation {
            retired,
            wire_cancel,
        } = self.registry.cancel(id)?;
        if let Some(seq) = wire_cancel {
            self.session.enqueue(&Request::Cancel { seq });
        }
        debug!(request = %id, on_wire = wire_cancel.is_some(), "request cancelled");
        self.dispatch(retired);
        self.update_status();
        Ok(())
    }

    /// Drive I/O: deliver cached answers, complete a pending connect, write
    /// queued requests, read and dispatch responses
    ///
    /// Connection loss is not an error here; the affected requests retire with
    /// [`Outcome::ServiceNotAvailable`]. An error is returned only when a
    /// reconnect cannot be started or the engine is being torn down.
    pub fn process(&mut self) -> Result<(), Error> {
        if self.finishing {
            return Err(Error::Finishing);
        }
        self.deliver_ready();
        let result = self.drive_connection();
        self.update_status();
        result
    }

    /// Readiness most recently reported through the status callback
    pub fn status(&self) -> Option<Status> {
        self.notifier.current()
    }

    /// Descriptor of the current connection
    pub fn fd(&self) -> Option<RawFd> {
        self.session.raw_fd()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Requests still waiting for their callback
    pub fn pending_requests(&self) -> usize {
        self.registry.outstanding()
    }

    pub fn request_state(&self, id: RequestId) -> Option<&RequestState> {
        self.registry.state(id)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn submit(
        &mut self,
        key: CheckKey,
        kind: CheckKind,
        callback: ResponseCallback<T>,
    ) -> Result<RequestId, Error> {
        if self.finishing {
            return Err(Error::Finishing);
        }

        // Even a cache hit needs a descriptor for the host to wake up on.
        if self.session.is_disconnected() {
            self.session.connect()?;
        }

        if let Some(result) = self.cache.lookup(&key) {
            debug!(key_digest = %key.digest(), ?kind, "answered from cache");
            let id = self.registry.register_ready(key, kind, callback, result)?;
            self.update_status();
            return Ok(id);
        }

        debug!(key_digest = %key.digest(), ?kind, "request queued");
        let id = self.registry.register(key, kind, callback)?;
        if self.session.is_connected() {
            self.send(id);
        }
        self.update_status();
        Ok(id)
    }

    /// Serialize a queued request into the session's output buffer
    fn send(&mut self, id: RequestId) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        let request = Request::Check {
            seq: id.seq(),
            kind: entry.kind(),
            key: entry.key().clone(),
        };
        if self.registry.mark_sent(id).is_ok() {
            self.session.enqueue(&request);
        }
    }

    fn send_queued(&mut self) {
        for id in self.registry.queued() {
            self.send(id);
        }
    }

    fn drive_connection(&mut self) -> Result<(), Error> {
        let was_connected = self.session.is_connected();
        if self.session.is_disconnected() {
            self.session.connect()?;
        }
        match self.session.complete_connect() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                self.connection_lost(err);
                return Ok(());
            }
        }
        if !was_connected {
            self.send_queued();
        }

        if let Err(err) = self.session.flush() {
            self.connection_lost(err);
            return Ok(());
        }
        self.read_responses();

        // Callbacks may have queued more output.
        if let Err(err) = self.session.flush() {
            self.connection_lost(err);
        }
        Ok(())
    }

    fn read_responses(&mut self) {
        let epoch = self.session.epoch();
        let inbound = self.session.try_read();
        for response in inbound.responses {
            if self.session.epoch() != epoch {
                debug!("connection replaced, dropping responses read from the old one");
                return;
            }
            self.handle_response(response);
        }
        if let Some(err) = inbound.lost {
            if self.session.epoch() == epoch {
                self.connection_lost(err);
            }
        }
    }

    fn handle_response(&mut self, response: Response) {
        match response {
            Response::Check { seq, kind, result } => match self.registry.resolve(seq, kind, result) {
                Resolution::Delivered(retired) => {
                    // Cached first, so the callback already sees it.
                    if let Some(result) = retired.outcome.result() {
                        self.cache.insert(retired.key.clone(), result.clone());
                    }
                    self.dispatch(retired);
                }
                Resolution::Dropped { key, result } => self.cache.insert(key, result),
                // The rest of this read belongs to the dropped connection.
                Resolution::KindMismatch { expected, got } => {
                    self.connection_lost(Error::ConnectionLost(format!(
                        "protocol error: {got:?} answer for {expected:?} check {seq}"
                    )));
                }
                Resolution::Unknown => {}
            },
            Response::Cancel { seq } => {
                self.registry.acknowledge_cancel(seq);
            }
        }
    }

    fn deliver_ready(&mut self) {
        if !self.registry.has_ready() {
            return;
        }
        for retired in self.registry.take_ready() {
            self.dispatch(retired);
        }
    }

    /// Retire everything tied to the dropped connection
    ///
    /// Cached answers still go out as answers. The whole batch is taken from
    /// the registry before any callback runs, so requests created by those
    /// callbacks are not swept up with it.
    fn connection_lost(&mut self, err: Error) {
        warn!(
            error = %err,
            outstanding = self.registry.outstanding(),
            "connection to authorization service lost"
        );
        let ready = self.registry.take_ready();
        let failed = self.registry.retire_all(CallCause::ServiceNotAvailable);
        self.session.disconnect();
        self.update_status();
        for retired in ready.into_iter().chain(failed) {
            self.dispatch(retired);
        }
    }

    fn dispatch(&mut self, retired: Retired<ResponseCallback<T>>) {
        let Retired {
            id,
            callback,
            outcome,
            ..
        } = retired;
        debug!(request = %id, cause = ?outcome.cause(), "delivering response");
        callback(self, id, outcome);
    }

    fn update_status(&mut self) {
        if self.finishing {
            return;
        }
        let status = if self.session.wants_write() || self.registry.has_ready() {
            Status::ForReadWrite
        } else {
            Status::ForRead
        };
        self.notifier.update(self.session.raw_fd(), status);
    }

    fn shutdown(&mut self) {
        if self.finishing {
            return;
        }
        self.finishing = true;
        let retired = self.registry.retire_all(CallCause::Finish);
        info!(outstanding = retired.len(), "authorization client finishing");
        for retired in retired {
            self.dispatch(retired);
        }
        self.session.disconnect();
        self.notifier.update(None, Status::ForRead);
    }
}

impl<T: Transport> Drop for AsyncEngine<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport + fmt::Debug> fmt::Debug for AsyncEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEngine")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("outstanding", &self.registry.outstanding())
            .field("session", &self.session)
            .field("notifier", &self.notifier)
            .field("finishing", &self.finishing)
            .finish()
    }
}
