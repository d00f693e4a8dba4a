//! authz-client-async: Non-blocking client for the authorization decision service
//!
//! This crate lets a single-threaded event loop ask the authorization service
//! whether a (client, session, user, privilege) tuple is allowed, without ever
//! blocking on the socket. Many checks are pipelined over one connection and
//! matched back to their callers by sequence number.
//!
//! # Features
//!
//! - **Decision cache**: LRU cache of earlier answers, consulted before the wire
//! - **Status callback**: Tells the caller's event loop which descriptor to watch
//!   and whether write readiness matters
//! - **Cancellation**: Any request can be cancelled until its callback fires
//! - **Exactly-once callbacks**: Every accepted request ends with exactly one
//!   terminal callback (answer, cancel, finish, or service not available)
//!
//! # Example
//!
//! ```rust,ignore
//! use authz_client_async::prelude::*;
//!
//! let config = Configuration::default().with_cache_size(1000);
//! let mut engine = AsyncEngine::initialize(config, |change: StatusChange| {
//!     // Re-register change.new_fd with the event loop
//!     println!("watch {:?} for {:?}", change.new_fd, change.status);
//! })?;
//!
//! let key = CheckKey::new("client", "session", "user", "privilege")?;
//! if let Some(result) = engine.check_cache(&key) {
//!     println!("cached: {}", result.policy_type);
//! } else {
//!     engine.create_request(key, |_engine, id, outcome| {
//!         println!("{id}: {:?}", outcome);
//!     })?;
//! }
//!
//! // From the event loop, whenever the descriptor is ready:
//! engine.process()?;
//! ```

pub mod cache;
pub mod config;
pub mod decision;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::io;
use thiserror::Error;

/// Errors returned by the client API
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("failed to connect to the authorization service: {0}")]
    ConnectionFailed(#[source] io::Error),

    #[error("connection to the authorization service lost: {0}")]
    ConnectionLost(String),

    #[error("request {0} not found")]
    NotFound(RequestId),

    #[error("engine is finishing")]
    Finishing,
}

// Re-export public types
pub use cache::DecisionCache;
pub use config::Configuration;
pub use decision::{CallCause, CheckKey, CheckKind, CheckResult, Outcome, PolicyType, MAX_ID_LENGTH};
pub use engine::{AsyncEngine, ResponseCallback};
pub use registry::RequestId;
pub use session::{ConnectStatus, Transport, UnixTransport};
pub use status::{Status, StatusChange};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Configuration;
    pub use crate::decision::{CallCause, CheckKey, CheckResult, Outcome, PolicyType};
    pub use crate::engine::AsyncEngine;
    pub use crate::registry::RequestId;
    pub use crate::status::{Status, StatusChange};
    pub use crate::Error;
}
