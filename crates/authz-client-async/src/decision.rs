//! Check keys and decision values
//!
//! A check is identified by the (client, session, user, privilege) tuple. The
//! service answers it with a policy type plus optional metadata and TTL, and the
//! engine reports every request's end through an [`Outcome`].

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::Error;

/// Longest accepted identifier, in bytes, for any field of a [`CheckKey`]
pub const MAX_ID_LENGTH: usize = 4096;

/// Identity of a single authorization check
///
/// All four fields are opaque byte sequences; equality is exact field-wise
/// comparison.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckKey {
    client: Bytes,
    session: Bytes,
    user: Bytes,
    privilege: Bytes,
}

impl CheckKey {
    /// Build a key, rejecting any field longer than [`MAX_ID_LENGTH`]
    pub fn new(
        client: impl Into<Bytes>,
        session: impl Into<Bytes>,
        user: impl Into<Bytes>,
        privilege: impl Into<Bytes>,
    ) -> Result<Self, Error> {
        let key = CheckKey {
            client: client.into(),
            session: session.into(),
            user: user.into(),
            privilege: privilege.into(),
        };
        for (name, field) in [
            ("client", &key.client),
            ("session", &key.session),
            ("user", &key.user),
            ("privilege", &key.privilege),
        ] {
            if field.len() > MAX_ID_LENGTH {
                return Err(Error::InvalidParam(format!(
                    "{name} is {} bytes, limit is {MAX_ID_LENGTH}",
                    field.len()
                )));
            }
        }
        Ok(key)
    }

    pub fn client(&self) -> &Bytes {
        &self.client
    }

    pub fn session(&self) -> &Bytes {
        &self.session
    }

    pub fn user(&self) -> &Bytes {
        &self.user
    }

    pub fn privilege(&self) -> &Bytes {
        &self.privilege
    }

    /// Lowercase hex SHA-256 over all fields, used instead of raw ids in logs
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for field in [&self.client, &self.session, &self.user, &self.privilege] {
            // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        base16ct::lower::encode_string(&hasher.finalize())
    }
}

/// Policy type as reported by the service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolicyType(pub u16);

impl PolicyType {
    pub const DENY: PolicyType = PolicyType(0);
    pub const NONE: PolicyType = PolicyType(1);
    pub const BUCKET: PolicyType = PolicyType(0xFFFE);
    pub const ALLOW: PolicyType = PolicyType(0xFFFF);
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PolicyType::DENY => f.write_str("DENY"),
            PolicyType::NONE => f.write_str("NONE"),
            PolicyType::BUCKET => f.write_str("BUCKET"),
            PolicyType::ALLOW => f.write_str("ALLOW"),
            PolicyType(other) => write!(f, "0x{other:04x}"),
        }
    }
}

/// Decision returned by the service, cached verbatim
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    /// Decision outcome
    pub policy_type: PolicyType,
    /// Optional policy metadata (e.g. a policy token)
    pub metadata: Option<String>,
    /// How long the decision may be reused from the cache
    pub ttl: Option<Duration>,
}

impl CheckResult {
    /// Create an ALLOW result without metadata
    pub fn allow() -> Self {
        Self::new(PolicyType::ALLOW)
    }

    /// Create a DENY result without metadata
    pub fn deny() -> Self {
        Self::new(PolicyType::DENY)
    }

    pub fn new(policy_type: PolicyType) -> Self {
        CheckResult {
            policy_type,
            metadata: None,
            ttl: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Check if the decision allows the operation
    pub fn is_allowed(&self) -> bool {
        self.policy_type == PolicyType::ALLOW
    }
}

/// Flavour of a check request on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckKind {
    /// Full policy evaluation, possibly involving interactive steps on the service side
    Full,
    /// Single round trip; the service collapses interactive outcomes to a direct answer
    Simple,
}

/// Reason a response callback fired
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallCause {
    Answer,
    Cancel,
    Finish,
    ServiceNotAvailable,
}

/// Terminal outcome of a request, delivered exactly once
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The service (or the decision cache) answered
    Answer(CheckResult),
    /// The caller cancelled the request
    Cancel,
    /// The engine was torn down
    Finish,
    /// The connection to the service was lost
    ServiceNotAvailable,
}

impl Outcome {
    pub fn cause(&self) -> CallCause {
        match self {
            Outcome::Answer(_) => CallCause::Answer,
            Outcome::Cancel => CallCause::Cancel,
            Outcome::Finish => CallCause::Finish,
            Outcome::ServiceNotAvailable => CallCause::ServiceNotAvailable,
        }
    }

    /// The result, only present for [`CallCause::Answer`]
    pub fn result(&self) -> Option<&CheckResult> {
        match self {
            Outcome::Answer(result) => Some(result),
            _ => None,
        }
    }

    /// Outcome carrying no payload for the given cause
    ///
    /// Returns `None` for [`CallCause::Answer`], which always needs a result.
    pub fn without_result(cause: CallCause) -> Option<Self> {
        match cause {
            CallCause::Answer => None,
            CallCause::Cancel => Some(Outcome::Cancel),
            CallCause::Finish => Some(Outcome::Finish),
            CallCause::ServiceNotAvailable => Some(Outcome::ServiceNotAvailable),
        }
    }
}
