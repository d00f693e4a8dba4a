//! In-flight request registry
//!
//! Every accepted request lives here until it retires. Each request has a slot
//! indexed by its wire sequence number. A slot's generation grows each time the
//! slot is freed, so a [`RequestId`] from an earlier generation can never name a
//! newer request.
//!
//! Retiring a request always removes its entry *before* the callback is handed
//! back to the caller, which is what makes terminal delivery exactly-once: the
//! callback is moved out of the registry in the same step that forgets the
//! request.

use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use crate::decision::{CallCause, CheckKey, CheckKind, CheckResult, Outcome};
use crate::protocol::Sequence;
use crate::Error;

/// Number of distinct wire sequence numbers
const SLOT_COUNT: usize = Sequence::MAX as usize + 1;

/// Caller-visible handle of a submitted check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    seq: Sequence,
    generation: u32,
}

impl RequestId {
    /// Wire sequence number the request travels under
    pub fn seq(&self) -> Sequence {
        self.seq
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seq, self.generation)
    }
}

/// Lifecycle state of a registered request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Accepted, not yet handed to the wire session
    Queued,
    /// Answered from the decision cache, waiting for the next delivery point
    Ready(CheckResult),
    /// Written to the wire session, awaiting the service's answer
    Sent,
    /// Cancelled after being sent; the callback already fired and the slot is
    /// held until the service's terminal frame for it arrives
    Cancelled,
}

/// A registered request
#[derive(Debug)]
pub struct PendingRequest<C> {
    id: RequestId,
    key: CheckKey,
    kind: CheckKind,
    /// Present until the terminal callback is handed out
    callback: Option<C>,
    submission: u64,
    state: RequestState,
}

impl<C> PendingRequest<C> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &CheckKey {
        &self.key
    }

    pub fn kind(&self) -> CheckKind {
        self.kind
    }

    /// Order in which the request was accepted
    pub fn submission(&self) -> u64 {
        self.submission
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }
}

/// A request that reached its terminal state, with the callback to run
#[derive(Debug)]
pub struct Retired<C> {
    pub id: RequestId,
    pub key: CheckKey,
    pub callback: C,
    pub outcome: Outcome,
}

/// What became of a cancelled request
#[derive(Debug)]
pub struct Cancellation<C> {
    pub retired: Retired<C>,
    /// Sequence number to cancel on the wire, if the request had been sent
    pub wire_cancel: Option<Sequence>,
}

/// How an answer from the service was matched
#[derive(Debug)]
pub enum Resolution<C> {
    /// The request was waiting; its callback must run with the answer
    Delivered(Retired<C>),
    /// The request had been cancelled; no callback runs and the slot is freed
    Dropped { key: CheckKey, result: CheckResult },
    /// The answer's check kind differs from the request sent under the
    /// sequence number; the entry is left in place
    KindMismatch { expected: CheckKind, got: CheckKind },
    /// Nothing sent is waiting under this sequence number
    Unknown,
}

#[derive(Debug)]
struct Slot<C> {
    generation: u32,
    entry: Option<PendingRequest<C>>,
}

/// Owner of all in-flight requests
#[derive(Debug)]
pub struct Registry<C> {
    slots: Vec<Slot<C>>,
    free: BTreeSet<Sequence>,
    next_submission: u64,
    /// Entries whose callback is still outstanding
    outstanding: usize,
    /// Entries held only as cancelled tombstones
    tombstones: usize,
    /// Entries answered from the cache, awaiting delivery
    ready: usize,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            next_submission: 0,
            outstanding: 0,
            tombstones: 0,
            ready: 0,
        }
    }

    /// Register a request in the `Queued` state
    pub fn register(&mut self, key: CheckKey, kind: CheckKind, callback: C) -> Result<RequestId, Error> {
        self.insert(key, kind, callback, RequestState::Queued)
    }

    /// Register a request already answered from the cache
    pub fn register_ready(
        &mut self,
        key: CheckKey,
        kind: CheckKind,
        callback: C,
        result: CheckResult,
    ) -> Result<RequestId, Error> {
        self.insert(key, kind, callback, RequestState::Ready(result))
    }

    fn insert(
        &mut self,
        key: CheckKey,
        kind: CheckKind,
        callback: C,
        state: RequestState,
    ) -> Result<RequestId, Error> {
        let seq = self.allocate()?;
        let slot = &mut self.slots[usize::from(seq)];
        let id = RequestId {
            seq,
            generation: slot.generation,
        };
        let submission = self.next_submission;
        self.next_submission += 1;
        if matches!(state, RequestState::Ready(_)) {
            self.ready += 1;
        }
        slot.entry = Some(PendingRequest {
            id,
            key,
            kind,
            callback: Some(callback),
            submission,
            state,
        });
        self.outstanding += 1;
        Ok(id)
    }

    /// Lowest free sequence number, growing the slot table on demand
    fn allocate(&mut self) -> Result<Sequence, Error> {
        if let Some(seq) = self.free.pop_first() {
            return Ok(seq);
        }
        if self.slots.len() < SLOT_COUNT {
            let seq = self.slots.len() as Sequence;
            self.slots.push(Slot {
                generation: 0,
                entry: None,
            });
            return Ok(seq);
        }
        Err(Error::ResourceExhausted("all request sequence numbers are in use"))
    }

    /// Empty a slot and make its sequence number available again
    fn release(&mut self, seq: Sequence) -> Option<PendingRequest<C>> {
        let slot = self.slots.get_mut(usize::from(seq))?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.insert(seq);
        if entry.callback.is_some() {
            self.outstanding -= 1;
        } else {
            self.tombstones -= 1;
        }
        if matches!(entry.state, RequestState::Ready(_)) {
            self.ready -= 1;
        }
        Some(entry)
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest<C>> {
        self.slots
            .get(usize::from(id.seq))?
            .entry
            .as_ref()
            .filter(|entry| entry.id == id)
    }

    fn get_mut(&mut self, id: RequestId) -> Option<&mut PendingRequest<C>> {
        self.slots
            .get_mut(usize::from(id.seq))?
            .entry
            .as_mut()
            .filter(|entry| entry.id == id)
    }

    pub fn state(&self, id: RequestId) -> Option<&RequestState> {
        self.get(id).map(PendingRequest::state)
    }

    /// Queued -> Sent
    pub fn mark_sent(&mut self, id: RequestId) -> Result<(), Error> {
        match self.get_mut(id) {
            Some(entry) if entry.state == RequestState::Queued => {
                entry.state = RequestState::Sent;
                Ok(())
            }
            _ => Err(Error::NotFound(id)),
        }
    }

    /// Queued requests in submission order
    pub fn queued(&self) -> Vec<RequestId> {
        self.collect_ids(|state| matches!(state, RequestState::Queued))
    }

    pub fn has_ready(&self) -> bool {
        self.ready > 0
    }

    /// Retire every cache-answered request, in submission order
    pub fn take_ready(&mut self) -> Vec<Retired<C>> {
        if self.ready == 0 {
            return Vec::new();
        }
        let ids = self.collect_ids(|state| matches!(state, RequestState::Ready(_)));
        ids.into_iter()
            .filter_map(|id| {
                let entry = self.release(id.seq)?;
                let RequestState::Ready(result) = entry.state else {
                    return None;
                };
                let callback = entry.callback?;
                Some(Retired {
                    id,
                    key: entry.key,
                    callback,
                    outcome: Outcome::Answer(result),
                })
            })
            .collect()
    }

    /// Match an answer from the service to the request sent under `seq`
    pub fn resolve(&mut self, seq: Sequence, kind: CheckKind, result: CheckResult) -> Resolution<C> {
        let Some((state, expected)) = self
            .slots
            .get(usize::from(seq))
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| (entry.state.clone(), entry.kind))
        else {
            debug!(seq, "answer for unknown request ignored");
            return Resolution::Unknown;
        };
        if matches!(state, RequestState::Sent | RequestState::Cancelled) && expected != kind {
            return Resolution::KindMismatch { expected, got: kind };
        }
        match state {
            RequestState::Sent => match self.release(seq) {
                Some(PendingRequest {
                    id,
                    key,
                    callback: Some(callback),
                    ..
                }) => Resolution::Delivered(Retired {
                    id,
                    key,
                    callback,
                    outcome: Outcome::Answer(result),
                }),
                _ => Resolution::Unknown,
            },
            RequestState::Cancelled => match self.release(seq) {
                Some(entry) => {
                    debug!(seq, "answer for cancelled request dropped");
                    Resolution::Dropped {
                        key: entry.key,
                        result,
                    }
                }
                None => Resolution::Unknown,
            },
            RequestState::Queued | RequestState::Ready(_) => {
                debug!(seq, "answer for unsent request ignored");
                Resolution::Unknown
            }
        }
    }

    /// Free the tombstone under `seq` once the service acknowledged the cancel
    pub fn acknowledge_cancel(&mut self, seq: Sequence) -> bool {
        let is_tombstone = self
            .slots
            .get(usize::from(seq))
            .and_then(|slot| slot.entry.as_ref())
            .is_some_and(|entry| entry.state == RequestState::Cancelled);
        if !is_tombstone {
            debug!(seq, "cancel acknowledgement for unknown request ignored");
            return false;
        }
        self.release(seq).is_some()
    }

    /// Cancel a request that has not retired yet
    ///
    /// The callback is handed back for immediate delivery with
    /// [`Outcome::Cancel`]. A request already on the wire stays as a tombstone
    /// until the service's terminal frame for it arrives.
    pub fn cancel(&mut self, id: RequestId) -> Result<Cancellation<C>, Error> {
        let entry = self.get_mut(id).ok_or(Error::NotFound(id))?;
        match entry.state {
            RequestState::Cancelled => Err(Error::NotFound(id)),
            RequestState::Sent => {
                let callback = entry.callback.take().ok_or(Error::NotFound(id))?;
                entry.state = RequestState::Cancelled;
                let key = entry.key.clone();
                self.outstanding -= 1;
                self.tombstones += 1;
                Ok(Cancellation {
                    retired: Retired {
                        id,
                        key,
                        callback,
                        outcome: Outcome::Cancel,
                    },
                    wire_cancel: Some(id.seq),
                })
            }
            RequestState::Queued | RequestState::Ready(_) => {
                let entry = self.release(id.seq).ok_or(Error::NotFound(id))?;
                let callback = entry.callback.ok_or(Error::NotFound(id))?;
                Ok(Cancellation {
                    retired: Retired {
                        id,
                        key: entry.key,
                        callback,
                        outcome: Outcome::Cancel,
                    },
                    wire_cancel: None,
                })
            }
        }
    }

    /// Retire every outstanding request with `cause` and forget all tombstones
    ///
    /// Callbacks come back in submission order. `cause` must not be
    /// [`CallCause::Answer`]; such a call retires nothing.
    pub fn retire_all(&mut self, cause: CallCause) -> Vec<Retired<C>> {
        let Some(outcome) = Outcome::without_result(cause) else {
            return Vec::new();
        };
        let mut entries: Vec<PendingRequest<C>> = (0..self.slots.len())
            .filter_map(|seq| self.release(seq as Sequence))
            .collect();
        entries.sort_by_key(|entry| entry.submission);
        entries
            .into_iter()
            .filter_map(|entry| {
                Some(Retired {
                    id: entry.id,
                    key: entry.key,
                    callback: entry.callback?,
                    outcome: outcome.clone(),
                })
            })
            .collect()
    }

    /// Requests whose terminal callback has not been delivered yet
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Cancelled requests still waiting for the service's terminal frame
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// True when no slot is in use
    pub fn is_empty(&self) -> bool {
        self.outstanding == 0 && self.tombstones == 0
    }

    fn entries(&self) -> impl Iterator<Item = &PendingRequest<C>> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    fn collect_ids(&self, filter: impl Fn(&RequestState) -> bool) -> Vec<RequestId> {
        let mut found: Vec<(u64, RequestId)> = self
            .entries()
            .filter(|entry| filter(&entry.state))
            .map(|entry| (entry.submission, entry.id))
            .collect();
        found.sort_unstable_by_key(|(submission, _)| *submission);
        found.into_iter().map(|(_, id)| id).collect()
    }
}
