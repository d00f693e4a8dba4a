//! In-memory doubles for exercising the engine without a service
//!
//! [`MockTransport`] stands in for the socket. Its [`MockHandle`] plays the
//! service: it reads what the client wrote, injects responses, throttles
//! writes, and can drop the connection at any point.

use bytes::BytesMut;
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::config::Configuration;
use crate::decision::{CheckKind, CheckResult, Outcome};
use crate::engine::AsyncEngine;
use crate::protocol::{decode_request, encode_response, Request, Response, Sequence};
use crate::registry::RequestId;
use crate::session::{ConnectStatus, Transport};
use crate::status::{Status, StatusChange};

/// Descriptor numbers handed out by the mock start here
const FIRST_FAKE_FD: RawFd = 100;

/// How [`MockTransport::connect`] behaves
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectMode {
    #[default]
    Immediate,
    /// Connect reports in-progress until the handle completes or fails it
    Deferred,
    Refuse,
}

#[derive(Debug, Default)]
struct MockState {
    connect_mode: ConnectMode,
    connected: bool,
    connecting: bool,
    connect_failed: bool,
    peer_closed: bool,
    connects: usize,
    disconnects: usize,
    /// Bytes the service has sent, not yet read by the client
    inbound: BytesMut,
    /// Bytes the client has written, not yet taken by the test
    outbound: BytesMut,
    /// Remaining bytes the transport accepts; `None` is unlimited
    write_budget: Option<usize>,
}

/// Transport backed by shared in-memory buffers
#[derive(Debug)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> io::Result<ConnectStatus> {
        let mut state = self.state.borrow_mut();
        state.inbound.clear();
        state.peer_closed = false;
        state.connect_failed = false;
        match state.connect_mode {
            ConnectMode::Immediate => {
                state.connects += 1;
                state.connected = true;
                Ok(ConnectStatus::Connected)
            }
            ConnectMode::Deferred => {
                state.connects += 1;
                state.connecting = true;
                Ok(ConnectStatus::InProgress)
            }
            ConnectMode::Refuse => Err(io::ErrorKind::ConnectionRefused.into()),
        }
    }

    fn poll_connect(&mut self) -> io::Result<ConnectStatus> {
        let state = self.state.borrow();
        if state.connected {
            Ok(ConnectStatus::Connected)
        } else if state.connect_failed {
            Err(io::ErrorKind::ConnectionRefused.into())
        } else if state.connecting {
            Ok(ConnectStatus::InProgress)
        } else {
            Err(io::ErrorKind::NotConnected.into())
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        let state = self.state.borrow();
        (state.connected || state.connecting).then(|| FIRST_FAKE_FD + state.connects as RawFd)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if state.inbound.is_empty() {
            if state.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.inbound.len());
        let chunk = state.inbound.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if state.peer_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match state.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn disconnect(&mut self) {
        let mut state = self.state.borrow_mut();
        state.connected = false;
        state.connecting = false;
        state.disconnects += 1;
    }
}

/// The service's end of a [`MockTransport`]
#[derive(Clone, Debug)]
pub struct MockHandle {
    state: Rc<RefCell<MockState>>,
}

impl MockHandle {
    pub fn set_connect_mode(&self, mode: ConnectMode) {
        self.state.borrow_mut().connect_mode = mode;
    }

    /// Let a deferred connect succeed
    pub fn complete_connect(&self) {
        let mut state = self.state.borrow_mut();
        state.connecting = false;
        state.connected = true;
    }

    /// Let a deferred connect fail
    pub fn fail_connect(&self) {
        let mut state = self.state.borrow_mut();
        state.connecting = false;
        state.connect_failed = true;
    }

    /// Limit how many more bytes the client may write; `None` lifts the limit
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    /// Decode and remove every complete request the client has written
    pub fn take_requests(&self) -> Vec<Request> {
        let mut state = self.state.borrow_mut();
        let mut requests = Vec::new();
        while let Ok(Some(request)) = decode_request(&mut state.outbound, u32::MAX as usize) {
            requests.push(request);
        }
        requests
    }

    /// Sequence numbers of the check requests written so far
    pub fn take_check_seqs(&self) -> Vec<Sequence> {
        self.take_requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Check { seq, .. } => Some(seq),
                Request::Cancel { .. } => None,
            })
            .collect()
    }

    pub fn push_response(&self, response: &Response) {
        encode_response(response, &mut self.state.borrow_mut().inbound);
    }

    /// Send a full-check answer for `seq`
    pub fn answer(&self, seq: Sequence, result: CheckResult) {
        self.push_response(&Response::Check {
            seq,
            kind: CheckKind::Full,
            result,
        });
    }

    /// Acknowledge a cancel for `seq`
    pub fn acknowledge_cancel(&self, seq: Sequence) {
        self.push_response(&Response::Cancel { seq });
    }

    /// Send the first few bytes of a frame and nothing else
    pub fn push_partial_frame(&self) {
        let mut frame = BytesMut::new();
        encode_response(&Response::Cancel { seq: 0 }, &mut frame);
        self.push_raw(&frame[..5]);
    }

    pub fn push_raw(&self, bytes: &[u8]) {
        self.state.borrow_mut().inbound.extend_from_slice(bytes);
    }

    /// Bytes the service sent that the client has not read yet
    pub fn unread(&self) -> usize {
        self.state.borrow().inbound.len()
    }

    /// Close the service's end; pending inbound bytes are still readable
    pub fn close_peer(&self) {
        self.state.borrow_mut().peer_closed = true;
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.borrow().disconnects
    }
}

/// Records every response callback in delivery order
#[derive(Clone, Debug, Default)]
pub struct CallbackLog {
    entries: Rc<RefCell<Vec<(RequestId, Outcome)>>>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A response callback that appends to this log
    pub fn callback<T: Transport + 'static>(
        &self,
    ) -> impl FnOnce(&mut AsyncEngine<T>, RequestId, Outcome) + 'static {
        let entries = Rc::clone(&self.entries);
        move |_engine: &mut AsyncEngine<T>, id: RequestId, outcome: Outcome| {
            entries.borrow_mut().push((id, outcome))
        }
    }

    pub fn entries(&self) -> Vec<(RequestId, Outcome)> {
        self.entries.borrow().clone()
    }

    /// Outcomes delivered for `id`; exactly one once the request retired
    pub fn outcomes_for(&self, id: RequestId) -> Vec<Outcome> {
        self.entries
            .borrow()
            .iter()
            .filter(|(seen, _)| *seen == id)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Records every status callback
#[derive(Clone, Debug, Default)]
pub struct StatusLog {
    changes: Rc<RefCell<Vec<StatusChange>>>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnMut(StatusChange) + 'static {
        let changes = Rc::clone(&self.changes);
        move |change| changes.borrow_mut().push(change)
    }

    pub fn changes(&self) -> Vec<StatusChange> {
        self.changes.borrow().clone()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.changes.borrow().iter().map(|change| change.status).collect()
    }

    pub fn last(&self) -> Option<StatusChange> {
        self.changes.borrow().last().copied()
    }

    pub fn clear(&self) {
        self.changes.borrow_mut().clear();
    }
}

/// Engine over a [`MockTransport`], plus the handles to observe it
pub fn mock_engine(config: Configuration) -> (AsyncEngine<MockTransport>, MockHandle, StatusLog) {
    mock_engine_with(config, ConnectMode::Immediate)
}

pub fn mock_engine_with(
    config: Configuration,
    mode: ConnectMode,
) -> (AsyncEngine<MockTransport>, MockHandle, StatusLog) {
    let (transport, handle) = MockTransport::new();
    handle.set_connect_mode(mode);
    let status = StatusLog::new();
    let engine = match AsyncEngine::with_transport(config, transport, status.callback()) {
        Ok(engine) => engine,
        Err(err) => panic!("mock engine failed to start: {err}"),
    };
    (engine, handle, status)
}
