//! Connection to the authorization service
//!
//! [`Transport`] is the raw non-blocking byte stream; [`UnixTransport`] is the
//! production one. [`WireSession`] sits on top, owning the outbound and inbound
//! buffers, turning requests into frames and frames into responses.

use bytes::{Buf, BytesMut};
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::protocol::{decode_response, encode_request, Request, Response};
use crate::Error;

/// Result of starting or polling a non-blocking connect
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    /// Completion is signalled by write readiness
    InProgress,
}

/// Non-blocking byte stream to the service
///
/// `read` and `write` report `WouldBlock` instead of waiting; `read` returning
/// `Ok(0)` means the peer closed the stream.
pub trait Transport {
    fn connect(&mut self) -> io::Result<ConnectStatus>;

    /// Check on a connect that returned [`ConnectStatus::InProgress`]
    fn poll_connect(&mut self) -> io::Result<ConnectStatus>;

    /// Descriptor to hand to the host's event loop
    fn raw_fd(&self) -> Option<RawFd>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the stream; a later `connect` opens a new one
    fn disconnect(&mut self);
}

/// Unix stream socket transport
#[derive(Debug)]
pub struct UnixTransport {
    path: PathBuf,
    socket: Option<Socket>,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            socket: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn socket(&self) -> io::Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Transport for UnixTransport {
    fn connect(&mut self) -> io::Result<ConnectStatus> {
        self.socket = None;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        let addr = SockAddr::unix(&self.path)?;
        let status = match socket.connect(&addr) {
            Ok(()) => ConnectStatus::Connected,
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => ConnectStatus::InProgress,
            Err(err) => return Err(err),
        };
        self.socket = Some(socket);
        Ok(status)
    }

    fn poll_connect(&mut self) -> io::Result<ConnectStatus> {
        let socket = self.socket()?;
        if let Some(err) = socket.take_error()? {
            return Err(err);
        }
        match socket.peer_addr() {
            Ok(_) => Ok(ConnectStatus::Connected),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(ConnectStatus::InProgress),
            Err(err) => Err(err),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.socket()?;
        socket.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // No SIGPIPE when the service went away; EPIPE is reported instead.
        self.socket()?.send_with_flags(buf, libc::MSG_NOSIGNAL)
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }
}

/// Connection lifecycle of a [`WireSession`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a single [`WireSession::try_read`] call produced
#[derive(Debug, Default)]
pub struct Inbound {
    /// Complete responses, in arrival order
    pub responses: Vec<Response>,
    /// Set when the connection can no longer be used
    pub lost: Option<Error>,
}

/// Framed request/response stream over a [`Transport`]
#[derive(Debug)]
pub struct WireSession<T> {
    transport: T,
    state: SessionState,
    /// Bumped on every connect and disconnect
    epoch: u64,
    write_buf: BytesMut,
    read_buf: BytesMut,
    max_frame_len: usize,
    read_chunk_size: usize,
}

impl<T: Transport> WireSession<T> {
    pub fn new(transport: T, config: &Configuration) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            epoch: 0,
            write_buf: BytesMut::new(),
            read_buf: BytesMut::new(),
            max_frame_len: config.max_frame_len,
            read_chunk_size: config.read_chunk_size,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    /// Identifies the current connection; changes whenever it is replaced
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match self.state {
            SessionState::Disconnected => None,
            _ => self.transport.raw_fd(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Start a connection unless one is already open or opening
    pub fn connect(&mut self) -> Result<SessionState, Error> {
        if !self.is_disconnected() {
            return Ok(self.state);
        }
        self.epoch += 1;
        match self.transport.connect() {
            Ok(ConnectStatus::Connected) => {
                info!(epoch = self.epoch, "connected to authorization service");
                self.state = SessionState::Connected;
            }
            Ok(ConnectStatus::InProgress) => {
                debug!(epoch = self.epoch, "connect in progress");
                self.state = SessionState::Connecting;
            }
            Err(err) => {
                warn!(error = %err, "failed to connect to authorization service");
                self.transport.disconnect();
                return Err(Error::ConnectionFailed(err));
            }
        }
        Ok(self.state)
    }

    /// Finish a pending connect; `Ok(true)` once the connection is usable
    pub fn complete_connect(&mut self) -> Result<bool, Error> {
        match self.state {
            SessionState::Connected => return Ok(true),
            SessionState::Disconnected => {
                return Err(Error::ConnectionLost("not connected".into()));
            }
            SessionState::Connecting => {}
        }
        match self.transport.poll_connect() {
            Ok(ConnectStatus::Connected) => {
                info!(epoch = self.epoch, "connected to authorization service");
                self.state = SessionState::Connected;
                Ok(true)
            }
            Ok(ConnectStatus::InProgress) => Ok(false),
            Err(err) => Err(Error::ConnectionFailed(err)),
        }
    }

    /// Queue a request frame for the next [`flush`](Self::flush)
    pub fn enqueue(&mut self, request: &Request) {
        encode_request(request, &mut self.write_buf);
    }

    /// True while the host needs to watch for write readiness
    pub fn wants_write(&self) -> bool {
        match self.state {
            SessionState::Connecting => true,
            SessionState::Connected => !self.write_buf.is_empty(),
            SessionState::Disconnected => false,
        }
    }

    /// Bytes queued but not yet accepted by the transport
    pub fn pending_output(&self) -> usize {
        self.write_buf.len()
    }

    /// Write as much queued output as the transport accepts without blocking
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.is_connected() {
            return Ok(());
        }
        while !self.write_buf.is_empty() {
            match self.transport.write(&self.write_buf) {
                Ok(0) => return Err(Error::ConnectionLost("service stopped accepting data".into())),
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::ConnectionLost(err.to_string())),
            }
        }
        Ok(())
    }

    /// Drain everything readable and decode all complete responses
    ///
    /// Frames are decoded after every chunk, so a corrupt stream stops the
    /// reading as soon as it shows.
    pub fn try_read(&mut self) -> Inbound {
        let mut inbound = Inbound::default();
        if !self.is_connected() {
            return inbound;
        }

        loop {
            let start = self.read_buf.len();
            self.read_buf.resize(start + self.read_chunk_size, 0);
            let read = self.transport.read(&mut self.read_buf[start..]);
            match read {
                Ok(0) => {
                    self.read_buf.truncate(start);
                    inbound.lost = Some(Error::ConnectionLost("service closed the connection".into()));
                    break;
                }
                Ok(n) => {
                    self.read_buf.truncate(start + n);
                    if let Err(err) = self.decode_buffered(&mut inbound.responses) {
                        inbound.lost = Some(err);
                        break;
                    }
                }
                Err(err) => {
                    self.read_buf.truncate(start);
                    match err.kind() {
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            inbound.lost = Some(Error::ConnectionLost(err.to_string()));
                            break;
                        }
                    }
                }
            }
        }
        inbound
    }

    fn decode_buffered(&mut self, responses: &mut Vec<Response>) -> Result<(), Error> {
        loop {
            match decode_response(&mut self.read_buf, self.max_frame_len) {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "malformed frame from authorization service");
                    return Err(Error::ConnectionLost(format!("protocol error: {err}")));
                }
            }
        }
    }

    /// Drop the connection and any buffered data
    pub fn disconnect(&mut self) {
        if self.is_disconnected() {
            return;
        }
        self.transport.disconnect();
        self.state = SessionState::Disconnected;
        self.epoch += 1;
        self.write_buf.clear();
        self.read_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{CheckKey, CheckKind, CheckResult};
    use crate::testing::{ConnectMode, MockTransport};

    fn session() -> (WireSession<MockTransport>, crate::testing::MockHandle) {
        let (transport, handle) = MockTransport::new();
        (WireSession::new(transport, &Configuration::default()), handle)
    }

    fn check(seq: u16) -> Request {
        Request::Check {
            seq,
            kind: CheckKind::Full,
            key: CheckKey::new("client", "session", "user", "privilege").unwrap(),
        }
    }

    #[test]
    fn test_connect_bumps_epoch_and_exposes_fd() {
        let (mut session, _handle) = session();
        assert_eq!(session.raw_fd(), None);

        assert_eq!(session.connect().unwrap(), SessionState::Connected);
        assert_eq!(session.epoch(), 1);
        assert!(session.raw_fd().is_some());

        // Already connected: nothing changes
        session.connect().unwrap();
        assert_eq!(session.epoch(), 1);

        session.disconnect();
        assert_eq!(session.raw_fd(), None);
        assert_eq!(session.epoch(), 2);
    }

    #[test]
    fn test_refused_connect_is_connection_failed() {
        let (mut session, handle) = session();
        handle.set_connect_mode(ConnectMode::Refuse);

        assert!(matches!(session.connect(), Err(Error::ConnectionFailed(_))));
        assert!(session.is_disconnected());
    }

    #[test]
    fn test_deferred_connect_wants_write_until_complete() {
        let (mut session, handle) = session();
        handle.set_connect_mode(ConnectMode::Deferred);

        assert_eq!(session.connect().unwrap(), SessionState::Connecting);
        assert!(session.wants_write());
        assert!(!session.complete_connect().unwrap());

        handle.complete_connect();
        assert!(session.complete_connect().unwrap());
        assert!(session.is_connected());
        assert!(!session.wants_write());
    }

    #[test]
    fn test_failed_deferred_connect() {
        let (mut session, handle) = session();
        handle.set_connect_mode(ConnectMode::Deferred);
        session.connect().unwrap();

        handle.fail_connect();
        assert!(matches!(
            session.complete_connect(),
            Err(Error::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_partial_writes_are_retried() {
        let (mut session, handle) = session();
        session.connect().unwrap();
        handle.set_write_budget(Some(5));

        session.enqueue(&check(1));
        session.flush().unwrap();
        assert!(session.wants_write());
        assert!(session.pending_output() > 0);
        assert!(handle.take_requests().is_empty());

        handle.set_write_budget(None);
        session.flush().unwrap();
        assert!(!session.wants_write());
        assert_eq!(handle.take_requests(), vec![check(1)]);
    }

    #[test]
    fn test_try_read_drains_all_complete_frames() {
        let (mut session, handle) = session();
        session.connect().unwrap();

        handle.answer(1, CheckResult::allow());
        handle.answer(2, CheckResult::deny());
        handle.push_partial_frame();

        let inbound = session.try_read();
        let seqs: Vec<_> = inbound.responses.iter().map(Response::seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(inbound.lost.is_none());

        // Nothing more arrives until the rest of the partial frame does
        assert!(session.try_read().responses.is_empty());
    }

    #[test]
    fn test_responses_before_close_are_kept() {
        let (mut session, handle) = session();
        session.connect().unwrap();

        handle.answer(3, CheckResult::allow());
        handle.close_peer();

        let inbound = session.try_read();
        assert_eq!(inbound.responses.len(), 1);
        assert!(matches!(inbound.lost, Some(Error::ConnectionLost(_))));
    }

    #[test]
    fn test_garbage_is_connection_lost() {
        let (mut session, handle) = session();
        session.connect().unwrap();

        handle.push_raw(b"HTTP/1.1 400 Bad Request\r\n");
        let inbound = session.try_read();
        assert!(inbound.responses.is_empty());
        assert!(matches!(inbound.lost, Some(Error::ConnectionLost(msg)) if msg.contains("protocol error")));
    }

    #[test]
    fn test_oversized_frame_stops_reading() {
        let (transport, handle) = MockTransport::new();
        let config = Configuration {
            max_frame_len: 1024,
            read_chunk_size: 64,
            ..Default::default()
        };
        let mut session = WireSession::new(transport, &config);
        session.connect().unwrap();

        handle.answer(1, CheckResult::allow());
        let mut header = b"CPv1".to_vec();
        header.extend_from_slice(&(1u32 << 30).to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        handle.push_raw(&header);
        handle.push_raw(&[0u8; 16 * 1024]);

        let inbound = session.try_read();
        assert_eq!(inbound.responses.len(), 1);
        assert!(matches!(inbound.lost, Some(Error::ConnectionLost(msg)) if msg.contains("too large")));
        // The rest of the flood was never pulled off the socket
        assert!(handle.unread() > 15 * 1024);
    }

    #[test]
    fn test_write_to_closed_peer_is_connection_lost() {
        let (mut session, handle) = session();
        session.connect().unwrap();
        handle.close_peer();

        session.enqueue(&check(1));
        assert!(matches!(session.flush(), Err(Error::ConnectionLost(_))));
    }

    #[test]
    fn test_disconnect_discards_buffers() {
        let (mut session, handle) = session();
        session.connect().unwrap();
        session.enqueue(&check(1));
        handle.answer(1, CheckResult::allow());

        session.disconnect();
        assert_eq!(session.pending_output(), 0);
        assert!(session.try_read().responses.is_empty());
        assert_eq!(handle.disconnects(), 1);
    }
}
