//! End-to-end checks against a fake service on a real Unix socket

use authz_client_async::prelude::*;
use authz_client_async::protocol::{decode_request, encode_response, Request, Response};
use authz_client_async::UnixTransport;
use bytes::BytesMut;
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ServiceMode {
    /// Allow "alice" with a TTL, deny everyone else
    Answer,
    /// Read the first request, then close the connection
    HangUp,
}

type Outcomes = Rc<RefCell<Vec<(RequestId, Outcome)>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn respond(request: Request) -> Response {
    match request {
        Request::Check { seq, kind, key } => {
            let result = if key.user().as_ref() == b"alice" {
                CheckResult::allow().with_ttl(Duration::from_secs(60))
            } else {
                CheckResult::deny()
            };
            Response::Check { seq, kind, result }
        }
        Request::Cancel { seq } => Response::Cancel { seq },
    }
}

fn spawn_service(path: &Path, mode: ServiceMode) -> thread::JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut inbound = BytesMut::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            inbound.extend_from_slice(&chunk[..n]);
            while let Ok(Some(request)) = decode_request(&mut inbound, 1 << 20) {
                if mode == ServiceMode::HangUp {
                    return;
                }
                let mut out = BytesMut::new();
                encode_response(&respond(request), &mut out);
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
        }
    })
}

fn recorder(
    outcomes: &Outcomes,
) -> impl FnOnce(&mut AsyncEngine<UnixTransport>, RequestId, Outcome) + 'static {
    let outcomes = Rc::clone(outcomes);
    move |_engine: &mut AsyncEngine<UnixTransport>, id: RequestId, outcome: Outcome| {
        outcomes.borrow_mut().push((id, outcome))
    }
}

/// Stand-in for the host's event loop
fn drive_until(engine: &mut AsyncEngine<UnixTransport>, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for callbacks");
        engine.process().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
}

fn key(user: &str) -> CheckKey {
    CheckKey::new("client", "session", user.to_string(), "http://tizen.org/privilege/internet")
        .unwrap()
}

#[test]
fn test_checks_round_trip_through_unix_socket() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authz.sock");
    let service = spawn_service(&path, ServiceMode::Answer);

    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&changes);
    let config = Configuration::default().with_socket_path(&path);
    let mut engine =
        AsyncEngine::initialize(config, move |change: StatusChange| sink.borrow_mut().push(change))
            .unwrap();
    assert_eq!(changes.borrow().len(), 1);
    assert!(changes.borrow()[0].new_fd.is_some());

    let outcomes: Outcomes = Rc::default();
    let alice = engine.create_request(key("alice"), recorder(&outcomes)).unwrap();
    let bob = engine.create_simple_request(key("bob"), recorder(&outcomes)).unwrap();
    drive_until(&mut engine, || outcomes.borrow().len() == 2);

    let seen = outcomes.borrow().clone();
    assert!(seen.contains(&(
        alice,
        Outcome::Answer(CheckResult::allow().with_ttl(Duration::from_secs(60)))
    )));
    assert!(seen.contains(&(bob, Outcome::Answer(CheckResult::deny()))));

    // Both answers were cached; a repeat is served locally
    assert!(engine.check_cache(&key("alice")).is_some());
    let again = engine.create_request(key("alice"), recorder(&outcomes)).unwrap();
    drive_until(&mut engine, || outcomes.borrow().len() == 3);
    assert_eq!(outcomes.borrow()[2].0, again);
    assert_eq!(engine.status(), Some(Status::ForRead));

    engine.finish();
    assert_eq!(changes.borrow().last().map(|change| change.new_fd), Some(None));
    service.join().unwrap();
}

#[test]
fn test_service_hang_up_retires_requests() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authz.sock");
    let service = spawn_service(&path, ServiceMode::HangUp);

    let config = Configuration::default().with_socket_path(&path);
    let mut engine = AsyncEngine::initialize(config, |_change: StatusChange| {}).unwrap();

    let outcomes: Outcomes = Rc::default();
    let id = engine.create_request(key("carol"), recorder(&outcomes)).unwrap();
    drive_until(&mut engine, || !outcomes.borrow().is_empty());

    assert_eq!(outcomes.borrow().as_slice(), &[(id, Outcome::ServiceNotAvailable)]);
    assert_eq!(engine.pending_requests(), 0);
    assert_eq!(engine.fd(), None);
    service.join().unwrap();
}

#[test]
fn test_initialize_without_service_fails() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration::default().with_socket_path(dir.path().join("missing.sock"));

    let result = AsyncEngine::initialize(config, |_change: StatusChange| {});
    assert!(matches!(result, Err(Error::ConnectionFailed(_))));
}
