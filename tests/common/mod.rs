//! Shared utilities for integration testing.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay_proxy::{Reactor, ShutdownHandle};

/// Requests captured by a mock upstream, in arrival order.
pub type CapturedRequests = Arc<Mutex<Vec<Vec<u8>>>>;

/// Start a mock upstream on an ephemeral port.
///
/// Serves complete HTTP requests over persistent connections, recording each
/// request and answering every one with `response`.
pub fn start_mock_upstream(response: &'static str) -> (SocketAddr, CapturedRequests) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let captured: CapturedRequests = Arc::new(Mutex::new(Vec::new()));
    let requests = captured.clone();

    thread::spawn(move || loop {
        match listener.accept() {
            Ok((socket, _)) => {
                let requests = requests.clone();
                thread::spawn(move || serve_connection(socket, requests, response));
            }
            Err(_) => break,
        }
    });

    (addr, captured)
}

/// Start a mock upstream that hangs up after every response.
///
/// Each accepted connection serves exactly one request and then closes, so
/// the proxy has to re-establish its pool slot to keep serving.
pub fn start_closing_upstream(response: &'static str) -> (SocketAddr, CapturedRequests) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let captured: CapturedRequests = Arc::new(Mutex::new(Vec::new()));
    let requests = captured.clone();

    thread::spawn(move || loop {
        match listener.accept() {
            Ok((socket, _)) => {
                let requests = requests.clone();
                thread::spawn(move || serve_one_then_close(socket, requests, response));
            }
            Err(_) => break,
        }
    });

    (addr, captured)
}

/// Start the proxy reactor on a background thread.
///
/// Returns the listen address (ephemeral port) and a shutdown handle the
/// test should fire when done.
pub fn start_proxy(config: relay_proxy::ProxyConfig) -> (SocketAddr, ShutdownHandle) {
    let mut reactor = Reactor::new(&config).expect("proxy startup");
    let addr = reactor.local_addr().unwrap();
    let handle = reactor.shutdown_handle();
    thread::spawn(move || reactor.run());
    (addr, handle)
}

/// Poll `condition` until it holds or the timeout elapses.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Read exactly `len` bytes with a deadline.
pub fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match stream.read(&mut out[filled..]) {
            Ok(0) => panic!("peer closed after {filled} of {len} bytes"),
            Ok(n) => filled += n,
            Err(e) => panic!("read failed after {filled} of {len} bytes: {e}"),
        }
    }
    out
}

/// Serve one upstream connection: pop complete requests, answer each.
fn serve_connection(mut socket: TcpStream, requests: CapturedRequests, response: &'static str) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(request) = take_request(&mut pending) {
            requests.lock().unwrap().push(request);
            if socket.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }
}

/// Serve one request, answer it, and close by dropping the socket.
fn serve_one_then_close(mut socket: TcpStream, requests: CapturedRequests, response: &'static str) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        if let Some(request) = take_request(&mut pending) {
            requests.lock().unwrap().push(request);
            let _ = socket.write_all(response.as_bytes());
            return;
        }
    }
}

/// Pop one complete request (headers plus Content-Length body) off the front
/// of `pending`, if fully buffered.
fn take_request(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let header_end = find(pending, b"\r\n\r\n")? + 4;
    let body_len = content_length(&pending[..header_end]).unwrap_or(0);
    let total = header_end + body_len;
    if pending.len() < total {
        return None;
    }
    let request = pending[..total].to_vec();
    pending.drain(..total);
    Some(request)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.split("\r\n")
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .and_then(|value| value.trim().parse().ok())
}
