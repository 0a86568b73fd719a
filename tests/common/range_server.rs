//! Minimal HTTP/1.1 server for integration tests: HEAD, Range GET, ETag,
//! switchable range support, failure injection and byte accounting.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405.
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    pub etag: Option<String>,
    /// Every request is answered with this status and an empty body.
    pub fail_status: Option<u16>,
    /// Ranged GETs are answered from this many bytes further on, with a
    /// truthful `Content-Range`.
    pub shift_ranges: u64,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            etag: Some("\"v1\"".to_string()),
            fail_status: None,
            shift_ranges: 0,
        }
    }
}

struct Shared {
    body: Vec<u8>,
    opts: Mutex<RangeServerOptions>,
    /// Body bytes written to clients by GET responses.
    served: AtomicU64,
    gets: AtomicUsize,
    /// The next N GETs answer 503.
    fail_next_gets: AtomicUsize,
    /// The next N GETs send half their body and hang up.
    truncate_next_gets: AtomicUsize,
}

/// Handle to a running server. The server thread lives until the process
/// exits.
#[derive(Clone)]
pub struct RangeServer {
    pub url: String,
    shared: Arc<Shared>,
}

impl RangeServer {
    pub fn served_bytes(&self) -> u64 {
        self.shared.served.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.shared.gets.load(Ordering::SeqCst)
    }

    pub fn set_etag(&self, etag: Option<&str>) {
        self.shared.opts.lock().unwrap().etag = etag.map(str::to_string);
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.shared.fail_next_gets.store(n, Ordering::SeqCst);
    }

    pub fn truncate_next_gets(&self, n: usize) {
        self.shared.truncate_next_gets.store(n, Ordering::SeqCst);
    }
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let shared = Arc::new(Shared {
        body,
        opts: Mutex::new(opts),
        served: AtomicU64::new(0),
        gets: AtomicUsize::new(0),
        fail_next_gets: AtomicUsize::new(0),
        truncate_next_gets: AtomicUsize::new(0),
    });
    let accept_shared = shared.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let shared = accept_shared.clone();
            thread::spawn(move || handle(stream, &shared));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/media/sample.bin", port),
        shared,
    }
}

/// Consume one counter unit if any are left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|w| w == b"\r\n\r\n") || data.len() > 64 * 1024 {
            break;
        }
    }
    String::from_utf8(data).ok()
}

fn handle(mut stream: TcpStream, shared: &Shared) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(30)));
    let Some(request) = read_request(&mut stream) else { return };
    let (method, range) = parse_request(&request);
    let opts = shared.opts.lock().unwrap().clone();
    let body = &shared.body;
    let total = body.len() as u64;

    if let Some(code) = opts.fail_status {
        let _ = write!(stream, "HTTP/1.1 {} Injected\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", code);
        return;
    }

    let mut common = String::from("Connection: close\r\n");
    if let Some(tag) = &opts.etag {
        common.push_str(&format!("ETag: {}\r\n", tag));
    }
    if opts.support_ranges {
        common.push_str("Accept-Ranges: bytes\r\n");
    }

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            return;
        }
        let _ = write!(stream, "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n", total, common);
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    shared.gets.fetch_add(1, Ordering::SeqCst);
    if take_one(&shared.fail_next_gets) {
        let _ = stream.write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    let (status, content_range, slice) = match range.filter(|_| opts.support_ranges) {
        Some((start, end_incl)) => {
            let start = start.saturating_add(opts.shift_ranges);
            let end_incl = end_incl.saturating_add(opts.shift_ranges);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start >= total || start > end_incl {
                let _ = write!(
                    stream,
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n{}\r\n",
                    total, common
                );
                return;
            }
            let slice = &body[start as usize..=end_incl as usize];
            ("206 Partial Content", Some(format!("bytes {}-{}/{}", start, end_incl, total)), slice)
        }
        None => ("200 OK", None, &body[..]),
    };

    let mut head = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\n{}", status, slice.len(), common);
    if let Some(value) = content_range {
        head.push_str(&format!("Content-Range: {}\r\n", value));
    }
    head.push_str("\r\n");
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let send = if take_one(&shared.truncate_next_gets) { &slice[..slice.len() / 2] } else { slice };
    for part in send.chunks(16 * 1024) {
        if stream.write_all(part).is_err() {
            return;
        }
        shared.served.fetch_add(part.len() as u64, Ordering::SeqCst);
    }
    let _ = stream.flush();
}

/// Returns (method, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() { u64::MAX } else { end.parse::<u64>().unwrap_or(0) };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}

/// Deterministic non-repeating-ish test payload.
pub fn payload(len: usize) -> Vec<u8> {
    let mut x: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}
