use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use floyo_contracts::{Flux2Error, Result};
use serde_json::Value;

use crate::client::JobTransport;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
enum Scripted {
    Ok(Value),
    Status(u16, String),
}

impl Scripted {
    fn into_result(self, url: &str) -> Result<Value> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Status(code, body) => Err(Flux2Error::Status {
                url: url.to_string(),
                code,
                body,
            }),
        }
    }
}

#[derive(Default)]
struct Script {
    submits: VecDeque<Scripted>,
    polls: VecDeque<Value>,
    images: HashMap<String, Vec<u8>>,
    calls: Vec<RecordedCall>,
}

/// In-memory transport: queued submit replies, poll replies (the last one
/// repeats), and image bytes by URL. Every call is recorded.
pub(crate) struct ScriptedTransport {
    created_at: Instant,
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn submit_ok(self, response: Value) -> Self {
        self.with_script(|script| script.submits.push_back(Scripted::Ok(response)))
    }

    pub fn submit_status(self, code: u16, body: &str) -> Self {
        self.with_script(|script| {
            script
                .submits
                .push_back(Scripted::Status(code, body.to_string()))
        })
    }

    pub fn polls(self, responses: Vec<Value>) -> Self {
        self.with_script(|script| script.polls.extend(responses))
    }

    pub fn image(self, url: &str, bytes: Vec<u8>) -> Self {
        self.with_script(|script| {
            script.images.insert(url.to_string(), bytes);
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn with_script(self, apply: impl FnOnce(&mut Script)) -> Self {
        apply(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(
        script: &mut Script,
        method: &'static str,
        url: &str,
        body: Option<Value>,
        query: &[(&str, &str)],
    ) {
        script.calls.push(RecordedCall {
            method,
            url: url.to_string(),
            body,
            query: query
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            at: Instant::now(),
        });
    }
}

impl JobTransport for ScriptedTransport {
    fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        let mut script = self.lock();
        Self::record(&mut script, "POST", url, Some(body.clone()), &[]);
        match script.submits.pop_front() {
            Some(reply) => reply.into_result(url),
            None => Err(Flux2Error::Protocol("no scripted submit reply".to_string())),
        }
    }

    fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let mut script = self.lock();
        Self::record(&mut script, "GET", url, None, query);
        let reply = if script.polls.len() > 1 {
            script.polls.pop_front()
        } else {
            script.polls.front().cloned()
        };
        reply.ok_or_else(|| Flux2Error::Status {
            url: url.to_string(),
            code: 404,
            body: "no scripted poll reply".to_string(),
        })
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut script = self.lock();
        Self::record(&mut script, "DOWNLOAD", url, None, &[]);
        script.images.get(url).cloned().ok_or_else(|| Flux2Error::Status {
            url: url.to_string(),
            code: 404,
            body: "not found".to_string(),
        })
    }
}

/// One-shot HTTP server on a loopback port. Replies with `status` and `body`
/// to the first connection and yields the raw request it received.
pub(crate) fn serve_once(
    status: &'static str,
    body: Vec<u8>,
) -> io::Result<(String, JoinHandle<io::Result<String>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base_url = format!("http://{}", listener.local_addr()?);
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept()?;
        let request = read_request(&mut stream)?;
        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(&body)?;
        stream.flush()?;
        Ok(request)
    });
    Ok((base_url, handle))
}

fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        let Some(head_end) = raw.windows(4).position(|window| window == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&raw[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if raw.len() >= head_end + 4 + content_length {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
