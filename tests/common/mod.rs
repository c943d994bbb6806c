#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use print_sentinel::alerts::{FailureNotice, NotificationChannel};
use print_sentinel::error::{ProviderError, ProviderErrorKind, SnapshotError};
use print_sentinel::monitor::{StateSink, StateUpdate};
use print_sentinel::printer::PrintController;
use print_sentinel::providers::{ProviderKind, Verdict, VisionProvider};
use print_sentinel::snapshot::SnapshotSource;

/// A small valid JPEG.
pub fn jpeg() -> Vec<u8> {
    let frame = image::RgbImage::from_fn(16, 12, |x, y| image::Rgb([(x * 10) as u8, (y * 20) as u8, 128]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(frame)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    buffer
}

pub fn png() -> Vec<u8> {
    let frame = image::RgbImage::from_pixel(4, 4, image::Rgb([0, 255, 0]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(frame)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .expect("encode png");
    buffer
}

/// A canned HTTP response.
#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn bytes(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
            delay: Duration::ZERO,
        }
    }

    /// Hold the response back for `delay` after the request is read.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One request the server received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

/// Minimal HTTP/1.1 responder on 127.0.0.1.
///
/// Replies are served in order; the last one repeats once the queue is empty.
pub struct MockServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    received: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let mut queue: VecDeque<Reply> = replies.into();

        thread::spawn(move || {
            let mut last = None;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let reply = queue.pop_front().or_else(|| last.clone());
                if let Some(reply) = reply {
                    last = Some(reply.clone());
                    if let Some(request) = handle(stream, &reply, &counter) {
                        recorded.lock().unwrap().push(request);
                    }
                }
            }
        });

        Self { url, requests, received }
    }

    /// Requests read so far, counted before any reply delay.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn handle(stream: TcpStream, reply: &Reply, received: &AtomicUsize) -> Option<Recorded> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;
    received.fetch_add(1, Ordering::SeqCst);
    thread::sleep(reply.delay);

    let mut stream = stream;
    let head = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.content_type,
        reply.body.len()
    );
    stream.write_all(head.as_bytes()).ok()?;
    stream.write_all(&reply.body).ok()?;
    stream.flush().ok()?;

    Some(Recorded {
        method,
        path,
        headers,
        body,
    })
}

/// A URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("local addr"));
    drop(listener);
    url
}

/// Provider fake answering from a script. Once the script is exhausted it
/// answers OK.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<bool, ProviderErrorKind>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub calls: Arc<AtomicUsize>,
    cost: f64,
}

impl ScriptedProvider {
    /// `true` answers FAIL, `false` answers OK.
    pub fn new(script: Vec<Result<bool, ProviderErrorKind>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            cost: 0.001,
        }
    }

    pub fn verdicts(failed: &[bool]) -> Self {
        Self::new(failed.iter().map(|f| Ok(*f)).collect())
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

impl VisionProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn analyze(&self, image: &[u8], prompt: &str) -> Result<Verdict, ProviderError> {
        assert!(!image.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(false));
        match next {
            Ok(failed) => Ok(Verdict {
                failed,
                reason: if failed { "spaghetti".into() } else { "looks fine".into() },
                confidence: None,
                provider: ProviderKind::OpenAi,
                model: "scripted".into(),
                latency_ms: 120,
                cost_usd: self.cost,
                raw_snapshot_reference: None,
            }),
            Err(kind) => Err(ProviderError::new(kind, "openai", "scripted failure")),
        }
    }
}

/// Snapshot source returning a JPEG, or failing while `failing` is set.
#[derive(Clone, Default)]
pub struct FakeCamera {
    pub failing: Arc<std::sync::atomic::AtomicBool>,
    pub captures: Arc<AtomicUsize>,
}

impl SnapshotSource for FakeCamera {
    fn capture(&self, url: &str) -> Result<Vec<u8>, SnapshotError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SnapshotError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(jpeg())
    }
}

#[derive(Clone, Default)]
pub struct FakePrinter {
    pub cancels: Arc<AtomicUsize>,
    pub reject: bool,
}

impl PrintController for FakePrinter {
    fn cancel_print(&self) -> anyhow::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            anyhow::bail!("printer offline");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingChannel {
    pub notices: Arc<Mutex<Vec<(FailureNotice, bool)>>>,
}

impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, notice: &FailureNotice, image: Option<&[u8]>) -> anyhow::Result<()> {
        self.notices.lock().unwrap().push((notice.clone(), image.is_some()));
        Ok(())
    }
}

pub struct FailingChannel;

impl NotificationChannel for FailingChannel {
    fn name(&self) -> &str {
        "failing"
    }

    fn send(&self, _notice: &FailureNotice, _image: Option<&[u8]>) -> anyhow::Result<()> {
        anyhow::bail!("transport down")
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub updates: Arc<Mutex<Vec<StateUpdate>>>,
}

impl StateSink for RecordingSink {
    fn push(&self, update: &StateUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}
