//! Protocol channel over a worker's stdin/stdout.
//!
//! Flow:
//! 1. A reader task pulls chunks from stdout into a [`LineBuffer`]
//! 2. Each complete line is parsed into a [`Response`]
//! 3. The response settles the oldest pending request expecting its kind
//! 4. On EOF or a read error every pending request fails with `WorkerCrashed`
//!
//! Pending requests are keyed by a correlation id even though the wire
//! format has none; an expired request is removed by id so a late frame can
//! never settle a newer request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AnalyzerError, AnalyzerResult};
use crate::framing::LineBuffer;
use crate::protocol::{Request, Response, ResponseKind};

const READ_CHUNK_BYTES: usize = 8 * 1024;

type ResponseSender = oneshot::Sender<AnalyzerResult<Response>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingRequest {
    kind: ResponseKind,
    tx: ResponseSender,
}

/// Requests awaiting a response, oldest first.
#[derive(Default)]
struct PendingMap {
    next_id: u64,
    entries: BTreeMap<u64, PendingRequest>,
    closed: Option<String>,
}

impl PendingMap {
    fn register(
        &mut self,
        kind: ResponseKind,
    ) -> AnalyzerResult<(u64, oneshot::Receiver<AnalyzerResult<Response>>)> {
        if let Some(reason) = &self.closed {
            return Err(AnalyzerError::worker_crashed(reason.clone()));
        }
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, PendingRequest { kind, tx });
        Ok((id, rx))
    }

    fn take_oldest(&mut self, kind: ResponseKind) -> Option<(u64, ResponseSender)> {
        let id = self
            .entries
            .iter()
            .find(|(_, p)| p.kind == kind)
            .map(|(id, _)| *id)?;
        self.entries.remove(&id).map(|p| (id, p.tx))
    }

    fn remove(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for (id, pending) in std::mem::take(&mut self.entries) {
            debug!(correlation_id = id, kind = %pending.kind, "Failing pending request: {}", reason);
            let _ = pending
                .tx
                .send(Err(AnalyzerError::worker_crashed(reason.to_string())));
        }
    }
}

/// Withdraws a request from the pending map when its caller stops waiting,
/// whether it returned or was dropped mid-flight.
struct PendingGuard<'a> {
    pending: &'a StdMutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

/// Line protocol endpoint for one worker process.
pub struct ProtocolChannel {
    label: String,
    writer: Mutex<BoxedWriter>,
    pending: Arc<StdMutex<PendingMap>>,
    alive: Arc<AtomicBool>,
    ready: StdMutex<Option<oneshot::Receiver<AnalyzerResult<Response>>>>,
    reader_task: JoinHandle<()>,
}

impl ProtocolChannel {
    /// Start reading `reader` and writing requests to `writer`.
    ///
    /// The startup `READY` expectation is registered before the reader task
    /// starts, so a worker that answers instantly is not missed.
    pub fn spawn<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let pending = Arc::new(StdMutex::new(PendingMap::default()));
        let alive = Arc::new(AtomicBool::new(true));

        let ready_rx = lock(&pending)
            .register(ResponseKind::Ready)
            .map(|(_, rx)| rx)
            .ok();

        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&alive),
            label.clone(),
        ));

        Self {
            label,
            writer: Mutex::new(Box::new(writer)),
            pending,
            alive,
            ready: StdMutex::new(ready_rx),
            reader_task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).entries.len()
    }

    /// Wait for the startup sentinel.
    pub async fn wait_ready(&self, deadline: Duration) -> AnalyzerResult<()> {
        let rx = self
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AnalyzerError::protocol("startup handshake already consumed"))?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(AnalyzerError::worker_crashed("exited during startup")),
            Err(_) => Err(AnalyzerError::StartupTimeout(deadline.as_secs())),
        }
    }

    /// Write one request and wait for its response.
    ///
    /// On deadline expiry the request is withdrawn and `Timeout` returned;
    /// the caller decides what happens to the process. Dropping the future
    /// withdraws the request too.
    pub async fn request(&self, request: &Request, deadline: Duration) -> AnalyzerResult<Response> {
        let line = request.encode()?;
        let kind = match request.expected_response() {
            Some(kind) => kind,
            None => {
                self.write_line(&line).await?;
                return Ok(Response::Done(String::new()));
            }
        };

        let (id, rx) = lock(&self.pending).register(kind)?;
        let _withdraw = PendingGuard {
            pending: &self.pending,
            id,
        };
        debug!(
            worker = %self.label,
            correlation_id = id,
            opcode = request.opcode(),
            "Sending request"
        );

        self.write_line(&line).await?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AnalyzerError::worker_crashed("response channel dropped")),
            Err(_) => Err(AnalyzerError::Timeout(deadline.as_secs())),
        }
    }

    /// Write a raw line (terminator appended).
    pub async fn write_line(&self, line: &str) -> AnalyzerResult<()> {
        if !self.is_alive() {
            return Err(AnalyzerError::worker_crashed("worker is not running"));
        }
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.close(&format!("write failed: {}", e));
            AnalyzerError::worker_crashed(format!("write failed: {}", e))
        })
    }

    /// Stop accepting requests and fail everything pending.
    pub fn close(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.pending).close(reason);
    }
}

impl Drop for ProtocolChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn lock(pending: &StdMutex<PendingMap>) -> std::sync::MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<StdMutex<PendingMap>>,
    alive: Arc<AtomicBool>,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "worker closed its output".to_string(),
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    dispatch(&pending, &label, &line);
                }
            }
            Err(e) => break format!("read failed: {}", e),
        }
    };

    if !lines.is_empty() {
        warn!(worker = %label, "Discarding {} bytes of unterminated output", lines.remainder().len());
    }
    warn!(worker = %label, "Worker output closed: {}", reason);
    alive.store(false, Ordering::SeqCst);
    lock(&pending).close(&reason);
}

fn dispatch(pending: &StdMutex<PendingMap>, label: &str, line: &str) {
    if line.trim().is_empty() {
        return;
    }

    match Response::parse(line) {
        Ok(Some(response)) => {
            let kind = response.kind();
            match lock(pending).take_oldest(kind) {
                Some((id, tx)) => {
                    debug!(worker = %label, correlation_id = id, %kind, "Response received");
                    let _ = tx.send(Ok(response));
                }
                None => warn!(worker = %label, %kind, "Dropping response nobody is waiting for"),
            }
        }
        Ok(None) => {
            warn!(worker = %label, "Dropping unrecognized line: {}", truncate(line, 200));
        }
        Err(malformed) => match lock(pending).take_oldest(malformed.kind) {
            Some((id, tx)) => {
                warn!(worker = %label, correlation_id = id, "Malformed {} frame: {}", malformed.kind, malformed.reason);
                let _ = tx.send(Err(AnalyzerError::protocol(format!(
                    "malformed {} frame: {}",
                    malformed.kind, malformed.reason
                ))));
            }
            None => warn!(worker = %label, "Dropping malformed {} frame: {}", malformed.kind, malformed.reason),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
