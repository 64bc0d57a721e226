//! Full-duplex, id-multiplexed messaging over a worker's pipe pair.
//!
//! One [`Mailbox`] owns the write half of a worker's stdin and the read half
//! of its stdout. Every outbound request gets a fresh id and a slot; a
//! single background demultiplexer reads inbound frames and routes each to
//! the slot registered for its id. Any number of requests may be in flight
//! on one mailbox at once.
//!
//! ```text
//!   send ───▶ [write half]          [read half] ───▶ demultiplexer
//!     │                                                   │
//!     └── slot(id) ◀─────────── fulfill ──────────────────┤
//!              │                                          │
//!   recv(id) ──┘        readable() ◀── counting semaphore ┘
//! ```
//!
//! `readable()` is deliberately id-free: it reports that *some* frame has
//! arrived, which is the pool's cue to put the worker back into rotation
//! while the frame is still being read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;

use brood_types::{codec, SENTINEL};

use crate::error::{PoolError, Result};

type SlotResult = Result<Value>;

/// Rendezvous for one outstanding request id.
///
/// Created by `send`, fulfilled exactly once by the demultiplexer, drained
/// exactly once by `recv`. The entry leaves the table when both sides have
/// done their part.
struct Slot {
    /// Taken by the demultiplexer at fulfillment.
    tx: Option<oneshot::Sender<SlotResult>>,
    /// Taken by `recv` when draining starts.
    rx: Option<oneshot::Receiver<SlotResult>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    fn fulfilled(&self) -> bool {
        self.tx.is_none()
    }
}

struct SlotTable {
    slots: HashMap<u64, Slot>,
    /// No further sends; set by `close()` and when the demultiplexer exits.
    closed: bool,
}

struct Shared {
    table: Mutex<SlotTable>,
    /// Raised by the demultiplexer when a frame is inbound; one permit per
    /// parked `readable()` caller.
    readable: Semaphore,
    /// Callers currently parked in `readable()`. Mutated only while the
    /// table lock is held, so park/fulfill cannot lose a wakeup.
    readable_waiters: AtomicUsize,
    /// Set once the demultiplexer has exited (cleanly or not).
    finished: AtomicBool,
    /// Mirror of `SlotTable::closed` for lock-free liveness checks.
    closed: AtomicBool,
}

/// An id-multiplexed request/response channel over one pipe pair.
pub struct Mailbox {
    shared: Arc<Shared>,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: AtomicU64,
    demux: JoinHandle<()>,
}

impl Mailbox {
    /// Take ownership of a pipe pair and start the demultiplexer.
    pub fn new(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(SlotTable {
                slots: HashMap::new(),
                closed: false,
            }),
            readable: Semaphore::new(0),
            readable_waiters: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let demux = tokio::spawn(demux_loop(BufReader::new(reader), shared.clone()));
        Self {
            shared,
            writer: Mutex::new(Some(writer)),
            next_id: AtomicU64::new(0),
            demux,
        }
    }

    /// Register a slot under a fresh id and write one encoded frame.
    ///
    /// Returns the id to pass to [`recv`](Self::recv). Suspends only on
    /// pipe backpressure.
    pub async fn send(&self, body: &Value) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = codec::encode(id, body)?;
        {
            let mut table = self.shared.table.lock().await;
            if table.closed {
                return Err(PoolError::WorkerDied("mailbox is closed".into()));
            }
            table.slots.insert(id, Slot::new());
        }
        let outcome = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => match w.write_all(&frame).await {
                    Ok(()) => w.flush().await,
                    Err(e) => Err(e),
                },
                None => {
                    self.shared.table.lock().await.slots.remove(&id);
                    return Err(PoolError::WorkerDied("mailbox is closed".into()));
                }
            }
        };
        if let Err(e) = outcome {
            self.shared.table.lock().await.slots.remove(&id);
            return Err(PoolError::Io(e));
        }
        Ok(id)
    }

    /// Wait for the response to `id`; the slot is removed once drained.
    ///
    /// Fails with `WorkerDied` if the stream closes while `id` is pending,
    /// and with `Protocol` if `id` was never sent or already drained.
    pub async fn recv(&self, id: u64) -> Result<Value> {
        let rx = {
            let mut table = self.shared.table.lock().await;
            let slot = table
                .slots
                .get_mut(&id)
                .ok_or_else(|| PoolError::Protocol(format!("recv on unknown or drained id {id}")))?;
            let rx = slot
                .rx
                .take()
                .ok_or_else(|| PoolError::Protocol(format!("second recv on id {id}")))?;
            if slot.fulfilled() {
                table.slots.remove(&id);
            }
            rx
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::WorkerDied("worker exited before responding".into())),
        }
    }

    /// Wait until some response frame has arrived on this mailbox.
    ///
    /// Does not identify which id arrived. Returns immediately when a
    /// fulfilled, undrained slot already exists or the mailbox is closed.
    /// A spurious return is possible and harmless: it only means a caller
    /// acts on "a frame is here" slightly early.
    pub async fn readable(&self) {
        {
            let table = self.shared.table.lock().await;
            if table.closed || table.slots.values().any(Slot::fulfilled) {
                return;
            }
            self.shared.readable_waiters.fetch_add(1, Ordering::SeqCst);
        }
        match self.shared.readable.acquire().await {
            Ok(permit) => permit.forget(),
            // Semaphore closed: the demultiplexer exited.
            Err(_) => {}
        }
        self.shared.readable_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the write half.
    ///
    /// The worker sees EOF on its stdin; the demultiplexer keeps draining
    /// the read half until the worker closes its stdout, so responses
    /// already in the pipe still reach their slots.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.table.lock().await.closed = true;
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// True once `close()` ran or the demultiplexer exited.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// True once the demultiplexer has exited (EOF, fatal error, or abort).
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// The sole reader of the mailbox's input stream.
///
/// Loop: probe readability, signal parked waiters, then consume one frame
/// and route it. Exits on EOF, I/O failure, or a protocol/codec violation.
async fn demux_loop(mut reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>, shared: Arc<Shared>) {
    let failure = loop {
        // Readability probe: a frame is inbound but not yet consumed. Wake
        // parked waiters and yield so the pool can release this worker in
        // parallel with the read below.
        let available = match reader.fill_buf().await {
            Ok(buf) => buf.len(),
            Err(e) => break Some(PoolError::Io(e)),
        };
        if available == 0 {
            break None; // EOF
        }
        let waiters = shared.readable_waiters.load(Ordering::SeqCst);
        if waiters > 0 {
            shared.readable.add_permits(waiters);
            tokio::task::yield_now().await;
        }

        let mut line = Vec::new();
        match reader.read_until(SENTINEL, &mut line).await {
            Ok(0) => break None,
            Ok(_) => {}
            Err(e) => break Some(PoolError::Io(e)),
        }
        let (id, body) = match codec::decode::<Value>(&line) {
            Ok(frame) => frame,
            Err(e) => break Some(PoolError::Codec(e)),
        };
        if let Err(e) = deliver(&shared, id, body).await {
            break Some(e);
        }
    };
    finish(&shared, failure).await;
}

/// Route one decoded frame to its slot.
async fn deliver(shared: &Arc<Shared>, id: u64, body: Value) -> Result<()> {
    let mut table = shared.table.lock().await;
    let slot = match table.slots.get_mut(&id) {
        Some(slot) => slot,
        None => return Err(PoolError::Protocol(format!("response for unknown id {id}"))),
    };
    let tx = match slot.tx.take() {
        Some(tx) => tx,
        None => return Err(PoolError::Protocol(format!("duplicate response for id {id}"))),
    };
    let draining = slot.rx.is_none();
    // A dropped receiver means the caller went away; the response is
    // discarded and the slot retired.
    let delivered = tx.send(Ok(body)).is_ok();
    if draining || !delivered {
        table.slots.remove(&id);
    }
    // Re-signal: a caller may have parked after the pre-read probe.
    let waiters = shared.readable_waiters.load(Ordering::SeqCst);
    if waiters > 0 {
        shared.readable.add_permits(waiters);
    }
    Ok(())
}

/// Demultiplexer epilogue: fail whatever is still pending and unpark
/// everything waiting on this mailbox.
async fn finish(shared: &Shared, failure: Option<PoolError>) {
    let cause = match &failure {
        None => {
            tracing::debug!("mailbox reached end of stream");
            "stream closed".to_string()
        }
        Some(e) => {
            tracing::warn!(error = %e, "mailbox demultiplexer failed");
            e.to_string()
        }
    };
    let mut table = shared.table.lock().await;
    table.closed = true;
    shared.closed.store(true, Ordering::SeqCst);
    table.slots.retain(|_, slot| {
        if let Some(tx) = slot.tx.take() {
            let _ = tx.send(Err(PoolError::WorkerDied(cause.clone())));
        }
        // Entries nobody has started draining stay so a late recv can
        // still pick up the error.
        slot.rx.is_some()
    });
    drop(table);
    shared.finished.store(true, Ordering::SeqCst);
    shared.readable.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use brood_types::{TaskRequest, TaskResponse};
    use serde_json::json;
    use tokio::io::{split, DuplexStream};
    use tokio::time::{timeout, Duration};

    /// A mailbox wired to an in-memory peer; returns the peer's stream.
    fn loopback() -> (Mailbox, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = split(ours);
        (
            Mailbox::new(Box::new(writer), Box::new(reader)),
            theirs,
        )
    }

    /// Peer that answers every request with `status: 0, result: args`.
    async fn echo_peer(stream: DuplexStream) {
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(SENTINEL, &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let (id, request): (u64, TaskRequest) = codec::decode(&line).unwrap();
            let response = TaskResponse::ok(Value::Array(request.args));
            let frame = codec::encode(id, &response).unwrap();
            writer.write_all(&frame).await.unwrap();
        }
    }

    fn request(args: Vec<Value>) -> Value {
        serde_json::to_value(TaskRequest::new("echo", args)).unwrap()
    }

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let id = mailbox.send(&request(vec![json!(5)])).await.unwrap();
        let body = mailbox.recv(id).await.unwrap();
        let response: TaskResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.into_result(), Ok(json!([5])));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let a = mailbox.send(&request(vec![])).await.unwrap();
        let b = mailbox.send(&request(vec![])).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_interleaved_responses_route_by_id() {
        let (mailbox, peer) = loopback();

        // Peer that answers the second request first.
        tokio::spawn(async move {
            let (reader, mut writer) = split(peer);
            let mut reader = BufReader::new(reader);
            let mut frames = Vec::new();
            for _ in 0..2 {
                let mut line = Vec::new();
                reader.read_until(SENTINEL, &mut line).await.unwrap();
                frames.push(line);
            }
            for line in frames.into_iter().rev() {
                let (id, req): (u64, TaskRequest) = codec::decode(&line).unwrap();
                let frame = codec::encode(id, &TaskResponse::ok(Value::Array(req.args))).unwrap();
                writer.write_all(&frame).await.unwrap();
            }
        });

        let first = mailbox.send(&request(vec![json!("a")])).await.unwrap();
        let second = mailbox.send(&request(vec![json!("b")])).await.unwrap();

        let body = mailbox.recv(first).await.unwrap();
        let response: TaskResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.into_result(), Ok(json!(["a"])));

        let body = mailbox.recv(second).await.unwrap();
        let response: TaskResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.into_result(), Ok(json!(["b"])));
    }

    #[tokio::test]
    async fn test_readable_fires_on_arrival() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let id = mailbox.send(&request(vec![json!(1)])).await.unwrap();
        timeout(Duration::from_secs(1), mailbox.readable())
            .await
            .expect("readable should fire once the response is inbound");
        assert!(mailbox.recv(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_readable_returns_for_already_delivered_frame() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let id = mailbox.send(&request(vec![json!(1)])).await.unwrap();
        // Give the demultiplexer time to fully deliver the response.
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Late caller: the frame came and went, readable must not park.
        timeout(Duration::from_secs(1), mailbox.readable())
            .await
            .expect("readable must observe an already-fulfilled slot");
        assert!(mailbox.recv(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_eof_fails_pending_recv() {
        let (mailbox, peer) = loopback();

        let id = mailbox.send(&request(vec![])).await.unwrap();
        drop(peer); // peer hangs up without answering
        match mailbox.recv(id).await {
            Err(PoolError::WorkerDied(_)) => {}
            other => panic!("expected WorkerDied, got {other:?}"),
        }
        assert!(mailbox.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_id_is_fatal() {
        let (mailbox, peer) = loopback();

        let pending = mailbox.send(&request(vec![])).await.unwrap();

        let (_reader, mut writer) = split(peer);
        let frame = codec::encode(9999, &TaskResponse::ok(json!(null))).unwrap();
        writer.write_all(&frame).await.unwrap();

        // The rogue frame kills the mailbox; the pending id fails with it.
        match mailbox.recv(pending).await {
            Err(PoolError::WorkerDied(_)) => {}
            other => panic!("expected WorkerDied, got {other:?}"),
        }
        assert!(mailbox.is_finished());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_fatal() {
        let (mailbox, peer) = loopback();
        let pending = mailbox.send(&request(vec![])).await.unwrap();

        let (_reader, mut writer) = split(peer);
        writer.write_all(b"not a frame\n").await.unwrap();

        assert!(mailbox.recv(pending).await.is_err());
        assert!(mailbox.is_finished());
    }

    #[tokio::test]
    async fn test_recv_twice_is_protocol_error() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let id = mailbox.send(&request(vec![json!(1)])).await.unwrap();
        mailbox.recv(id).await.unwrap();
        match mailbox.recv(id).await {
            Err(PoolError::Protocol(_)) => {}
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mailbox, _peer) = loopback();
        mailbox.close().await;
        assert!(mailbox.send(&request(vec![])).await.is_err());
        assert!(mailbox.is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_inbound_frames() {
        let (mailbox, peer) = loopback();
        tokio::spawn(echo_peer(peer));

        let id = mailbox.send(&request(vec![json!("last")])).await.unwrap();
        mailbox.close().await;

        // The response was inbound when we closed; it must still arrive.
        let body = timeout(Duration::from_secs(1), mailbox.recv(id))
            .await
            .expect("recv must not hang")
            .expect("drained frame must be delivered");
        let response: TaskResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.into_result(), Ok(json!(["last"])));
    }
}
