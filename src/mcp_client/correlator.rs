//! Request/reply correlation.
//!
//! Many logical calls share one ordered byte stream. Each call gets a fresh
//! id and a oneshot slot in the pending table; a single reader task routes
//! every reply to the slot with the matching id. A call resolves exactly
//! once: by its reply, by its deadline, by cancellation, or by transport loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::errors::McpError;
use super::transport::{FrameReader, FrameSink, ReadFrame};
use super::types::{
    error_codes, methods, InboundFrame, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ReplyBody, RequestId,
};

/// Bytes of an undecodable frame included in the warning.
const FRAME_PREVIEW_BYTES: usize = 200;

type Slot = oneshot::Sender<Result<Value, McpError>>;

/// One outstanding request.
struct PendingCall {
    method: String,
    deadline: Instant,
    slot: Slot,
}

/// Why the correlator stopped accepting calls.
#[derive(Debug, Clone)]
enum Closed {
    Lost(String),
    Cancelled,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<RequestId, PendingCall>,
    closed: Option<Closed>,
}

/// Multiplexes concurrent calls over one [`FrameSink`].
pub struct Correlator {
    sink: Arc<dyn FrameSink>,
    next_id: AtomicU64,
    table: Mutex<PendingTable>,
    limiter: Option<Semaphore>,
}

impl Correlator {
    /// `max_in_flight` caps concurrent outstanding calls; `None` is unlimited.
    pub fn new(sink: Arc<dyn FrameSink>, max_in_flight: Option<usize>) -> Self {
        Self {
            sink,
            next_id: AtomicU64::new(1),
            table: Mutex::new(PendingTable::default()),
            limiter: max_in_flight.map(|n| Semaphore::new(n.max(1))),
        }
    }

    /// A fresh id. Never reused for the lifetime of this correlator.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.table().calls.len()
    }

    /// Send a request and wait for its reply.
    ///
    /// The deadline covers waiting for an in-flight slot as well as the reply.
    /// Dropping the returned future withdraws the call; a reply arriving
    /// afterwards is discarded.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || McpError::Timeout {
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let _permit = match self.limiter {
            Some(ref limiter) => Some(
                tokio::time::timeout_at(deadline, limiter.acquire())
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|_| McpError::Cancelled {
                        method: method.to_string(),
                    })?,
            ),
            None => None,
        };

        let id = self.next_id();
        let reply = self.register(id, method, deadline)?;
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        let frame = JsonRpcRequest::new(id, method, params).encode()?;
        tracing::debug!(id, method, "dispatching request");

        // A write stuck on a full pipe counts against the deadline too.
        let exchange = async {
            self.sink.write_frame(&frame).await?;
            match reply.await {
                Ok(result) => result,
                Err(_) => Err(McpError::Cancelled {
                    method: method.to_string(),
                }),
            }
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(id, method, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(timed_out())
            }
        }
    }

    /// Send a notification. No reply is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if let Some(closed) = self.table().closed.clone() {
            return Err(closed_error(&closed, method));
        }
        let frame = JsonRpcNotification::new(method, params).encode()?;
        self.sink.write_frame(&frame).await
    }

    fn register(
        &self,
        id: RequestId,
        method: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<Value, McpError>>, McpError> {
        let (slot, reply) = oneshot::channel();
        let mut table = self.table();
        if let Some(ref closed) = table.closed {
            return Err(closed_error(closed, method));
        }
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                deadline,
                slot,
            },
        );
        Ok(reply)
    }

    fn remove(&self, id: RequestId) -> Option<PendingCall> {
        self.table().calls.remove(&id)
    }

    /// Route one inbound frame.
    ///
    /// Nothing here is fatal: undecodable frames and replies nobody waits
    /// for are logged and dropped. Never waits on the write half.
    pub fn route(&self, frame: &[u8]) {
        match InboundFrame::decode(frame) {
            Ok(InboundFrame::Reply { id, body }) => self.resolve(id, body),
            Ok(InboundFrame::Notification { method, .. }) => {
                tracing::debug!(method, "server notification");
            }
            Ok(InboundFrame::Request { id, method, .. }) => {
                self.answer_server_request(id, &method);
            }
            Err(e) => {
                tracing::warn!(error = %e, frame = %preview(frame), "discarding frame");
            }
        }
    }

    fn resolve(&self, id: RequestId, body: ReplyBody) {
        let Some(call) = self.remove(id) else {
            tracing::warn!(id, "discarding reply for unknown request id");
            return;
        };

        let result = match body {
            ReplyBody::Result(value) => Ok(value),
            ReplyBody::Error(err) => Err(err.into()),
            ReplyBody::Empty => Err(McpError::protocol(format!(
                "reply to '{}' has neither result nor error",
                call.method
            ))),
        };

        let late_by = Instant::now().saturating_duration_since(call.deadline);
        tracing::debug!(id, method = %call.method, ok = result.is_ok(), late_ms = late_by.as_millis() as u64, "reply routed");

        // The caller may have given up between removal and send.
        let _ = call.slot.send(result);
    }

    fn answer_server_request(&self, id: Value, method: &str) {
        let reply = if method == methods::PING {
            JsonRpcResponse::success(id, serde_json::json!({}))
        } else {
            tracing::debug!(method, "rejecting unsupported server request");
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(error_codes::METHOD_NOT_FOUND, format!("method not found: {method}")),
            )
        };

        let frame = match reply.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(method, error = %e, "failed to encode answer to server request");
                return;
            }
        };

        // Answered off the reader so a full stdin cannot stall stdout.
        let sink = Arc::clone(&self.sink);
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(e) = sink.write_frame(&frame).await {
                tracing::warn!(method = %method, error = %e, "failed to answer server request");
            }
        });
    }

    /// Withdraw one call. Returns `false` if it had already resolved.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.remove(id) {
            Some(call) => {
                let method = call.method.clone();
                let _ = call.slot.send(Err(McpError::Cancelled { method }));
                true
            }
            None => false,
        }
    }

    /// Withdraw every pending call and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        let drained = self.close_with(Closed::Cancelled);
        let count = drained.len();
        for (_, call) in drained {
            let method = call.method.clone();
            let _ = call.slot.send(Err(McpError::Cancelled { method }));
        }
        if count > 0 {
            tracing::debug!(count, "cancelled pending calls");
        }
        count
    }

    /// Resolve every pending call with `ConnectionLost` and refuse new ones.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained = self.close_with(Closed::Lost(reason.to_string()));
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.slot.send(Err(McpError::connection_lost(reason)));
        }
        if count > 0 {
            tracing::warn!(count, reason, "connection lost with calls in flight");
        }
        count
    }

    fn close_with(&self, closed: Closed) -> Vec<(RequestId, PendingCall)> {
        let mut table = self.table();
        table.closed.get_or_insert(closed);
        table.calls.drain().collect()
    }

    /// Start the background reader.
    ///
    /// Routes frames until the stream ends, then calls `on_lost` and fails
    /// every pending call with `ConnectionLost`, in that order.
    pub fn spawn_reader<F>(self: &Arc<Self>, mut reader: FrameReader, on_lost: F) -> JoinHandle<()>
    where
        F: FnOnce(&McpError) + Send + 'static,
    {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                match reader.read_frame().await {
                    Ok(ReadFrame::Frame(frame)) => correlator.route(&frame),
                    Ok(ReadFrame::Eof) => break "server closed its output".to_string(),
                    Err(e) => break e.to_string(),
                }
            };

            tracing::debug!(reason = %reason, "reader stopped");
            on_lost(&McpError::connection_lost(reason.clone()));
            correlator.fail_all(&reason);
        })
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its call from the table when the dispatching future ends.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.remove(self.id);
    }
}

fn closed_error(closed: &Closed, method: &str) -> McpError {
    match closed {
        Closed::Lost(reason) => McpError::connection_lost(reason.clone()),
        Closed::Cancelled => McpError::Cancelled {
            method: method.to_string(),
        },
    }
}

fn preview(frame: &[u8]) -> String {
    let end = frame.len().min(FRAME_PREVIEW_BYTES);
    String::from_utf8_lossy(&frame[..end]).into_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
