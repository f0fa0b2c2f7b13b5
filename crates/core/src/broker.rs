//! Request queue broker
//!
//! Owns one FIFO queue per module, accepts enqueued requests from front-end
//! callers, serves them to long-polling workers, and correlates each
//! worker-posted result back to the blocked caller.
//!
//! # Architecture
//!
//! ```text
//! caller ──► enqueue ──► [bounded FIFO queue] ──► dequeue ──► worker
//!    │                                                          │
//!    └──◄── pending-response slot ◄───────── set_result ◄───────┘
//! ```
//!
//! Each enqueued request registers a single-assignment pending-response
//! slot keyed by its `reqid`; the caller suspends on that slot until a
//! worker posts a result or the timeout/cancellation fires. A dequeue is a
//! hand-off: the request leaves the queue the moment a worker receives it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::QueueSettings;
use crate::error::{Error, Result};
use crate::payload::{ModuleResponse, QueuedRequest};

/// Status-poll chatter that would drown the logs if traced per request.
const DO_NOT_LOG_COMMANDS: &[&str] = &[
    "list-custom",
    "get_module_status",
    "status",
    "get_status",
    "get_command_status",
];

fn should_log(reqtype: &str) -> bool {
    !DO_NOT_LOG_COMMANDS.contains(&reqtype)
}

/// One module's FIFO queue.
///
/// The single receiver behind a fair async mutex gives mutual exclusion on
/// removal (no request can be handed to two workers) and FIFO wakeup across
/// competing dequeue calls: tokio's `Mutex` queues waiters in arrival
/// order, so the longest-waiting worker is served first.
struct ModuleQueue {
    tx: mpsc::Sender<QueuedRequest>,
    rx: Mutex<mpsc::Receiver<QueuedRequest>>,
}

impl ModuleQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// The request/response broker.
///
/// Cheap to share behind an `Arc`; queue operations on independent modules
/// never contend (per-queue locking, sharded maps).
pub struct QueueBroker {
    settings: QueueSettings,
    queues: DashMap<String, Arc<ModuleQueue>>,
    pending: DashMap<String, oneshot::Sender<ModuleResponse>>,
}

impl QueueBroker {
    /// Creates a broker with the given queue settings.
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            queues: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Queue names are case-insensitive.
    fn normalize(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Ensures a named queue exists. Idempotent; a second call for the same
    /// name is a no-op.
    pub fn create_queue(&self, name: &str) {
        let name = Self::normalize(name);
        self.queues
            .entry(name)
            .or_insert_with(|| Arc::new(ModuleQueue::new(self.settings.max_queue_length)));
    }

    /// Whether a queue with this name exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(&Self::normalize(name))
    }

    /// Number of requests currently buffered in a queue, or `None` for an
    /// unknown queue. Entries whose caller has already given up still count
    /// until a worker skips past them.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues.get(&Self::normalize(name)).map(|q| q.depth())
    }

    /// Pushes a request onto a named queue and waits for the worker's
    /// response.
    ///
    /// Fails with [`Error::QueueNotFound`] if the queue was never created
    /// and [`Error::QueueFull`] if its buffer is at capacity. Otherwise the
    /// caller suspends until a matching [`QueueBroker::set_result`] arrives,
    /// `timeout` elapses ([`Error::RequestTimeout`]), or `cancel` fires
    /// ([`Error::Cancelled`]). On every failure path the pending-response
    /// slot is removed, so a late result for this request is discarded.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        request: QueuedRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ModuleResponse> {
        let name = Self::normalize(queue_name);
        let queue = self
            .queues
            .get(&name)
            .map(|q| q.value().clone())
            .ok_or_else(|| Error::QueueNotFound(name.clone()))?;

        let reqid = request.reqid.clone();
        let reqtype = request.reqtype.clone();

        // Link a completion slot to the request id before the request is
        // visible to workers, so a fast worker can never respond into a void.
        let (slot_tx, slot_rx) = oneshot::channel();
        match self.pending.entry(reqid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::DuplicateRequestId(reqid));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(slot_tx);
            }
        }

        if let Err(e) = queue.tx.try_send(request) {
            self.pending.remove(&reqid);
            return match e {
                mpsc::error::TrySendError::Full(_) => Err(Error::QueueFull {
                    queue: name,
                    reqid,
                }),
                mpsc::error::TrySendError::Closed(_) => Err(Error::QueueNotFound(name)),
            };
        }

        if should_log(&reqtype) {
            trace!(queue = %name, %reqtype, %reqid, "Client request queued");
        }

        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(Error::Cancelled {
                context: format!("#reqid {reqid}"),
            }),

            outcome = tokio::time::timeout(timeout, slot_rx) => match outcome {
                Ok(Ok(response)) => Ok(response),
                // The slot vanished without a result; treat it like a
                // timeout rather than surfacing broker internals.
                Ok(Err(_)) => Err(Error::RequestTimeout { reqid: reqid.clone() }),
                Err(_) => Err(Error::RequestTimeout { reqid: reqid.clone() }),
            },
        };

        if result.is_err() {
            // The request itself may still sit in the queue; dequeue skips
            // entries whose slot is gone, which removes it observably.
            self.pending.remove(&reqid);
        }

        result
    }

    /// Pulls the oldest pending request from a queue, long-poll style.
    ///
    /// Returns `Ok(None)` when `timeout` elapses with no work - the worker
    /// is expected to immediately poll again. Requests whose caller has
    /// already timed out or cancelled are silently discarded, never handed
    /// to a worker.
    pub async fn dequeue(
        &self,
        queue_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<QueuedRequest>> {
        let name = Self::normalize(queue_name);
        let queue = self
            .queues
            .get(&name)
            .map(|q| q.value().clone())
            .ok_or_else(|| Error::QueueNotFound(name.clone()))?;

        let deadline = Instant::now() + timeout;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };

            let received = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { context: name });
                }

                outcome = tokio::time::timeout(remaining, async {
                    queue.rx.lock().await.recv().await
                }) => match outcome {
                    Err(_) => return Ok(None),
                    // Sender side gone: broker is being torn down.
                    Ok(None) => return Ok(None),
                    Ok(Some(request)) => request,
                },
            };

            // A dequeue is a hand-off, but only of live requests: entries
            // whose pending slot is missing (caller timed out, cancelled, or
            // already answered) are dropped here.
            let live = self
                .pending
                .get(&received.reqid)
                .map(|slot| !slot.is_closed())
                .unwrap_or(false);

            if live {
                if should_log(&received.reqtype) {
                    trace!(
                        queue = %name,
                        reqtype = %received.reqtype,
                        reqid = %received.reqid,
                        "Request dequeued"
                    );
                }
                return Ok(Some(received));
            }

            debug!(
                queue = %name,
                reqid = %received.reqid,
                "Discarding expired request during dequeue"
            );
        }
    }

    /// Resolves the pending-response slot for a request.
    ///
    /// Returns `false` when the reqid is unknown or its caller already went
    /// away (a late or duplicate result); that is logged and dropped, never
    /// surfaced as an error. Resolution consumes the slot, so a second call
    /// for the same reqid is a no-op.
    pub fn set_result(&self, reqid: &str, response: ModuleResponse) -> bool {
        let Some((_, slot)) = self.pending.remove(reqid) else {
            debug!(%reqid, "Dropping result for unknown or expired request");
            return false;
        };

        if slot.send(response).is_err() {
            debug!(%reqid, "Caller went away before the result arrived");
            return false;
        }

        trace!(%reqid, "Response delivered to waiting caller");
        true
    }
}
