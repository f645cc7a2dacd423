//! Retry queue and event-driven dispatcher
//!
//! A statement that comes back WAITING gets an immediate
//! `queued_for_retry` response while a `RetryItem` carrying the
//! transaction's wait event lands in this priority queue (enqueue
//! timestamp, FIFO on ties). One dispatcher task drains the queue: it
//! waits on the item's event (with a safety timeout, so a lost signal
//! degrades to a slow retry instead of a hang), re-invokes the statement,
//! and pushes the follow-up response to the client. A retry that blocks
//! again is re-enqueued with a fresh event; items whose client is gone
//! are dropped silently.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::Notify;

use super::message::Response;
use super::ClientRegistry;
use crate::ccm::{TxnId, WaitEvent};
use crate::processor::{QueryProcessor, StatementOutcome};

/// How long the dispatcher waits on an event before retrying anyway.
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A parked statement awaiting its transaction's wake-up.
pub struct RetryItem {
    pub client_id: u64,
    pub txid: TxnId,
    pub query: String,
    /// The statement ran in an implicit transaction the retry must finish.
    pub auto_commit: bool,
    /// Wait event to block on; absent events degrade to a short sleep.
    pub event: Option<Arc<WaitEvent>>,
}

struct HeapEntry {
    priority: (u64, u64), // (enqueue millis, sequence); FIFO on ties
    item: RetryItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Priority queue of retry items, min-first by enqueue time.
pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn push(&self, item: RetryItem) {
        let priority = (Self::now_millis(), self.seq.fetch_add(1, Ordering::Relaxed));
        debug!(
            "retry queued for txn {} (client {})",
            item.txid, item.client_id
        );
        self.heap
            .lock()
            .expect("retry queue mutex poisoned")
            .push(Reverse(HeapEntry { priority, item }));
        self.notify.notify_one();
    }

    /// Await the next item.
    pub async fn pop(&self) -> RetryItem {
        loop {
            let notified = self.notify.notified();
            if let Some(Reverse(entry)) = self.heap.lock().expect("retry queue mutex poisoned").pop()
            {
                return entry.item;
            }
            notified.await;
        }
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatcher task: park, wake, re-execute, push the follow-up.
pub async fn run_dispatcher(
    queue: Arc<RetryQueue>,
    processor: Arc<QueryProcessor>,
    clients: Arc<ClientRegistry>,
) {
    info!("retry dispatcher running");
    loop {
        let item = queue.pop().await;

        match &item.event {
            Some(event) => {
                let signaled = event.wait_timeout(EVENT_WAIT_TIMEOUT).await;
                if !signaled {
                    warn!(
                        "event wait timed out for txn {}, retrying anyway",
                        item.txid
                    );
                }
            }
            None => tokio::time::sleep(Duration::from_millis(500)).await,
        }

        // Client gone: drop the item silently.
        let sender = match clients.sender(item.client_id) {
            Some(sender) => sender,
            None => {
                debug!(
                    "client {} disconnected, dropping retry for txn {}",
                    item.client_id, item.txid
                );
                continue;
            }
        };

        debug!("retrying statement for txn {}", item.txid);
        let outcome = processor.resume_query(&item.query, item.txid, item.auto_commit);
        let response = match outcome {
            StatementOutcome::Done(result) => Response::from(result).retried(item.txid),
            StatementOutcome::Blocked { txid, .. } => {
                // Still conflicting: tell the client and park again with a
                // fresh event.
                queue.push(RetryItem {
                    client_id: item.client_id,
                    txid,
                    query: item.query.clone(),
                    auto_commit: item.auto_commit,
                    event: processor.ccm().wait_event(txid),
                });
                Response::queued("lock conflict persists").retried(item.txid)
            }
        };

        if sender.send(response).is_err() {
            debug!(
                "client {} closed before retry result delivery",
                item.client_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(txid: TxnId) -> RetryItem {
        RetryItem {
            client_id: 1,
            txid,
            query: String::new(),
            auto_commit: false,
            event: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RetryQueue::new();
        queue.push(item(1));
        queue.push(item(2));
        queue.push(item(3));

        assert_eq!(queue.pop().await.txid, 1);
        assert_eq!(queue.pop().await.txid, 2);
        assert_eq!(queue.pop().await.txid, 3);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(RetryQueue::new());
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.txid })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(item(42));
        assert_eq!(popper.await.unwrap(), 42);
    }
}
