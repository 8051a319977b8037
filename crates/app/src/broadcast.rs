//! Bounded fan-out from the processing loop to telemetry consumers.
//!
//! Every consumer owns a queue of capacity 2 with drop-oldest overflow: a
//! stalled consumer costs the producer nothing and always finds the freshest
//! payloads when it resumes. The registry lock is held only around
//! add/remove/iterate; each queue has its own lock bounding one enqueue, so
//! no consumer's delivery ever serializes behind another's.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::Notify;
use tracing::debug;

/// Pending payloads retained per consumer.
pub const CHANNEL_CAPACITY: usize = 2;

struct ChannelInner {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
}

/// One consumer's handle onto its queue.
pub struct Subscription {
    id: u64,
    inner: Arc<ChannelInner>,
}

impl Subscription {
    /// Wait for the next payload. Order matches production order; payloads
    /// displaced by the overflow policy are simply never seen. Returns
    /// `None` once the channel has been closed.
    pub async fn recv(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            if let Ok(mut queue) = self.inner.queue.lock() {
                if let Some(message) = queue.pop_front() {
                    return Some(message);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Payloads currently queued and not yet received.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // broadcast() reaps the channel on its next pass
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Registry of per-consumer channels fed by the single producer.
#[derive(Default)]
pub struct BroadcastHub {
    channels: Mutex<HashMap<u64, Arc<ChannelInner>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue for a newly connected consumer.
    pub fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ChannelInner {
            queue: Mutex::new(VecDeque::with_capacity(CHANNEL_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(id, inner.clone());
        }
        debug!("telemetry channel #{id} registered");
        Subscription { id, inner }
    }

    /// Remove a consumer's queue; pending payloads are discarded.
    pub fn deregister(&self, subscription: &Subscription) {
        subscription.inner.closed.store(true, Ordering::Release);
        subscription.inner.notify.notify_one();
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&subscription.id);
        }
        debug!("telemetry channel #{} deregistered", subscription.id);
    }

    /// Number of live consumers.
    pub fn len(&self) -> usize {
        self.channels.lock().map(|channels| channels.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan one serialized payload out to every live consumer without ever
    /// blocking.
    ///
    /// A full queue gives up its oldest entry to make room; channels whose
    /// consumer recorded a failure are skipped and removed in the same pass.
    /// Returns the number of payloads displaced by the overflow policy.
    pub fn broadcast(&self, message: &str) -> usize {
        let Ok(mut channels) = self.channels.lock() else {
            return 0;
        };

        let mut displaced = 0;
        let mut stale = Vec::new();
        for (id, inner) in channels.iter() {
            if inner.closed.load(Ordering::Acquire) {
                stale.push(*id);
                continue;
            }
            if let Ok(mut queue) = inner.queue.lock() {
                if queue.len() >= CHANNEL_CAPACITY {
                    queue.pop_front();
                    displaced += 1;
                }
                queue.push_back(message.to_string());
            }
            inner.notify.notify_one();
        }
        for id in stale {
            channels.remove(&id);
            debug!("reaped dead telemetry channel #{id}");
        }
        displaced
    }
}
