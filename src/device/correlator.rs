use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::protocol::{DecodedMessage, Filter};

use super::{DeviceError, Result};

struct Waiter {
    id: u64,
    filter: Filter,
    tx: oneshot::Sender<Result<DecodedMessage>>,
}

/// Handle to a registered waiter; pass back to [`Correlator::resolve`].
pub struct PendingWait {
    id: u64,
    rx: oneshot::Receiver<Result<DecodedMessage>>,
}

impl PendingWait {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Multiplexes one inbound message stream into many outstanding waiters.
///
/// Each waiter pairs a [`Filter`] with a one-shot resolver. Dispatch walks
/// the table newest-first and resolves every waiter whose filter matches —
/// a single heartbeat may satisfy several gates at once. Lifetimes are
/// bounded by the caller's timeout or by [`Correlator::cancel_all`].
pub struct Correlator {
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a waiter immediately, so a reply arriving before the
    /// caller awaits cannot be lost.
    pub fn register(&self, filter: Filter) -> PendingWait {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().push(Waiter { id, filter, tx });
        PendingWait { id, rx }
    }

    /// Await a registered waiter, failing with `Timeout` after `budget`,
    /// or `Cancelled` if the correlator shuts down first. The waiter is
    /// deregistered on every exit path.
    pub async fn resolve(&self, pending: PendingWait, budget: Duration) -> Result<DecodedMessage> {
        match timeout(budget, pending.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::Cancelled),
            Err(_) => {
                self.deregister(pending.id);
                Err(DeviceError::Timeout)
            }
        }
    }

    /// Await the first message matching `filter` within `budget`.
    pub async fn wait_for(&self, filter: Filter, budget: Duration) -> Result<DecodedMessage> {
        let pending = self.register(filter);
        self.resolve(pending, budget).await
    }

    /// Drop a registered waiter without resolving it.
    pub fn deregister(&self, id: u64) {
        self.lock().retain(|w| w.id != id);
    }

    /// Deliver one inbound message; returns how many waiters it resolved.
    pub fn dispatch(&self, msg: &DecodedMessage) -> usize {
        let mut waiters = self.lock();
        let mut resolved = 0;
        let mut i = waiters.len();
        while i > 0 {
            i -= 1;
            if waiters[i].filter.matches(msg) {
                let waiter = waiters.remove(i);
                let _ = waiter.tx.send(Ok(msg.clone()));
                resolved += 1;
            }
        }
        resolved
    }

    /// Resolve every pending waiter with `Cancelled`.
    pub fn cancel_all(&self) {
        for waiter in self.lock().drain(..) {
            let _ = waiter.tx.send(Err(DeviceError::Cancelled));
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().expect("correlator lock poisoned")
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
