//! Memory admission for downloads.
//!
//! Every chunk download reserves its decode buffers here before submitting
//! jobs to workers, which bounds how much piece data can be in flight at
//! once. Requests are granted first-come-first-served within a priority
//! class, with user-facing work ahead of background work. A request for zero
//! bytes bypasses the queue entirely: queueing it behind allocated chunks
//! could deadlock against the very chunks holding the memory it does not
//! need.

use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Priority class of a memory request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// User-facing downloads.
    High,
    /// Background work such as repairs.
    Low,
}

struct Waiter {
    amount: u64,
    tx: oneshot::Sender<bool>,
}

struct MemoryState {
    available: u64,
    shutdown: bool,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
}

/// A fixed budget of download memory, handed out in FIFO order per priority.
pub struct MemoryManager {
    total: u64,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    pub fn new(total: u64) -> Self {
        MemoryManager {
            total,
            state: Mutex::new(MemoryState {
                available: total,
                shutdown: false,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
        }
    }

    /// Requests `amount` bytes, waiting until they are available. Returns
    /// false if the manager is shutting down. A zero-byte request always
    /// succeeds immediately.
    pub async fn request(&self, amount: u64, priority: Priority) -> bool {
        if amount == 0 {
            return true;
        }
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                return false;
            }
            let queue_clear = state.high.is_empty()
                && (priority == Priority::High || state.low.is_empty());
            if queue_clear && self.grantable(&state, amount) {
                state.available = state.available.saturating_sub(amount);
                trace!("memory: granted {amount} bytes immediately");
                return true;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { amount, tx };
            match priority {
                Priority::High => state.high.push_back(waiter),
                Priority::Low => state.low.push_back(waiter),
            }
            debug!("memory: queued request for {amount} bytes ({priority:?})");
            rx
        };
        rx.await.unwrap_or(false)
    }

    /// Returns previously granted bytes and wakes whatever waiters now fit.
    pub fn release(&self, amount: u64) {
        let mut state = self.state.lock().unwrap();
        state.available = (state.available + amount).min(self.total);
        self.wake_waiters(&mut state);
    }

    /// Fails all current and future requests.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for waiter in state.high.drain(..) {
            let _ = waiter.tx.send(false);
        }
        for waiter in state.low.drain(..) {
            let _ = waiter.tx.send(false);
        }
    }

    /// Bytes currently unallocated. Snapshot only, for introspection.
    pub fn available(&self) -> u64 {
        self.state.lock().unwrap().available
    }

    // An oversized request (larger than the whole budget) is granted when the
    // manager is otherwise idle; refusing it outright would make large chunks
    // undownloadable no matter how patient the caller is.
    fn grantable(&self, state: &MemoryState, amount: u64) -> bool {
        state.available >= amount || (amount > self.total && state.available == self.total)
    }

    fn wake_waiters(&self, state: &mut MemoryState) {
        loop {
            let amount = match state.high.front().or_else(|| state.low.front()) {
                Some(waiter) => waiter.amount,
                None => return,
            };
            if !self.grantable(state, amount) {
                return;
            }
            let waiter = match state.high.pop_front().or_else(|| state.low.pop_front()) {
                Some(w) => w,
                None => return,
            };
            state.available = state.available.saturating_sub(waiter.amount);
            if waiter.tx.send(true).is_err() {
                // Requester gave up waiting; hand the memory back.
                warn!("memory: waiter vanished before grant");
                state.available = (state.available + waiter.amount).min(self.total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn grants_within_budget() {
        let mm = MemoryManager::new(100);
        assert!(mm.request(60, Priority::High).await);
        assert!(mm.request(40, Priority::Low).await);
        assert_eq!(mm.available(), 0);
        mm.release(60);
        assert_eq!(mm.available(), 60);
    }

    #[tokio::test]
    async fn zero_byte_requests_bypass_the_queue() {
        let mm = MemoryManager::new(10);
        assert!(mm.request(10, Priority::High).await);
        // Budget exhausted, yet the empty request must not block.
        assert!(mm.request(0, Priority::Low).await);
    }

    #[tokio::test]
    async fn waiters_run_high_before_low() {
        let mm = Arc::new(MemoryManager::new(10));
        assert!(mm.request(10, Priority::High).await);

        let low = {
            let mm = Arc::clone(&mm);
            tokio::spawn(async move { mm.request(10, Priority::Low).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let high = {
            let mm = Arc::clone(&mm);
            tokio::spawn(async move { mm.request(10, Priority::High).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One release can satisfy exactly one of them: high wins despite
        // arriving later.
        mm.release(10);
        assert!(tokio::time::timeout(Duration::from_secs(1), high)
            .await
            .unwrap()
            .unwrap());
        assert!(!low.is_finished());

        mm.release(10);
        assert!(tokio::time::timeout(Duration::from_secs(1), low)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn oversized_request_granted_when_idle() {
        let mm = MemoryManager::new(100);
        assert!(mm.request(500, Priority::High).await);
        mm.release(500);
        assert_eq!(mm.available(), 100);
    }

    #[tokio::test]
    async fn shutdown_fails_waiters() {
        let mm = Arc::new(MemoryManager::new(10));
        assert!(mm.request(10, Priority::High).await);
        let blocked = {
            let mm = Arc::clone(&mm);
            tokio::spawn(async move { mm.request(5, Priority::High).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mm.shutdown();
        assert!(!tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap());
        assert!(!mm.request(1, Priority::Low).await);
    }
}
