//! FIFO async mutex
//!
//! The registry and broker tables are mutated by check-then-act sequences
//! racing across tunnel connections; this lock serializes them with strict
//! arrival-order fairness, which `tokio::sync::Mutex` does not promise.
//! Release happens only through the RAII guard, so a double release cannot
//! be written.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Mutual exclusion with asynchronous waiters served in arrival order
pub struct FairMutex<T> {
    state: Mutex<LockState>,
    value: UnsafeCell<T>,
}

// Guard existence proves exclusive access to `value`
unsafe impl<T: Send> Send for FairMutex<T> {}
unsafe impl<T: Send> Sync for FairMutex<T> {}

impl<T> FairMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, suspending until this caller is the holder
    pub async fn lock(&self) -> FairMutexGuard<'_, T> {
        let handoff = {
            let mut state = self.state.lock().unwrap();
            if state.locked {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.locked = true;
                None
            }
        };

        if let Some(rx) = handoff {
            // the releasing guard sends exactly one handoff per waiter
            let _ = rx.await;
        }
        FairMutexGuard { mutex: self }
    }
}

/// Holder of a [`FairMutex`]; releases on drop
pub struct FairMutexGuard<'a, T> {
    mutex: &'a FairMutex<T>,
}

impl<T> Deref for FairMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for FairMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for FairMutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock().unwrap();
        loop {
            match state.waiters.pop_front() {
                // hand ownership straight to the queue head; waiters that
                // gave up while queued are skipped
                Some(next) => {
                    if next.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_single_holder() {
        let mutex = Arc::new(FairMutex::new(0u32));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let mutex = mutex.clone();
            handles.push(tokio::spawn(async move {
                let mut value = mutex.lock().await;
                let read = *value;
                tokio::task::yield_now().await;
                *value = read + 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*mutex.lock().await, 50);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let mutex = Arc::new(FairMutex::new(()));
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        let first = mutex.lock().await;
        for i in 0..10 {
            let mutex = mutex.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock().await;
                order_tx.send(i).unwrap();
            });
            // make sure waiter i is queued before waiter i + 1
            sleep(Duration::from_millis(10)).await;
        }
        drop(first);

        for expected in 0..10 {
            let got = timeout(Duration::from_secs(5), order_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let mutex = Arc::new(FairMutex::new(()));
        let held = mutex.lock().await;

        let abandoned = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                let _guard = mutex.lock().await;
            })
        };
        sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        // the lock is still acquirable after the queued waiter vanished
        timeout(Duration::from_secs(1), mutex.lock()).await.unwrap();
    }
}
