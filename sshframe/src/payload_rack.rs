// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A one-shot, time-bounded delivery slot: either the payload is collected
//! within `timeout`, or a fallback fires instead. Generalizes
//! `daemon::exit_notify::ExitNotifier` (a `Mutex<Option<i32>> + Condvar`
//! wait-for-exit-status slot) to an async, generic, cancelable-timer
//! version that races a release against a timeout rather than a caller
//! polling with its own timeout argument.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle};

struct Inner<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    fired: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Stores a payload for up to `timeout`, after which a fallback closure
/// runs instead of the normal collector. A negative timeout (expressed
/// here as `None`) starts no timer at all, leaving the slot armed for
/// whoever calls `release()` to claim it directly, matching the
/// original's `timeout <= -1` immediate-release case.
pub struct PayloadRack<T> {
    inner: Arc<Inner<T>>,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> PayloadRack<T> {
    /// `timeout = None` means "resolve immediately, never start a timer,"
    /// matching the Go original's negative-timeout convention.
    pub fn new(timeout: Option<Duration>) -> Self {
        PayloadRack {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                notify: Notify::new(),
                fired: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
            timeout,
        }
    }

    /// Loads the payload and, if a positive timeout was configured, spawns
    /// a timer task that invokes `on_timeout` if `release()` hasn't already
    /// claimed the payload by the time the timer fires. The timer's
    /// `JoinHandle` is kept on the rack itself so `release()` can abort it
    /// on a successful collect rather than leaving it to run to completion.
    pub fn load<F>(&self, payload: T, on_timeout: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        *self.inner.slot.lock().expect("payload rack lock poisoned") = Some(payload);

        let Some(timeout) = self.timeout else {
            // Negative-timeout convention: no timer ever races `release()`,
            // so the slot is left armed for `release()` to claim. `fired`
            // stays false; marking it here would make `release()`'s own
            // compare_exchange fail and strand the payload in `slot`.
            return;
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if inner.fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                let taken = inner.slot.lock().expect("payload rack lock poisoned").take();
                if let Some(taken) = taken {
                    on_timeout(taken);
                }
                inner.notify.notify_waiters();
            }
        });
        *self.inner.timer.lock().expect("payload rack lock poisoned") = Some(handle);
    }

    /// Collects the payload, aborting the pending timeout timer if one is
    /// running. If the timeout already fired and claimed the payload, this
    /// returns `None`.
    pub async fn release(&self) -> Option<T> {
        if self.inner.fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            if let Some(timer) = self.inner.timer.lock().expect("payload rack lock poisoned").take() {
                timer.abort();
            }
            return self.inner.slot.lock().expect("payload rack lock poisoned").take();
        }
        // Timeout already won the race.
        None
    }

    /// Waits until either `release()` or the timeout fallback has run,
    /// without itself claiming the payload. Useful for tests that want to
    /// observe "has this rack settled" without holding the collecting end.
    pub fn settled(&self) -> impl Future<Output = ()> + '_ {
        let notified = self.inner.notify.notified();
        async move {
            if self.inner.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    #[timeout(5000)]
    async fn release_wins_before_timeout() {
        let rack: PayloadRack<u32> = PayloadRack::new(Some(Duration::from_secs(5)));
        rack.load(7, |_| panic!("timeout fallback must not run"));
        let got = rack.release().await;
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn timeout_fires_fallback_when_nobody_collects() {
        let rack: PayloadRack<u32> = PayloadRack::new(Some(Duration::from_millis(20)));
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        rack.load(42, move |v| {
            seen_clone.store(v, Ordering::SeqCst);
        });
        rack.settled().await;
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn negative_timeout_releases_immediately() {
        let rack: PayloadRack<u32> = PayloadRack::new(None);
        rack.load(9, |_| panic!("no timer should have been started"));
        let got = rack.release().await;
        assert_eq!(got, Some(9));
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn release_after_timeout_gets_nothing() {
        let rack: PayloadRack<u32> = PayloadRack::new(Some(Duration::from_millis(10)));
        rack.load(3, |_| {});
        rack.settled().await;
        let got = rack.release().await;
        assert_eq!(got, None);
    }
}
