// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trigger-once cancellation signals

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

/// A cloneable, trigger-once cancellation signal.
///
/// Every clone observes the same state. Signals can be [`link`](Self::link)ed so that
/// aborting either one aborts the other, which is how a caller-supplied signal and a
/// session's own signal are tied together. [`follow`](Self::follow) is the one-way
/// variant.
///
/// ```
/// use pushstream::AbortSignal;
///
/// let session = AbortSignal::new();
/// let caller = AbortSignal::new();
/// session.link(&caller);
///
/// assert!(caller.abort());
/// assert!(session.is_aborted());
/// assert!(!session.abort(), "already triggered");
/// ```
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

struct Inner {
    aborted: watch::Sender<bool>,
    /// Signals aborted along with this one.
    linked: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn abort(&self) -> bool {
        let triggered = self.aborted.send_if_modified(|aborted| {
            let was_aborted = *aborted;
            *aborted = true;
            !was_aborted
        });
        if triggered {
            // The list is taken so that propagation back to us stops immediately.
            let linked = std::mem::take(&mut *self.linked());
            for other in linked.iter().filter_map(Weak::upgrade) {
                other.abort();
            }
        }
        triggered
    }

    fn linked(&self) -> MutexGuard<'_, Vec<Weak<Inner>>> {
        self.linked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                aborted,
                linked: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Triggers the signal; returns `true` only for the call that actually triggered it.
    pub fn abort(&self) -> bool {
        self.inner.abort()
    }

    pub fn is_aborted(&self) -> bool {
        *self.inner.aborted.borrow()
    }

    /// Resolves once the signal has been triggered.
    ///
    /// # Cancel Safety
    ///
    /// This is cancel safe.
    pub async fn aborted(&self) {
        let mut receiver = self.inner.aborted.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = receiver.wait_for(|&aborted| aborted).await;
    }

    /// Ties two signals together in both directions.
    ///
    /// If either is already aborted, the other is aborted immediately.
    pub fn link(&self, other: &AbortSignal) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        self.inner.linked().push(Arc::downgrade(&other.inner));
        other.inner.linked().push(Arc::downgrade(&self.inner));
        if self.is_aborted() {
            other.abort();
        }
        if other.is_aborted() {
            self.abort();
        }
    }

    /// Aborts `self` whenever `source` is aborted, but not the other way around.
    ///
    /// If `source` is already aborted, `self` is aborted immediately.
    pub fn follow(&self, source: &AbortSignal) {
        if Arc::ptr_eq(&self.inner, &source.inner) {
            return;
        }
        source.inner.linked().push(Arc::downgrade(&self.inner));
        if source.is_aborted() {
            self.abort();
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::FutureExt;

    #[test]
    fn triggers_once() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_aborted());
        assert!(signal.abort());
        assert!(clone.is_aborted());
        assert!(!clone.abort());
    }

    #[test]
    fn links_propagate_both_ways() {
        let a = AbortSignal::new();
        let b = AbortSignal::new();
        let c = AbortSignal::new();
        a.link(&b);
        b.link(&c);

        assert!(c.abort());
        assert!(b.is_aborted());
        assert!(a.is_aborted());
    }

    #[test]
    fn linking_an_aborted_signal_aborts_the_other() {
        let a = AbortSignal::new();
        a.abort();
        let b = AbortSignal::new();
        b.link(&a);
        assert!(b.is_aborted());
    }

    #[test]
    fn follow_propagates_one_way() {
        let source = AbortSignal::new();
        let follower = AbortSignal::new();
        follower.follow(&source);
        assert!(follower.abort());
        assert!(!source.is_aborted());

        let sibling = AbortSignal::new();
        sibling.follow(&source);
        assert!(source.abort());
        assert!(sibling.is_aborted());

        let late = AbortSignal::new();
        late.follow(&source);
        assert!(late.is_aborted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn aborted_resolves_after_abort() {
        let signal = AbortSignal::new();
        assert!(signal.aborted().now_or_never().is_none());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.aborted().await }
        });
        signal.abort();
        waiter.await.unwrap();
        assert!(signal.aborted().now_or_never().is_some());
    }
}
