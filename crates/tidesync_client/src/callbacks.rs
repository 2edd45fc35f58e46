//! Reentrancy-safe registry of subscriber callbacks.

use parking_lot::Mutex;
use std::sync::Arc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    entries: Vec<(u64, Callback<T>)>,
    next_token: u64,
}

/// An ordered list of subscribers that tolerates registration and removal
/// from inside an active dispatch.
///
/// Dispatch takes a snapshot of the current entries, then re-checks each
/// token's membership immediately before invoking it, with the lock
/// released during the invocation itself. A subscriber removed mid-dispatch
/// is therefore never invoked after its removal, and one added mid-dispatch
/// first runs on the next dispatch.
pub struct CallbackRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> CallbackRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                next_token: 1,
            }),
        }
    }

    /// Registers a subscriber and returns its removal token.
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> u64 {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.entries.push((token, Arc::new(callback)));
        token
    }

    /// Removes a subscriber. Returns false if the token is unknown.
    pub fn remove(&self, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(t, _)| *t != token);
        inner.entries.len() != before
    }

    /// Invokes every currently registered subscriber with `value`.
    pub fn invoke(&self, value: &T) {
        let snapshot: Vec<u64> = {
            let inner = self.inner.lock();
            inner.entries.iter().map(|(t, _)| *t).collect()
        };
        for token in snapshot {
            let callback = {
                let inner = self.inner.lock();
                inner
                    .entries
                    .iter()
                    .find(|(t, _)| *t == token)
                    .map(|(_, c)| Arc::clone(c))
            };
            if let Some(callback) = callback {
                callback(value);
            }
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_invoke_remove() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_2 = Arc::clone(&count);
        let token = registry.add(move |value| {
            count_2.fetch_add(*value as usize, Ordering::SeqCst);
        });

        registry.invoke(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(registry.remove(token));
        assert!(!registry.remove(token));
        registry.invoke(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_during_dispatch_suppresses_later_invocation() {
        let registry: Arc<CallbackRegistry<()>> = Arc::new(CallbackRegistry::new());
        let invoked = Arc::new(AtomicUsize::new(0));

        // First subscriber removes the second one mid-dispatch.
        let registry_2 = Arc::clone(&registry);
        let second_token = Arc::new(Mutex::new(0u64));
        let second_token_2 = Arc::clone(&second_token);
        registry.add(move |_| {
            registry_2.remove(*second_token_2.lock());
        });

        let invoked_2 = Arc::clone(&invoked);
        let token = registry.add(move |_| {
            invoked_2.fetch_add(1, Ordering::SeqCst);
        });
        *second_token.lock() = token;

        registry.invoke(&());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn addition_during_dispatch_waits_for_next_round() {
        let registry: Arc<CallbackRegistry<()>> = Arc::new(CallbackRegistry::new());
        let late_invocations = Arc::new(AtomicUsize::new(0));

        let registry_2 = Arc::clone(&registry);
        let late = Arc::clone(&late_invocations);
        registry.add(move |_| {
            // Register a new subscriber from inside the dispatch; it must
            // not run in this round.
            if registry_2.len() == 1 {
                let late_2 = Arc::clone(&late);
                registry_2.add(move |_| {
                    late_2.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        registry.invoke(&());
        assert_eq!(late_invocations.load(Ordering::SeqCst), 0);

        registry.invoke(&());
        assert_eq!(late_invocations.load(Ordering::SeqCst), 1);
    }
}
