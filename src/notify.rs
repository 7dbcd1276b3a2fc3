//! Notification subscribers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    data: String,
}

impl Notification {
    pub fn new(data: impl Into<String>) -> Self {
        Notification { data: data.into() }
    }

    pub fn data(&self) -> &str {
        &self.data
    }
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&Notification) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callbacks run synchronously on the listener thread. Each one is isolated:
/// an error or a panic is logged and the rest still run.
#[derive(Default)]
pub(crate) struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl Subscribers {
    pub fn add<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        self.lock().push((id, callback));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.lock();
        let before = callbacks.len();
        callbacks.retain(|(other, _)| *other != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns the number of callbacks that failed.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        // Snapshot, so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<_> = self.lock().clone();
        let mut failed = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::error!(subscription = id.0, error = %err, "subscriber failed");
                }
                Err(panic) => {
                    failed += 1;
                    tracing::error!(
                        subscription = id.0,
                        panic = panic_message(&*panic),
                        "subscriber panicked"
                    );
                }
            }
        }
        failed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn add_and_remove() {
        let subscribers = Subscribers::default();
        let a = subscribers.add(|_| Ok(()));
        let b = subscribers.add(|_| Ok(()));
        assert_ne!(a, b);
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.remove(a));
        assert!(!subscribers.remove(a));
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn dispatch_reaches_every_subscriber() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            subscribers.add(move |n| {
                seen.lock().unwrap().push(n.data().to_owned());
                Ok(())
            });
        }
        assert_eq!(subscribers.dispatch(&Notification::new("hi")), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["hi"; 3]);
    }

    #[test]
    fn failing_subscribers_are_isolated() {
        let subscribers = Subscribers::default();
        let calls = Arc::new(AtomicUsize::new(0));
        subscribers.add(|_| Err("boom".into()));
        subscribers.add(|_| panic!("kaboom"));
        {
            let calls = Arc::clone(&calls);
            subscribers.add(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(subscribers.dispatch(&Notification::new("x")), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself() {
        let subscribers = Arc::new(Subscribers::default());
        let slot = Arc::new(Mutex::new(None));
        let id = {
            let handle = Arc::clone(&subscribers);
            let slot = Arc::clone(&slot);
            subscribers.add(move |_| {
                if let Some(id) = slot.lock().unwrap().take() {
                    handle.remove(id);
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(id);
        subscribers.dispatch(&Notification::new("once"));
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn panic_message_reads_both_string_kinds() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "<non-string panic>");
    }
}
