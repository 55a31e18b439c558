use std::ops::Deref;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Interlocked reference counter shared by every handle type. Counts how
/// many dependents currently require the handle to stay alive; a handle is
/// only disposable once the count drops to zero or below.
#[derive(Debug, Default)]
pub struct RefCount(AtomicI64);

impl RefCount {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn count(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait RefCounted {
    fn ref_count(&self) -> &RefCount;
}

/// Scope-tied reference to a counted handle: acquiring or cloning
/// increments, dropping decrements. Holding one through an early-return
/// error path cannot leak an increment.
pub struct Ref<T: RefCounted + ?Sized>(Arc<T>);

impl<T: RefCounted + ?Sized> Ref<T> {
    pub fn acquire(inner: Arc<T>) -> Self {
        inner.ref_count().increment();
        Self(inner)
    }

    pub fn shared(&self) -> Arc<T> {
        Arc::clone(&self.0)
    }
}

impl<T: RefCounted + ?Sized> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.0))
    }
}

impl<T: RefCounted + ?Sized> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: RefCounted + ?Sized> Drop for Ref<T> {
    fn drop(&mut self) {
        self.0.ref_count().decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Counted {
        refs: RefCount,
    }

    impl RefCounted for Counted {
        fn ref_count(&self) -> &RefCount {
            &self.refs
        }
    }

    #[test]
    fn guard_balances_count() {
        let counted = Arc::new(Counted {
            refs: RefCount::new(),
        });
        {
            let first = Ref::acquire(Arc::clone(&counted));
            assert_eq!(counted.refs.count(), 1);
            let second = first.clone();
            assert_eq!(counted.refs.count(), 2);
            drop(second);
            assert_eq!(counted.refs.count(), 1);
        }
        assert_eq!(counted.refs.count(), 0);
    }

    #[test]
    fn concurrent_increments_and_decrements_balance() {
        let counted = Arc::new(Counted {
            refs: RefCount::new(),
        });

        let mut workers = Vec::new();
        for _ in 0..8 {
            let shared = Arc::clone(&counted);
            workers.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let guard = Ref::acquire(Arc::clone(&shared));
                    assert!(shared.refs.count() >= 1);
                    drop(guard);
                }
            }));
        }
        for worker in workers {
            worker.join().expect("join refcount worker");
        }
        assert_eq!(counted.refs.count(), 0);
    }
}
