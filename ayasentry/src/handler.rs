use std::sync::{Arc, RwLock};

/// Callback invoked synchronously from a consumption loop.
pub type Handler<E> = dyn Fn(&E) -> anyhow::Result<()> + Send + Sync;

/// Holds at most one registered value. An empty slot is a deliberate
/// no-op for the caller, not an error.
pub struct Slot<T: ?Sized>(RwLock<Option<Arc<T>>>);

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self(RwLock::new(None))
    }
}

impl<T: ?Sized> Slot<T> {
    /// Replace whatever is registered.
    pub fn set(&self, value: Arc<T>) {
        let mut guard = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(value);
    }

    pub fn clear(&self) {
        let mut guard = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    pub fn get(&self) -> Option<Arc<T>> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Run the handler in `slot` for `event`, logging a failure instead of
/// returning it. Returns whether a handler was registered.
pub fn dispatch<E>(slot: &Slot<Handler<E>>, kind: &str, event: &E) -> bool {
    let Some(handler) = slot.get() else {
        return false;
    };
    if let Err(e) = handler(event) {
        tracing::warn!(kind, error = %e, "event handler failed");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_slot_is_noop() {
        let slot: Slot<Handler<u32>> = Slot::default();
        assert!(!dispatch(&slot, "test", &1));
    }

    #[test]
    fn test_set_replaces_previous_handler() {
        let slot: Slot<Handler<u32>> = Slot::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        slot.set(Arc::new(move |_: &u32| -> anyhow::Result<()> {
            f.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }));
        let s = second.clone();
        slot.set(Arc::new(move |_: &u32| -> anyhow::Result<()> {
            s.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }));

        assert!(dispatch(&slot, "test", &7));
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_handler_error_is_swallowed() {
        let slot: Slot<Handler<u32>> = Slot::default();
        slot.set(Arc::new(|_: &u32| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }));
        assert!(dispatch(&slot, "test", &1));

        slot.clear();
        assert!(slot.get().is_none());
    }
}
