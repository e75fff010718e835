use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
};

/// Callback invoked with the (plaintext) key of every changed preference.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerState {
    next_id: u64,
    listeners: BTreeMap<u64, ChangeListener>,
}

/// Change listeners shared by clones of a store.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<ListenerState>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: ChangeListener) -> ListenerId {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, listener);
        ListenerId(id)
    }

    /// Returns `false` if the listener was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every listener once per distinct key, in first-seen order. The
    /// lock is released before any callback runs, so listeners may register
    /// or unregister freely.
    pub fn notify(&self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        let snapshot: Vec<ChangeListener> = {
            let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.values().cloned().collect()
        };
        let mut seen = BTreeSet::new();
        for key in changed {
            if !seen.insert(key.as_str()) {
                continue;
            }
            for listener in &snapshot {
                listener(key);
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
