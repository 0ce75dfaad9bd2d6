//! Typed publish/subscribe channels used between entities
//!
//! Every long-lived entity exposes one [`Emitter`] per event it produces.
//! Subscribers keep the returned [`ListenerId`] and must hand it back through
//! [`Emitter::unsubscribe`] when they are torn down, otherwise a retired
//! entity keeps reacting to events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle identifying a single subscription on one emitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A typed event channel with explicit detach
pub struct Emitter<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<E>)>> {
        // A listener that panicked must not wedge the channel for everyone else
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a listener, returning the handle needed to detach it
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener attached at the time of the call.
    ///
    /// The listener list is snapshotted first, so listeners may emit or
    /// (un)subscribe on this same emitter.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Emitted by a compiled directory after a successful build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildComplete;

/// Packaged deployment archive, shared between every bound function
pub type Artifact = Arc<[u8]>;

/// A layer (or one of its libraries) changed and needs a full redeploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerChange {
    pub layer: String,
}

/// A function finished deploying new code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployComplete {
    pub function: String,
}

/// A template was reloaded and its materialized copy rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateUpdate {
    pub template: PathBuf,
}
