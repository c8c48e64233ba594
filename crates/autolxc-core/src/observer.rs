//! Lifecycle observers
//!
//! Observers are registered under a unique name and notified in registration
//! order. The registry is an explicit object shared by one bucket and the
//! containers it owns; there is no process-wide observer list.

use crate::{ContainerIdentity, CoreError, Result};
use std::sync::{Arc, RwLock};

/// Something that happened to a container or the base image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The base container is available; `downloaded` is false when it was already on disk
    BaseReady { name: String, downloaded: bool },
    Created(ContainerIdentity),
    Started(ContainerIdentity),
    Stopped(ContainerIdentity),
    Destroyed(ContainerIdentity),
    MountAdded {
        identity: ContainerIdentity,
        target: String,
    },
}

/// Receives lifecycle events. Called synchronously, so keep it cheap.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// Ordered, name-unique set of observers
#[derive(Default)]
pub struct ObserverRegistry {
    entries: RwLock<Vec<(String, Arc<dyn Observer>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, observer: Arc<dyn Observer>) -> Result<()> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|(n, _)| *n == name) {
            return Err(CoreError::ObserverExists(name));
        }
        entries.push((name, observer));
        Ok(())
    }

    /// Returns whether an observer was registered under `name`
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(n, _)| n != name);
        entries.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn notify(&self, event: &LifecycleEvent) {
        // Snapshot so an observer may (un)register without deadlocking.
        let observers: Vec<Arc<dyn Observer>> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in observers {
            observer.notify(event);
        }
    }
}

/// Writes every event to the tracing log
pub struct LoggingObserver;

impl Observer for LoggingObserver {
    fn notify(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::BaseReady { name, downloaded } => {
                tracing::info!("Base container {} ready (downloaded: {})", name, downloaded)
            }
            LifecycleEvent::Created(id) => tracing::info!("Created container {}", id),
            LifecycleEvent::Started(id) => tracing::info!("Started container {}", id),
            LifecycleEvent::Stopped(id) => tracing::info!("Stopped container {}", id),
            LifecycleEvent::Destroyed(id) => tracing::info!("Destroyed container {}", id),
            LifecycleEvent::MountAdded { identity, target } => {
                tracing::debug!("Mounted {} into {}", target, identity)
            }
        }
    }
}
