//! Access to the entity store from other components.

use std::sync::Arc;

use tokio::sync::watch;

use crate::EntityStore;

/// A handle to the entity store, for components that are built before the store.
///
/// Handles are cheap to clone. The store is published once, through the paired [`EntityStoreProvider`], after which
/// every handle can reach it.
#[derive(Clone)]
pub struct EntityStoreHandle {
    rx: watch::Receiver<Option<Arc<EntityStore>>>,
}

impl EntityStoreHandle {
    /// Creates a new handle and the provider that publishes the store to it.
    pub fn new() -> (Self, EntityStoreProvider) {
        let (tx, rx) = watch::channel(None);
        (Self { rx }, EntityStoreProvider { tx })
    }

    /// Returns the store, if it has been published.
    pub fn get(&self) -> Option<Arc<EntityStore>> {
        self.rx.borrow().clone()
    }

    /// Waits for the store to be published.
    ///
    /// Returns `None` if the provider is dropped without publishing a store.
    pub async fn ready(&self) -> Option<Arc<EntityStore>> {
        let mut rx = self.rx.clone();
        let store = rx.wait_for(Option::is_some).await.ok()?;
        store.clone()
    }
}

/// Publishes the entity store to its handles.
pub struct EntityStoreProvider {
    tx: watch::Sender<Option<Arc<EntityStore>>>,
}

impl EntityStoreProvider {
    /// Publishes the store, returning `true` if it was published.
    ///
    /// Only the first store is published. Later calls do nothing and return `false`.
    pub fn publish(&self, store: Arc<EntityStore>) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(store);
            true
        })
    }
}
