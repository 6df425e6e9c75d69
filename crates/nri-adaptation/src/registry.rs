//! Ordered collection of active plugin handles.
//!
//! The canonical iteration order is ascending by index string, tie-broken
//! ascending by name. Snapshots are point-in-time views: mutations during
//! iteration do not affect an already-taken snapshot.

use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{Error, Result};
use crate::plugin::Plugin;

/// Scoped un-blocker returned by blocking plugin synchronization. New
/// plugin registrations wait until it is dropped.
pub struct SyncBlock {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub(crate) struct Registry {
    plugins: Mutex<Vec<Arc<Plugin>>>,
    sync_gate: Arc<RwLock<()>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            plugins: Mutex::new(Vec::new()),
            sync_gate: Arc::new(RwLock::new(())),
        }
    }

    /// Install a plugin. With `replace` unset a duplicate `<index>-<name>`
    /// is rejected; with it set the previous handle is returned for the
    /// caller to shut down.
    pub fn insert(&self, plugin: Arc<Plugin>, replace: bool) -> Result<Option<Arc<Plugin>>> {
        let id = plugin.id();
        let mut plugins = self.plugins.lock().unwrap();

        let displaced = match plugins.iter().position(|p| p.id() == id) {
            Some(i) => {
                if !replace {
                    return Err(Error::Config(format!(
                        "plugin {:?} is already registered",
                        id
                    )));
                }
                Some(plugins.remove(i))
            }
            None => None,
        };

        plugins.push(plugin);
        plugins.sort_by_key(|p| p.sort_key());
        Ok(displaced)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Plugin>> {
        let mut plugins = self.plugins.lock().unwrap();
        let i = plugins.iter().position(|p| p.id() == id)?;
        Some(plugins.remove(i))
    }

    /// Remove `plugin` if it is still the registered instance. A replaced
    /// handle must not evict its successor under the same id.
    pub fn remove_closed(&self, plugin: &Arc<Plugin>) -> bool {
        let mut plugins = self.plugins.lock().unwrap();
        match plugins.iter().position(|p| Arc::ptr_eq(p, plugin)) {
            Some(i) => {
                plugins.remove(i);
                true
            }
            None => false,
        }
    }

    /// Point-in-time ordered view.
    pub fn snapshot(&self) -> Vec<Arc<Plugin>> {
        self.plugins.lock().unwrap().clone()
    }

    /// Block new plugin registrations until the returned handle is dropped.
    pub async fn block_sync(&self) -> SyncBlock {
        SyncBlock {
            _guard: self.sync_gate.clone().write_owned().await,
        }
    }

    /// Wait until registration is unblocked; the returned permit keeps it
    /// that way for the duration of one registration.
    pub async fn sync_permit(&self) -> OwnedRwLockReadGuard<()> {
        self.sync_gate.clone().read_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginState;
    use std::sync::Weak;

    fn plugin(idx: &str, name: &str) -> Arc<Plugin> {
        let (stream, _keep) = tokio::io::duplex(4096);
        // Leak the other half so the connection stays open for the test.
        std::mem::forget(_keep);
        let sink: Weak<dyn crate::plugin::PluginEvents> = Weak::<Sink>::new();
        Plugin::launched(
            stream,
            idx,
            name,
            None,
            None,
            sink,
            std::time::Duration::from_secs(1),
        )
    }

    struct Sink;

    #[async_trait::async_trait]
    impl crate::plugin::PluginEvents for Sink {
        async fn update_containers(
            &self,
            _plugin: &str,
            _req: crate::api::UpdateContainersRequest,
        ) -> Result<crate::api::UpdateContainersResponse> {
            Ok(Default::default())
        }

        async fn plugin_closed(&self, _plugin: &Arc<Plugin>) {}
    }

    #[tokio::test]
    async fn test_remove_closed_spares_a_replacement() {
        let registry = Registry::new();
        let first = plugin("00", "test");
        registry.insert(first.clone(), false).unwrap();
        let second = plugin("00", "test");
        registry.insert(second.clone(), true).unwrap();

        // The displaced handle closing must not evict its successor.
        assert!(!registry.remove_closed(&first));
        assert_eq!(registry.snapshot().len(), 1);
        assert!(Arc::ptr_eq(&registry.snapshot()[0], &second));

        assert!(registry.remove_closed(&second));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_insert_orders_by_index_then_name() {
        let registry = Registry::new();
        for (idx, name) in [("20", "test"), ("99", "foo"), ("00", "bar"), ("20", "alpha")] {
            registry.insert(plugin(idx, name), false).unwrap();
        }

        let order: Vec<_> = registry.snapshot().iter().map(|p| p.id()).collect();
        assert_eq!(order, vec!["00-bar", "20-alpha", "20-test", "99-foo"]);
    }

    #[tokio::test]
    async fn test_duplicate_rejected_without_replace() {
        let registry = Registry::new();
        registry.insert(plugin("00", "test"), false).unwrap();
        assert!(registry.insert(plugin("00", "test"), false).is_err());
    }

    #[tokio::test]
    async fn test_replace_returns_displaced_handle() {
        let registry = Registry::new();
        let first = plugin("00", "test");
        registry.insert(first.clone(), false).unwrap();

        let displaced = registry.insert(plugin("00", "test"), true).unwrap();
        assert!(displaced.is_some());
        assert!(Arc::ptr_eq(&displaced.unwrap(), &first));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_isolated_from_mutation() {
        let registry = Registry::new();
        registry.insert(plugin("00", "a"), false).unwrap();
        let snapshot = registry.snapshot();

        registry.insert(plugin("10", "b"), false).unwrap();
        registry.remove("00-a");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "00-a");
        assert_eq!(snapshot[0].state(), PluginState::Dialing);
    }

    #[tokio::test]
    async fn test_sync_gate_blocks_permits() {
        let registry = Arc::new(Registry::new());
        let block = registry.block_sync().await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _permit = registry.sync_permit().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(block);
        waiter.await.unwrap();
    }
}
