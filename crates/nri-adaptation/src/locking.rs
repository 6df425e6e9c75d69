//! Serialization of mutating pipelines.
//!
//! The engine either serializes everything behind one global lock or runs
//! pipelines for different pods in parallel while serializing pipelines
//! for the same pod. Guards release on drop, covering every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Locking strategy, chosen at engine construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockingStrategy {
    /// One mutex serializes all mutating operations across all pods.
    #[default]
    Global,
    /// Each pod UID has its own mutex; different pods run in parallel.
    PerPod,
}

/// Scoped release handle for one pipeline.
pub(crate) struct PipelineGuard {
    _guard: OwnedMutexGuard<()>,
}

pub(crate) struct Locker {
    strategy: LockingStrategy,
    global: Arc<AsyncMutex<()>>,
    pods: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Locker {
    pub fn new(strategy: LockingStrategy) -> Self {
        Locker {
            strategy,
            global: Arc::new(AsyncMutex::new(())),
            pods: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock_global(&self) -> PipelineGuard {
        PipelineGuard {
            _guard: self.global.clone().lock_owned().await,
        }
    }

    pub async fn lock_pod(&self, uid: &str) -> PipelineGuard {
        match self.strategy {
            LockingStrategy::Global => self.lock_global().await,
            LockingStrategy::PerPod => {
                let pod_lock = {
                    let mut pods = self.pods.lock().unwrap();
                    pods.entry(uid.to_string())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                        .clone()
                };
                PipelineGuard {
                    _guard: pod_lock.lock_owned().await,
                }
            }
        }
    }

    /// Drop the lock entry of a pod that is gone. A no-op while any
    /// pipeline still holds or awaits the lock.
    pub fn cleanup_pod(&self, uid: &str) {
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod_lock) = pods.get(uid) {
            // Clones are only handed out under the map lock, so the count
            // is stable here.
            if Arc::strong_count(pod_lock) == 1 {
                pods.remove(uid);
            }
        }
    }
}
