//! NRI runtime adaptation library.
//!
//! A container runtime embeds an [`Adaptation`] engine to expose pod and
//! container lifecycle events to out-of-process NRI plugins. Plugins may
//! adjust container specifications before creation and request updates to
//! the resources of already-running containers; the engine mediates
//! between one runtime and many plugins, enforcing deterministic plugin
//! ordering, conflict detection, validation, and partial-failure
//! semantics.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::FutureExt;
//! use nri_adaptation::{Adaptation, Options, SyncCallback, SyncSnapshot, UpdateCallback};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // The runtime supplies its current state on demand...
//!     let sync_cb: SyncCallback = Arc::new(|| async { Ok(SyncSnapshot::default()) }.boxed());
//!     // ...and applies plugin-requested updates, returning the refused ones.
//!     let update_cb: UpdateCallback =
//!         Arc::new(|updates| async move { let _ = updates; Ok(Vec::new()) }.boxed());
//!
//!     let engine = Adaptation::new(
//!         "my-runtime",
//!         "0.1.0",
//!         Some(sync_cb),
//!         Some(update_cb),
//!         Options::default(),
//!     )?;
//!     engine.start().await?;
//!
//!     // Feed lifecycle events to the engine from here on, e.g.
//!     // engine.create_container(pod, container).await?.
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod events;
pub mod owners;
pub mod stub;
pub mod validator;

mod adaptation;
mod error;
mod launcher;
mod locking;
mod plugin;
mod registry;
mod result;
mod transport;

pub use adaptation::{
    Adaptation, EvictCallback, Options, SyncCallback, SyncSnapshot, UpdateCallback,
    DEFAULT_PLUGIN_CONFIG_PATH, DEFAULT_PLUGIN_PATH, DEFAULT_SOCKET_PATH, DEFAULT_SYNC_CHUNK_SIZE,
};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Capability, CapabilityMask, Event, EventMask};
pub use locking::LockingStrategy;
pub use plugin::{PluginState, DEFAULT_REGISTRATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use registry::SyncBlock;
pub use validator::{
    ValidatorConfig, REQUIRED_PLUGINS_ANNOTATION, TOLERATE_MISSING_PLUGINS_ANNOTATION,
};
