//! The adaptation engine.
//!
//! A container runtime embeds an [`Adaptation`] to expose pod and
//! container lifecycle events to out-of-process plugins. Per event the
//! engine acquires the pod's lock, invokes subscribed plugins strictly in
//! registry order, merges their responses into one composed result, and
//! validates the result before handing it back to the runtime.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::*;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::launcher;
use crate::locking::{Locker, LockingStrategy};
use crate::plugin::{
    Plugin, PluginEvents, PluginState, DEFAULT_REGISTRATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
use crate::registry::{Registry, SyncBlock};
use crate::result::PipelineResult;
use crate::validator::{self, ValidatorConfig};

/// Default path of the engine's listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/nri/nri.sock";
/// Default directory of launchable plugin binaries.
pub const DEFAULT_PLUGIN_PATH: &str = "/opt/nri/plugins";
/// Default directory of plugin configuration files.
pub const DEFAULT_PLUGIN_CONFIG_PATH: &str = "/etc/nri/conf.d";
/// Default estimated size limit of one synchronization chunk.
pub const DEFAULT_SYNC_CHUNK_SIZE: usize = 4 << 20;

/// Current runtime state, returned by the synchronization callback.
#[derive(Clone, Debug, Default)]
pub struct SyncSnapshot {
    pub pods: Vec<PodSandbox>,
    pub containers: Vec<Container>,
}

/// Obtains the current set of pods and containers from the runtime.
pub type SyncCallback =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<SyncSnapshot>> + Send + Sync>;

/// Applies plugin-requested updates; returns the updates the runtime
/// refused.
pub type UpdateCallback = Arc<
    dyn Fn(Vec<ContainerUpdate>) -> BoxFuture<'static, anyhow::Result<Vec<ContainerUpdate>>>
        + Send
        + Sync,
>;

/// Applies plugin-requested evictions.
pub type EvictCallback =
    Arc<dyn Fn(Vec<ContainerEviction>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Engine construction options.
#[derive(Clone)]
pub struct Options {
    pub socket_path: PathBuf,
    pub plugin_path: PathBuf,
    pub plugin_config_path: PathBuf,
    /// Refuse external plugin connections; only launched plugins run.
    pub disable_connections: bool,
    pub locking: LockingStrategy,
    pub registration_timeout: Duration,
    pub request_timeout: Duration,
    pub sync_chunk_size: usize,
    /// Enables the built-in validator with the given policies.
    pub validator: Option<ValidatorConfig>,
    /// Optional handler for plugin-requested evictions; without one they
    /// are logged and dropped.
    pub evict_callback: Option<EvictCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            plugin_path: PathBuf::from(DEFAULT_PLUGIN_PATH),
            plugin_config_path: PathBuf::from(DEFAULT_PLUGIN_CONFIG_PATH),
            disable_connections: false,
            locking: LockingStrategy::default(),
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sync_chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
            validator: None,
            evict_callback: None,
        }
    }
}

/// Pods and containers the engine has seen, used to filter updates that
/// name containers unknown to the runtime.
#[derive(Default)]
struct Roster {
    pods: HashSet<String>,
    containers: HashMap<String, String>,
}

impl Roster {
    fn add_pod(&mut self, pod: &PodSandbox) {
        self.pods.insert(pod.id.clone());
    }

    fn remove_pod(&mut self, id: &str) {
        self.pods.remove(id);
        self.containers.retain(|_, pod| pod != id);
    }

    fn add_container(&mut self, container: &Container) {
        self.containers
            .insert(container.id.clone(), container.pod_sandbox_id.clone());
    }

    fn remove_container(&mut self, id: &str) {
        self.containers.remove(id);
    }

    fn knows_container(&self, id: &str) -> bool {
        self.containers.contains_key(id)
    }

    fn merge_snapshot(&mut self, snapshot: &SyncSnapshot) {
        for pod in &snapshot.pods {
            self.add_pod(pod);
        }
        for container in &snapshot.containers {
            self.add_container(container);
        }
    }
}

/// The NRI runtime adaptation engine.
#[derive(Clone)]
pub struct Adaptation {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Adaptation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptation")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .finish()
    }
}

struct Inner {
    name: String,
    version: String,
    sync_cb: SyncCallback,
    update_cb: UpdateCallback,
    options: Options,
    registry: Registry,
    locker: Locker,
    roster: Mutex<Roster>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl Adaptation {
    /// Create an engine for the named runtime. Both callbacks are
    /// required; construction fails if either is absent.
    pub fn new(
        name: &str,
        version: &str,
        sync_callback: Option<SyncCallback>,
        update_callback: Option<UpdateCallback>,
        options: Options,
    ) -> Result<Adaptation> {
        if name.is_empty() || version.is_empty() {
            return Err(Error::Config(
                "runtime name and version are required".to_string(),
            ));
        }
        let sync_cb = sync_callback
            .ok_or_else(|| Error::Config("a synchronization callback is required".to_string()))?;
        let update_cb = update_callback
            .ok_or_else(|| Error::Config("an update callback is required".to_string()))?;
        if options.registration_timeout.is_zero() || options.request_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if options.sync_chunk_size == 0 {
            return Err(Error::Config(
                "synchronization chunk size must be non-zero".to_string(),
            ));
        }

        let locker = Locker::new(options.locking);
        Ok(Adaptation {
            inner: Arc::new(Inner {
                name: name.to_string(),
                version: version.to_string(),
                sync_cb,
                update_cb,
                locker,
                registry: Registry::new(),
                roster: Mutex::new(Roster::default()),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: Mutex::new(false),
                options,
            }),
        })
    }

    /// Launch pre-configured plugins and start accepting external plugin
    /// connections.
    pub async fn start(&self) -> Result<()> {
        {
            let mut started = self.inner.started.lock().unwrap();
            if *started {
                return Err(Error::Config("engine is already started".to_string()));
            }
            *started = true;
        }
        info!(
            "starting NRI adaptation for {} {}",
            self.inner.name, self.inner.version
        );

        self.inner.clone().launch_plugins().await;

        if !self.inner.options.disable_connections {
            let listener = launcher::bind_listener(&self.inner.options.socket_path)?;
            let inner = self.inner.clone();
            let task = tokio::spawn(inner.accept_loop(listener));
            self.inner.tasks.lock().unwrap().push(task);
        }
        Ok(())
    }

    /// Stop accepting connections and shut all plugins down.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<_> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        for plugin in self.inner.registry.snapshot() {
            if plugin.state() != PluginState::Closed {
                plugin.shutdown().await;
            }
            self.inner.registry.remove(&plugin.id());
        }
    }

    /// Block plugin registration and synchronization until the returned
    /// handle is dropped.
    pub async fn block_plugin_sync(&self) -> SyncBlock {
        self.inner.registry.block_sync().await
    }

    pub async fn run_pod_sandbox(&self, pod: PodSandbox) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner.roster.lock().unwrap().add_pod(&pod);
        self.inner
            .deliver_event(Event::RunPodSandbox, Some(pod), None)
            .await
    }

    pub async fn update_pod_sandbox(
        &self,
        pod: PodSandbox,
        overhead: Option<LinuxResources>,
        resources: Option<LinuxResources>,
    ) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        let req = UpdatePodSandboxRequest {
            pod,
            overhead,
            resources,
        };
        for plugin in self.inner.registry.snapshot() {
            if !plugin.subscribes_to(Event::UpdatePodSandbox) || plugin.is_closed() {
                continue;
            }
            if let Err(e) = plugin.update_pod_sandbox(req.clone()).await {
                self.inner
                    .plugin_failure(&plugin, Event::UpdatePodSandbox, e)?;
            }
        }
        Ok(())
    }

    pub async fn post_update_pod_sandbox(&self, pod: PodSandbox) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::PostUpdatePodSandbox, Some(pod), None)
            .await
    }

    pub async fn stop_pod_sandbox(&self, pod: PodSandbox) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::StopPodSandbox, Some(pod), None)
            .await
    }

    pub async fn remove_pod_sandbox(&self, pod: PodSandbox) -> Result<()> {
        let uid = pod.uid.clone();
        let guard = self.inner.locker.lock_pod(&uid).await;
        self.inner.roster.lock().unwrap().remove_pod(&pod.id);
        let result = self
            .inner
            .deliver_event(Event::RemovePodSandbox, Some(pod), None)
            .await;
        drop(guard);
        self.inner.locker.cleanup_pod(&uid);
        result
    }

    /// Run the full create pipeline for a container, returning the
    /// composed adjustment plus updates and evictions for other
    /// containers.
    pub async fn create_container(
        &self,
        pod: PodSandbox,
        container: Container,
    ) -> Result<CreateContainerResponse> {
        let inner = &self.inner;
        let _guard = inner.locker.lock_pod(&pod.uid).await;
        inner.roster.lock().unwrap().add_container(&container);

        let mut result = PipelineResult::for_create(&container.id);
        for plugin in inner.registry.snapshot() {
            if !plugin.subscribes_to(Event::CreateContainer) || plugin.is_closed() {
                continue;
            }
            let req = CreateContainerRequest {
                pod: pod.clone(),
                container: container.clone(),
            };
            // A plugin failure on container creation is fatal.
            let response = plugin.create_container(req).await?;
            if let Some(adjust) = response.adjust {
                result.apply_adjust(&plugin.id(), adjust)?;
            }
            result.apply_updates(&plugin.id(), response.update)?;
            result.apply_evictions(response.evict);
        }

        inner.validate_composed(&pod, &container, &result).await?;
        Ok(result.into_create_response())
    }

    pub async fn post_create_container(
        &self,
        pod: PodSandbox,
        container: Container,
    ) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::PostCreateContainer, Some(pod), Some(container))
            .await
    }

    pub async fn start_container(&self, pod: PodSandbox, container: Container) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::StartContainer, Some(pod), Some(container))
            .await
    }

    pub async fn post_start_container(
        &self,
        pod: PodSandbox,
        container: Container,
    ) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::PostStartContainer, Some(pod), Some(container))
            .await
    }

    /// Run the update pipeline for a container. The composed update for
    /// the requested container, if any, is first in the reply.
    pub async fn update_container(
        &self,
        pod: PodSandbox,
        container: Container,
        resources: Option<LinuxResources>,
    ) -> Result<UpdateContainerResponse> {
        let inner = &self.inner;
        let _guard = inner.locker.lock_pod(&pod.uid).await;

        let mut result = PipelineResult::for_update(&container.id);
        for plugin in inner.registry.snapshot() {
            if !plugin.subscribes_to(Event::UpdateContainer) || plugin.is_closed() {
                continue;
            }
            let req = UpdateContainerRequest {
                pod: pod.clone(),
                container: container.clone(),
                linux_resources: resources.clone(),
            };
            // A plugin failure on container update is fatal.
            let response = plugin.update_container(req).await?;
            result.apply_updates(&plugin.id(), response.update)?;
            result.apply_evictions(response.evict);
        }

        inner.validate_composed(&pod, &container, &result).await?;
        Ok(result.into_update_response())
    }

    pub async fn post_update_container(
        &self,
        pod: PodSandbox,
        container: Container,
    ) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner
            .deliver_event(Event::PostUpdateContainer, Some(pod), Some(container))
            .await
    }

    pub async fn stop_container(
        &self,
        pod: PodSandbox,
        container: Container,
    ) -> Result<StopContainerResponse> {
        let inner = &self.inner;
        let _guard = inner.locker.lock_pod(&pod.uid).await;

        let mut result = PipelineResult::for_event(&container.id);
        for plugin in inner.registry.snapshot() {
            if !plugin.subscribes_to(Event::StopContainer) || plugin.is_closed() {
                continue;
            }
            let req = StopContainerRequest {
                pod: pod.clone(),
                container: container.clone(),
            };
            match plugin.stop_container(req).await {
                Ok(response) => result.apply_updates(&plugin.id(), response.update)?,
                Err(e) => inner.plugin_failure(&plugin, Event::StopContainer, e)?,
            }
        }
        Ok(result.into_stop_response())
    }

    pub async fn remove_container(&self, pod: PodSandbox, container: Container) -> Result<()> {
        let _guard = self.inner.locker.lock_pod(&pod.uid).await;
        self.inner.roster.lock().unwrap().remove_container(&container.id);
        self.inner
            .deliver_event(Event::RemoveContainer, Some(pod), Some(container))
            .await
    }

    /// Identities of the currently connected plugins, in registry order.
    pub fn plugins(&self) -> Vec<PluginInstance> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|p| p.instance())
            .collect()
    }

    /// Run validation independently of a pipeline, on a request built by
    /// the runtime itself.
    pub async fn validate_container_adjustment(
        &self,
        mut request: ValidateContainerAdjustmentRequest,
    ) -> Result<()> {
        if request.plugins.is_empty() {
            request.plugins = self.plugins();
        }
        self.inner.validate_request(request).await
    }
}

impl Inner {
    // Launch every discovered plugin binary and admit it.
    async fn launch_plugins(self: Arc<Self>) {
        let discovered = match launcher::discover_plugins(&self.options.plugin_path) {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!("plugin discovery failed: {}", e);
                return;
            }
        };
        for d in discovered {
            let config =
                match launcher::read_plugin_config(&self.options.plugin_config_path, &d.name) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("plugin {}-{}: {}", d.idx, d.name, e);
                        None
                    }
                };
            let (stream, child) = match launcher::spawn_plugin(&d) {
                Ok(launched) => launched,
                Err(e) => {
                    warn!("failed to launch plugin {}-{}: {}", d.idx, d.name, e);
                    continue;
                }
            };
            let sink: Weak<dyn PluginEvents> =
                Arc::downgrade(&(self.clone() as Arc<dyn PluginEvents>));
            let plugin = Plugin::launched(
                stream,
                &d.idx,
                &d.name,
                config,
                Some(child),
                sink,
                self.options.request_timeout,
            );
            if let Err(e) = self.admit(plugin.clone()).await {
                warn!("failed to admit launched plugin {}: {}", plugin.id(), e);
                plugin.close();
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        info!(
            "accepting plugin connections on {}",
            self.options.socket_path.display()
        );
        loop {
            let conn = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                conn = listener.accept() => conn,
            };
            let stream = match conn {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("failed to accept plugin connection: {}", e);
                    continue;
                }
            };
            let inner = self.clone();
            tokio::spawn(async move {
                let sink: Weak<dyn PluginEvents> =
                    Arc::downgrade(&(inner.clone() as Arc<dyn PluginEvents>));
                let plugin = Plugin::external(stream, sink, inner.options.request_timeout);
                if let Err(e) = plugin
                    .wait_registered(inner.options.registration_timeout)
                    .await
                {
                    warn!("plugin registration failed: {}", e);
                    return;
                }
                if let Err(e) = inner.admit(plugin.clone()).await {
                    warn!("failed to admit plugin {}: {}", plugin.id(), e);
                    plugin.close();
                }
            });
        }
    }

    // Configure a registered plugin, stream it the current world, and
    // install it in the registry.
    async fn admit(&self, plugin: Arc<Plugin>) -> Result<()> {
        // Registration waits while the runtime blocks synchronization.
        let _permit = self.registry.sync_permit().await;

        let req = ConfigureRequest {
            config: plugin.config_blob(),
            runtime_name: self.name.clone(),
            runtime_version: self.version.clone(),
            registration_timeout_ms: self.options.registration_timeout.as_millis() as u64,
            request_timeout_ms: self.options.request_timeout.as_millis() as u64,
        };
        plugin.configure(req).await?;

        let snapshot = (self.sync_cb)().await.map_err(Error::Callback)?;
        self.roster.lock().unwrap().merge_snapshot(&snapshot);
        let updates = plugin
            .synchronize(
                snapshot.pods,
                snapshot.containers,
                self.options.sync_chunk_size,
            )
            .await?;

        if let Some(displaced) = self.registry.insert(plugin.clone(), true)? {
            info!("replacing plugin instance {}", displaced.id());
            displaced.shutdown().await;
        }
        plugin.start();
        info!(
            "plugin {} connected, events <{}>, capabilities <{}>",
            plugin.id(),
            plugin.events(),
            plugin.capabilities()
        );

        if !updates.is_empty() {
            match self.dispatch_updates(&plugin.id(), updates).await {
                Ok(failed) if !failed.is_empty() => {
                    warn!(
                        "runtime refused {} initial updates from plugin {}",
                        failed.len(),
                        plugin.id()
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("initial updates from plugin {} failed: {}", plugin.id(), e);
                }
            }
        }
        Ok(())
    }

    // Deliver a plain lifecycle notification to all subscribed plugins.
    async fn deliver_event(
        &self,
        event: Event,
        pod: Option<PodSandbox>,
        container: Option<Container>,
    ) -> Result<()> {
        for plugin in self.registry.snapshot() {
            if !plugin.subscribes_to(event) || plugin.is_closed() {
                continue;
            }
            // Each plugin gets its own deep copy of the payload.
            if let Err(e) = plugin.state_change(event, pod.clone(), container.clone()).await {
                self.plugin_failure(&plugin, event, e)?;
            }
        }
        Ok(())
    }

    // Failures of required plugins are fatal, everything else is logged.
    fn plugin_failure(&self, plugin: &Arc<Plugin>, event: Event, err: Error) -> Result<()> {
        if self.is_required(&plugin.name()) {
            return Err(err);
        }
        warn!("plugin {} failed on {}: {}", plugin.id(), event, err);
        Ok(())
    }

    fn is_required(&self, name: &str) -> bool {
        self.options
            .validator
            .as_ref()
            .map_or(false, |v| v.required_plugins.iter().any(|p| p == name))
    }

    async fn validate_composed(
        &self,
        pod: &PodSandbox,
        container: &Container,
        result: &PipelineResult,
    ) -> Result<()> {
        let request = ValidateContainerAdjustmentRequest {
            pod: pod.clone(),
            container: container.clone(),
            adjust: result.composed_adjust(),
            update: result.composed_updates(),
            owners: result.owners().clone(),
            plugins: self
                .registry
                .snapshot()
                .iter()
                .map(|p| p.instance())
                .collect(),
        };
        self.validate_request(request).await
    }

    async fn validate_request(&self, request: ValidateContainerAdjustmentRequest) -> Result<()> {
        if let Some(config) = &self.options.validator {
            validator::validate(config, &request)?;
        }
        for plugin in self.registry.snapshot() {
            if !plugin.subscribes_to(Event::ValidateContainerAdjustment) || plugin.is_closed() {
                continue;
            }
            // An unreachable validator fails closed.
            let response = plugin.validate_container_adjustment(request.clone()).await?;
            if response.reject {
                let reason = if response.reason.is_empty() {
                    "rejected without a reason".to_string()
                } else {
                    response.reason
                };
                return Err(Error::ValidationRejected {
                    plugin: plugin.id(),
                    reason,
                });
            }
        }
        Ok(())
    }

    // Filter out updates naming containers the runtime does not know,
    // route the rest through the update callback.
    async fn dispatch_updates(
        &self,
        plugin: &str,
        updates: Vec<ContainerUpdate>,
    ) -> Result<Vec<ContainerUpdate>> {
        let known: Vec<ContainerUpdate> = {
            let roster = self.roster.lock().unwrap();
            updates
                .into_iter()
                .filter(|u| {
                    let known = roster.knows_container(&u.container_id);
                    if !known {
                        debug!(
                            "ignoring update from plugin {} for unknown container {}",
                            plugin, u.container_id
                        );
                    }
                    known
                })
                .collect()
        };
        if known.is_empty() {
            return Ok(Vec::new());
        }
        (self.update_cb)(known).await.map_err(Error::Callback)
    }
}

#[async_trait]
impl PluginEvents for Inner {
    async fn update_containers(
        &self,
        plugin: &str,
        req: UpdateContainersRequest,
    ) -> Result<UpdateContainersResponse> {
        debug!("unsolicited update request from plugin {}", plugin);
        let failed = self.dispatch_updates(plugin, req.update).await?;

        let evictions: Vec<ContainerEviction> = {
            let roster = self.roster.lock().unwrap();
            req.evict
                .into_iter()
                .filter(|e| roster.knows_container(&e.container_id))
                .collect()
        };
        if !evictions.is_empty() {
            match &self.options.evict_callback {
                Some(evict_cb) => evict_cb(evictions).await.map_err(Error::Callback)?,
                None => warn!(
                    "dropping {} eviction requests from plugin {}: no eviction handler",
                    evictions.len(),
                    plugin
                ),
            }
        }
        Ok(UpdateContainersResponse { failed })
    }

    async fn plugin_closed(&self, plugin: &Arc<Plugin>) {
        if self.registry.remove_closed(plugin) {
            info!("plugin {} disconnected", plugin.id());
        }
    }
}
