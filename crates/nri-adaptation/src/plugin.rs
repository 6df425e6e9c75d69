//! Per-connection plugin handle.
//!
//! A handle is created when a pre-configured binary is launched or an
//! external connection is accepted. It owns the connection peer, tracks
//! the plugin's identity and subscription mask, and exposes one
//! timeout-bounded method per protocol call. Plugin-initiated calls are
//! routed to the engine through a weak, non-owning back-reference.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::api::*;
use crate::error::{Error, Result};
use crate::events::{CapabilityMask, Event, EventMask};
use crate::transport::{IncomingCall, Peer, Request, Response};

/// Plugin registration must complete within this much of socket accept.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Any per-request call must complete within this.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle states of a plugin connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginState {
    Dialing,
    Configured,
    Synchronized,
    Running,
    Closing,
    Closed,
}

/// Engine-side interest in plugin-initiated traffic.
#[async_trait]
pub(crate) trait PluginEvents: Send + Sync {
    /// An unsolicited `update_containers` call from `plugin`.
    async fn update_containers(
        &self,
        plugin: &str,
        req: UpdateContainersRequest,
    ) -> Result<UpdateContainersResponse>;

    /// The plugin's connection went away.
    async fn plugin_closed(&self, plugin: &Arc<Plugin>);
}

#[derive(Clone, Debug)]
struct Identity {
    idx: String,
    name: String,
}

/// Validate a plugin identity: a two-digit index and a non-empty name.
pub(crate) fn check_plugin_identity(idx: &str, name: &str) -> Result<()> {
    if idx.len() != 2 || !idx.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Config(format!(
            "invalid plugin index {:?}, expected two digits",
            idx
        )));
    }
    if name.is_empty() || name.contains('/') {
        return Err(Error::Config(format!("invalid plugin name {:?}", name)));
    }
    Ok(())
}

pub(crate) struct Plugin {
    peer: Arc<Peer>,
    identity: OnceLock<Identity>,
    /// Plugin-specific configuration blob for launched plugins.
    config: Option<String>,
    /// Child process of a launched plugin, killed on drop.
    child: Mutex<Option<tokio::process::Child>>,
    state: Mutex<PluginState>,
    subscriptions: Mutex<EventMask>,
    capabilities: Mutex<CapabilityMask>,
    request_timeout: Duration,
    registered_tx: watch::Sender<bool>,
    registered_rx: watch::Receiver<bool>,
    sink: Weak<dyn PluginEvents>,
}

impl Plugin {
    /// Wrap the connection of a plugin we launched ourselves; its identity
    /// is taken from the binary name and it is considered registered.
    pub fn launched<S>(
        stream: S,
        idx: &str,
        name: &str,
        config: Option<String>,
        child: Option<tokio::process::Child>,
        sink: Weak<dyn PluginEvents>,
        request_timeout: Duration,
    ) -> Arc<Plugin>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let plugin = Self::new(stream, config, child, sink, request_timeout);
        let _ = plugin.identity.set(Identity {
            idx: idx.to_string(),
            name: name.to_string(),
        });
        let _ = plugin.registered_tx.send(true);
        plugin
    }

    /// Wrap an externally accepted connection; the handle stays pending
    /// until the plugin's `register` call arrives.
    pub fn external<S>(
        stream: S,
        sink: Weak<dyn PluginEvents>,
        request_timeout: Duration,
    ) -> Arc<Plugin>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        Self::new(stream, None, None, sink, request_timeout)
    }

    fn new<S>(
        stream: S,
        config: Option<String>,
        child: Option<tokio::process::Child>,
        sink: Weak<dyn PluginEvents>,
        request_timeout: Duration,
    ) -> Arc<Plugin>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (peer, incoming) = Peer::open(stream);
        let (registered_tx, registered_rx) = watch::channel(false);
        let plugin = Arc::new(Plugin {
            peer,
            identity: OnceLock::new(),
            config,
            child: Mutex::new(child),
            state: Mutex::new(PluginState::Dialing),
            subscriptions: Mutex::new(EventMask::new()),
            capabilities: Mutex::new(CapabilityMask::new()),
            request_timeout,
            registered_tx,
            registered_rx,
            sink,
        });
        plugin.spawn_serve(incoming);
        plugin
    }

    /// `<index>-<name>`, or a placeholder before registration.
    pub fn id(&self) -> String {
        match self.identity.get() {
            Some(identity) => format!("{}-{}", identity.idx, identity.name),
            None => "<unregistered>".to_string(),
        }
    }

    pub fn name(&self) -> String {
        self.identity
            .get()
            .map(|i| i.name.clone())
            .unwrap_or_default()
    }

    pub fn index(&self) -> String {
        self.identity
            .get()
            .map(|i| i.idx.clone())
            .unwrap_or_default()
    }

    /// Canonical registry ordering key.
    pub fn sort_key(&self) -> (String, String) {
        (self.index(), self.name())
    }

    pub fn instance(&self) -> PluginInstance {
        PluginInstance {
            index: self.index(),
            name: self.name(),
        }
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PluginState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn config_blob(&self) -> String {
        self.config.clone().unwrap_or_default()
    }

    pub fn subscribes_to(&self, event: Event) -> bool {
        self.subscriptions.lock().unwrap().is_set(event)
    }

    pub fn events(&self) -> EventMask {
        *self.subscriptions.lock().unwrap()
    }

    pub fn capabilities(&self) -> CapabilityMask {
        *self.capabilities.lock().unwrap()
    }

    /// Suspend until the plugin registers, or fail and close the handle.
    pub async fn wait_registered(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.registered_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|registered| *registered)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => {
                self.close();
                Err(Error::transport(
                    self.id(),
                    "connection closed before registration",
                ))
            }
            Err(_) => {
                self.close();
                Err(Error::transport(self.id(), "plugin registration timed out"))
            }
        }
    }

    /// Send the engine's configuration, record the returned subscription
    /// and capability masks.
    pub async fn configure(&self, req: ConfigureRequest) -> Result<()> {
        match self.call_checked(Request::Configure(req)).await? {
            Response::Configure(response) => {
                let events = EventMask::from_raw(response.events);
                if !events.is_subset_of(EventMask::all()) {
                    return Err(Error::protocol(
                        self.id(),
                        "invalid bits in event subscription mask",
                    ));
                }
                let capabilities = CapabilityMask::from_raw(response.capabilities);
                if !capabilities.is_subset_of(CapabilityMask::all()) {
                    return Err(Error::protocol(
                        self.id(),
                        "invalid bits in capability mask",
                    ));
                }
                *self.subscriptions.lock().unwrap() = events;
                *self.capabilities.lock().unwrap() = capabilities;
                self.set_state(PluginState::Configured);
                Ok(())
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Stream the current world to the plugin, chunking so no message
    /// exceeds `chunk_limit` estimated bytes. Returns the initial updates
    /// the plugin requested.
    pub async fn synchronize(
        &self,
        pods: Vec<PodSandbox>,
        containers: Vec<Container>,
        chunk_limit: usize,
    ) -> Result<Vec<ContainerUpdate>> {
        let chunks = chunk_snapshot(pods, containers, chunk_limit);
        let total = chunks.len();
        let mut updates = Vec::new();
        for (i, (pods, containers)) in chunks.into_iter().enumerate() {
            let req = SynchronizeRequest {
                pods,
                containers,
                more: i + 1 < total,
            };
            match self.call_checked(Request::Synchronize(req)).await? {
                Response::Synchronize(response) => updates.extend(response.update),
                other => return Err(self.unexpected(other)),
            }
        }
        self.set_state(PluginState::Synchronized);
        Ok(updates)
    }

    /// Mark the handle fully admitted.
    pub fn start(&self) {
        self.set_state(PluginState::Running);
    }

    pub async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        match self.call_checked(Request::CreateContainer(req)).await? {
            Response::CreateContainer(response) => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn update_container(
        &self,
        req: UpdateContainerRequest,
    ) -> Result<UpdateContainerResponse> {
        match self.call_checked(Request::UpdateContainer(req)).await? {
            Response::UpdateContainer(response) => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn stop_container(&self, req: StopContainerRequest) -> Result<StopContainerResponse> {
        match self.call_checked(Request::StopContainer(req)).await? {
            Response::StopContainer(response) => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn update_pod_sandbox(&self, req: UpdatePodSandboxRequest) -> Result<()> {
        match self.call_checked(Request::UpdatePodSandbox(req)).await? {
            Response::Empty => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn state_change(
        &self,
        event: Event,
        pod: Option<PodSandbox>,
        container: Option<Container>,
    ) -> Result<()> {
        let req = StateChangeEvent {
            event,
            pod,
            container,
        };
        match self.call_checked(Request::StateChange(req)).await? {
            Response::Empty => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn validate_container_adjustment(
        &self,
        req: ValidateContainerAdjustmentRequest,
    ) -> Result<ValidateContainerAdjustmentResponse> {
        match self
            .call_checked(Request::ValidateContainerAdjustment(Box::new(req)))
            .await?
        {
            Response::ValidateContainerAdjustment(response) => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }

    /// Ask the plugin to wind down, then close the connection.
    pub async fn shutdown(&self) {
        self.set_state(PluginState::Closing);
        let _ = tokio::time::timeout(self.request_timeout, self.peer.call(Request::Shutdown)).await;
        self.close();
    }

    /// Tear the connection down immediately.
    pub fn close(&self) {
        self.peer.close();
        self.set_state(PluginState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    async fn call_checked(&self, request: Request) -> Result<Response> {
        let response = match tokio::time::timeout(self.request_timeout, self.peer.call(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.set_state(PluginState::Closed);
                return Err(Error::transport(self.id(), "connection closed"));
            }
            Err(_) => {
                // Timeouts count as plugin failures and cost the plugin its
                // connection.
                self.close();
                return Err(Error::transport(
                    self.id(),
                    format!("request timed out after {:?}", self.request_timeout),
                ));
            }
        };
        match response {
            Response::Error(reason) => Err(Error::transport(
                self.id(),
                format!("request failed: {}", reason),
            )),
            response => Ok(response),
        }
    }

    fn unexpected(&self, response: Response) -> Error {
        self.close();
        Error::protocol(self.id(), format!("unexpected response {:?}", response))
    }

    fn spawn_serve(self: &Arc<Self>, mut incoming: mpsc::Receiver<IncomingCall>) {
        let plugin = self.clone();
        tokio::spawn(async move {
            let closed = plugin.peer.closed();
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    call = incoming.recv() => match call {
                        Some(call) => plugin.handle_call(call).await,
                        None => break,
                    },
                }
            }
            plugin.set_state(PluginState::Closed);
            if let Some(child) = plugin.child.lock().unwrap().take() {
                drop(child);
            }
            if let Some(sink) = plugin.sink.upgrade() {
                sink.plugin_closed(&plugin).await;
            }
            debug!("plugin {} connection closed", plugin.id());
        });
    }

    async fn handle_call(&self, call: IncomingCall) {
        let response = match call.request {
            Request::RegisterPlugin(req) => self.handle_register(req),
            Request::UpdateContainers(req) => self.handle_update_containers(req).await,
            _ => Response::Error("unexpected call initiated by plugin".to_string()),
        };
        let _ = call.reply.send(response);
    }

    fn handle_register(&self, req: RegisterPluginRequest) -> Response {
        if let Err(e) = check_plugin_identity(&req.plugin_idx, &req.plugin_name) {
            warn!("rejecting plugin registration: {}", e);
            return Response::Error(e.to_string());
        }
        match self.identity.get() {
            Some(identity) if identity.idx == req.plugin_idx && identity.name == req.plugin_name => {
            }
            Some(identity) => {
                return Response::Error(format!(
                    "plugin already registered as {}-{}",
                    identity.idx, identity.name
                ));
            }
            None => {
                let _ = self.identity.set(Identity {
                    idx: req.plugin_idx,
                    name: req.plugin_name,
                });
            }
        }
        info!("plugin {} registered", self.id());
        let _ = self.registered_tx.send(true);
        Response::Empty
    }

    async fn handle_update_containers(&self, req: UpdateContainersRequest) -> Response {
        if self.identity.get().is_none() {
            return Response::Error("plugin is not registered".to_string());
        }
        match self.sink.upgrade() {
            Some(sink) => match sink.update_containers(&self.id(), req).await {
                Ok(response) => Response::UpdateContainers(response),
                Err(e) => Response::Error(e.to_string()),
            },
            None => Response::Error("engine is shutting down".to_string()),
        }
    }
}

// Split a snapshot into chunks whose estimated serialized size stays under
// the limit. Always yields at least one chunk so the plugin sees a final
// message with `more` unset.
fn chunk_snapshot(
    pods: Vec<PodSandbox>,
    containers: Vec<Container>,
    limit: usize,
) -> Vec<(Vec<PodSandbox>, Vec<Container>)> {
    fn estimate<T: serde::Serialize>(item: &T) -> usize {
        serde_json::to_vec(item).map(|b| b.len()).unwrap_or(0)
    }

    let mut chunks = Vec::new();
    let mut current = (Vec::new(), Vec::new());
    let mut size = 0usize;

    for pod in pods {
        let item = estimate(&pod);
        if size + item > limit && !(current.0.is_empty() && current.1.is_empty()) {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        current.0.push(pod);
        size += item;
    }
    for container in containers {
        let item = estimate(&container);
        if size + item > limit && !(current.0.is_empty() && current.1.is_empty()) {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        current.1.push(container);
        size += item;
    }
    chunks.push(current);
    chunks
}
