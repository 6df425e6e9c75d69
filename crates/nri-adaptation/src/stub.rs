//! Plugin-side counterpart of the engine.
//!
//! Out-of-process plugins (and this crate's integration tests) use a
//! [`Stub`] to connect to a runtime's NRI socket, register, and serve the
//! engine's calls through the [`Plugin`] trait. Every handler has a
//! default implementation, so plugins override only what they need.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::*;
use crate::error::{Error, Result};
use crate::transport::{IncomingCall, Peer, Request, Response};

/// Behavior of a plugin served by a [`Stub`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Runtime configuration; the reply carries the plugin's subscription
    /// and capability masks.
    async fn configure(&self, req: ConfigureRequest) -> anyhow::Result<ConfigureResponse> {
        let _ = req;
        Ok(ConfigureResponse::default())
    }

    /// One chunk of the runtime's current pods and containers.
    async fn synchronize(&self, req: SynchronizeRequest) -> anyhow::Result<SynchronizeResponse> {
        Ok(SynchronizeResponse {
            update: Vec::new(),
            more: req.more,
        })
    }

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> anyhow::Result<CreateContainerResponse> {
        let _ = req;
        Ok(CreateContainerResponse::default())
    }

    async fn update_container(
        &self,
        req: UpdateContainerRequest,
    ) -> anyhow::Result<UpdateContainerResponse> {
        let _ = req;
        Ok(UpdateContainerResponse::default())
    }

    async fn stop_container(
        &self,
        req: StopContainerRequest,
    ) -> anyhow::Result<StopContainerResponse> {
        let _ = req;
        Ok(StopContainerResponse::default())
    }

    async fn update_pod_sandbox(&self, req: UpdatePodSandboxRequest) -> anyhow::Result<()> {
        let _ = req;
        Ok(())
    }

    /// Any lifecycle event without a dedicated response payload.
    async fn state_change(&self, event: StateChangeEvent) -> anyhow::Result<()> {
        let _ = event;
        Ok(())
    }

    async fn validate_container_adjustment(
        &self,
        req: ValidateContainerAdjustmentRequest,
    ) -> anyhow::Result<ValidateContainerAdjustmentResponse> {
        let _ = req;
        Ok(ValidateContainerAdjustmentResponse::accept())
    }

    /// The runtime is shutting the plugin down.
    async fn shutdown(&self) {}
}

/// Connection of one plugin to one runtime.
pub struct Stub {
    peer: Arc<Peer>,
    name: String,
    idx: String,
}

impl Stub {
    /// Connect to the runtime's socket and serve `plugin` on the
    /// connection. Call [`Stub::register`] afterwards to become visible.
    pub async fn connect(
        socket_path: &Path,
        name: &str,
        idx: &str,
        plugin: Arc<dyn Plugin>,
    ) -> Result<Stub> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            Error::transport(
                format!("{}-{}", idx, name),
                format!("failed to connect to {}: {}", socket_path.display(), e),
            )
        })?;
        Ok(Self::serve(stream, name, idx, plugin))
    }

    /// Serve `plugin` on an already-connected stream. Launched plugins
    /// inherit theirs as fd 3, see `NRI_PLUGIN_SOCKET`.
    pub fn serve<S>(stream: S, name: &str, idx: &str, plugin: Arc<dyn Plugin>) -> Stub
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let (peer, incoming) = Peer::open(stream);
        tokio::spawn(dispatch(plugin, incoming));
        Stub {
            peer,
            name: name.to_string(),
            idx: idx.to_string(),
        }
    }

    /// Register with the runtime. Resolves once the runtime acknowledges;
    /// configuration and synchronization follow on the runtime's
    /// initiative.
    pub async fn register(&self) -> Result<()> {
        let req = RegisterPluginRequest {
            plugin_name: self.name.clone(),
            plugin_idx: self.idx.clone(),
        };
        let response = self
            .peer
            .call(Request::RegisterPlugin(req))
            .await
            .map_err(|e| Error::transport(self.id(), e.to_string()))?;
        match response {
            Response::Empty => {
                info!("plugin {} registered with runtime", self.id());
                Ok(())
            }
            Response::Error(reason) => Err(Error::transport(
                self.id(),
                format!("registration failed: {}", reason),
            )),
            other => Err(Error::protocol(
                self.id(),
                format!("unexpected response {:?}", other),
            )),
        }
    }

    /// Request updates to, and evictions of, existing containers. Returns
    /// the updates the runtime refused.
    pub async fn update_containers(
        &self,
        update: Vec<ContainerUpdate>,
        evict: Vec<ContainerEviction>,
    ) -> Result<UpdateContainersResponse> {
        let req = UpdateContainersRequest { update, evict };
        let response = self
            .peer
            .call(Request::UpdateContainers(req))
            .await
            .map_err(|e| Error::transport(self.id(), e.to_string()))?;
        match response {
            Response::UpdateContainers(response) => Ok(response),
            Response::Error(reason) => Err(Error::transport(
                self.id(),
                format!("update request failed: {}", reason),
            )),
            other => Err(Error::protocol(
                self.id(),
                format!("unexpected response {:?}", other),
            )),
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.idx, self.name)
    }

    /// Close the connection to the runtime.
    pub fn close(&self) {
        self.peer.close();
    }

    /// Token cancelled when the connection goes away.
    pub fn closed(&self) -> CancellationToken {
        self.peer.closed()
    }
}

// Serve runtime calls, each on its own task. Within one pipeline the
// engine awaits every reply before the next call, so ordering is its
// concern; across pipelines calls may overlap.
async fn dispatch(plugin: Arc<dyn Plugin>, mut incoming: mpsc::Receiver<IncomingCall>) {
    while let Some(call) = incoming.recv().await {
        let plugin = plugin.clone();
        tokio::spawn(async move {
            let response = handle(plugin.as_ref(), call.request).await;
            let _ = call.reply.send(response);
        });
    }
    debug!("plugin connection closed");
}

async fn handle(plugin: &dyn Plugin, request: Request) -> Response {
    match request {
        Request::Configure(req) => match plugin.configure(req).await {
            Ok(response) => Response::Configure(response),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Synchronize(req) => match plugin.synchronize(req).await {
            Ok(response) => Response::Synchronize(response),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::CreateContainer(req) => match plugin.create_container(req).await {
            Ok(response) => Response::CreateContainer(response),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::UpdateContainer(req) => match plugin.update_container(req).await {
            Ok(response) => Response::UpdateContainer(response),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StopContainer(req) => match plugin.stop_container(req).await {
            Ok(response) => Response::StopContainer(response),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::UpdatePodSandbox(req) => match plugin.update_pod_sandbox(req).await {
            Ok(()) => Response::Empty,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StateChange(event) => match plugin.state_change(event).await {
            Ok(()) => Response::Empty,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ValidateContainerAdjustment(req) => {
            match plugin.validate_container_adjustment(*req).await {
                Ok(response) => Response::ValidateContainerAdjustment(response),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::Shutdown => {
            plugin.shutdown().await;
            Response::Empty
        }
        Request::RegisterPlugin(_) | Request::UpdateContainers(_) => {
            Response::Error("unexpected call initiated by runtime".to_string())
        }
    }
}
