//! Shared harness for the integration tests: an engine wired to a
//! recording runtime, and a configurable wire-level test plugin.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::sleep;

use nri_adaptation::api::*;
use nri_adaptation::stub::{self, Stub};
use nri_adaptation::{
    Adaptation, Event, EventMask, Options, SyncCallback, SyncSnapshot, UpdateCallback,
};

pub const WAIT_DEADLINE: Duration = Duration::from_secs(5);

/// Engine plus the state the fake runtime callbacks record.
pub struct TestRuntime {
    pub engine: Adaptation,
    pub socket_path: PathBuf,
    /// Updates the runtime applied through the update callback.
    pub applied: Arc<Mutex<Vec<ContainerUpdate>>>,
    _dir: tempfile::TempDir,
}

impl TestRuntime {
    /// Start an engine in a temporary directory with the given snapshot
    /// as the runtime's current state.
    pub async fn start(snapshot: SyncSnapshot, tweak: impl FnOnce(&mut Options)) -> TestRuntime {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut options = Options::default();
        options.socket_path = dir.path().join("nri.sock");
        options.plugin_path = dir.path().join("plugins");
        options.plugin_config_path = dir.path().join("conf.d");
        tweak(&mut options);
        let socket_path = options.socket_path.clone();

        let sync_cb: SyncCallback = Arc::new(move || {
            let snapshot = snapshot.clone();
            async move { Ok(snapshot) }.boxed()
        });
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_cb = applied.clone();
        let update_cb: UpdateCallback = Arc::new(move |updates| {
            let applied = applied_cb.clone();
            async move {
                applied.lock().unwrap().extend(updates);
                Ok(Vec::new())
            }
            .boxed()
        });

        let engine = Adaptation::new(
            "test-runtime",
            "0.1.0",
            Some(sync_cb),
            Some(update_cb),
            options,
        )
        .unwrap();
        engine.start().await.unwrap();

        TestRuntime {
            engine,
            socket_path,
            applied,
            _dir: dir,
        }
    }

    /// Connect a plugin and wait until the engine has synchronized and
    /// registered it.
    pub async fn connect(&self, idx: &str, name: &str, plugin: Arc<TestPlugin>) -> Stub {
        let stub = Stub::connect(&self.socket_path, name, idx, plugin.clone())
            .await
            .unwrap();
        stub.register().await.unwrap();
        plugin.wait_synchronized().await;
        let (idx, name) = (idx.to_string(), name.to_string());
        wait_until(|| {
            self.engine
                .plugins()
                .iter()
                .any(|p| p.index == idx && p.name == name)
        })
        .await;
        stub
    }
}

/// Wire-level plugin with configurable responses and call recording.
pub struct TestPlugin {
    id: String,
    events: EventMask,
    calls: Arc<Mutex<Vec<String>>>,
    sync_calls: Mutex<Vec<(usize, usize, bool)>>,
    adjust: Option<ContainerAdjustment>,
    create_updates: Vec<ContainerUpdate>,
    sync_updates: Vec<ContainerUpdate>,
    create_delay: Duration,
    reject_reason: Option<String>,
    validation_seen: Mutex<Option<ValidateContainerAdjustmentRequest>>,
}

impl TestPlugin {
    pub fn new(id: &str, events: &[Event]) -> TestPlugin {
        let mut mask = EventMask::new();
        mask.set(events);
        TestPlugin {
            id: id.to_string(),
            events: mask,
            calls: Arc::new(Mutex::new(Vec::new())),
            sync_calls: Mutex::new(Vec::new()),
            adjust: None,
            create_updates: Vec::new(),
            sync_updates: Vec::new(),
            create_delay: Duration::ZERO,
            reject_reason: None,
            validation_seen: Mutex::new(None),
        }
    }

    /// Record calls into a recorder shared between plugins.
    pub fn with_recorder(mut self, recorder: Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = recorder;
        self
    }

    /// Return this adjustment from `create_container`.
    pub fn with_adjust(mut self, adjust: ContainerAdjustment) -> Self {
        self.adjust = Some(adjust);
        self
    }

    /// Return these updates from `create_container`.
    pub fn with_create_updates(mut self, updates: Vec<ContainerUpdate>) -> Self {
        self.create_updates = updates;
        self
    }

    /// Return these updates from the final `synchronize` chunk.
    pub fn with_sync_updates(mut self, updates: Vec<ContainerUpdate>) -> Self {
        self.sync_updates = updates;
        self
    }

    /// Stall every `create_container` call for this long.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Reject any validation request with this reason.
    pub fn rejecting(mut self, reason: &str) -> Self {
        self.reject_reason = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// `(pods, containers, more)` per synchronize call received.
    pub fn sync_calls(&self) -> Vec<(usize, usize, bool)> {
        self.sync_calls.lock().unwrap().clone()
    }

    pub fn validation_seen(&self) -> Option<ValidateContainerAdjustmentRequest> {
        self.validation_seen.lock().unwrap().clone()
    }

    pub async fn wait_synchronized(&self) {
        wait_until(|| self.sync_calls().iter().any(|(_, _, more)| !more)).await;
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.id, call));
    }
}

#[async_trait]
impl stub::Plugin for TestPlugin {
    async fn configure(&self, _req: ConfigureRequest) -> anyhow::Result<ConfigureResponse> {
        Ok(ConfigureResponse {
            events: self.events.raw_value(),
            capabilities: 0,
        })
    }

    async fn synchronize(&self, req: SynchronizeRequest) -> anyhow::Result<SynchronizeResponse> {
        self.sync_calls
            .lock()
            .unwrap()
            .push((req.pods.len(), req.containers.len(), req.more));
        let update = if req.more {
            Vec::new()
        } else {
            self.sync_updates.clone()
        };
        Ok(SynchronizeResponse {
            update,
            more: req.more,
        })
    }

    async fn create_container(
        &self,
        req: CreateContainerRequest,
    ) -> anyhow::Result<CreateContainerResponse> {
        self.record(&format!("create-container/{}", req.container.id));
        if self.create_delay > Duration::ZERO {
            sleep(self.create_delay).await;
        }
        Ok(CreateContainerResponse {
            adjust: self.adjust.clone(),
            update: self.create_updates.clone(),
            evict: Vec::new(),
        })
    }

    async fn update_container(
        &self,
        req: UpdateContainerRequest,
    ) -> anyhow::Result<UpdateContainerResponse> {
        self.record(&format!("update-container/{}", req.container.id));
        Ok(UpdateContainerResponse {
            update: self.create_updates.clone(),
            evict: Vec::new(),
        })
    }

    async fn stop_container(
        &self,
        req: StopContainerRequest,
    ) -> anyhow::Result<StopContainerResponse> {
        self.record(&format!("stop-container/{}", req.container.id));
        Ok(StopContainerResponse {
            update: self.create_updates.clone(),
        })
    }

    async fn state_change(&self, event: StateChangeEvent) -> anyhow::Result<()> {
        self.record(&event.event.to_string());
        Ok(())
    }

    async fn validate_container_adjustment(
        &self,
        req: ValidateContainerAdjustmentRequest,
    ) -> anyhow::Result<ValidateContainerAdjustmentResponse> {
        *self.validation_seen.lock().unwrap() = Some(req);
        match &self.reject_reason {
            Some(reason) => Ok(ValidateContainerAdjustmentResponse::reject(reason)),
            None => Ok(ValidateContainerAdjustmentResponse::accept()),
        }
    }
}

/// Poll a condition until it holds or the deadline expires.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", WAIT_DEADLINE);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn pod(id: &str) -> PodSandbox {
    PodSandbox {
        id: id.to_string(),
        name: format!("{}-name", id),
        uid: format!("{}-uid", id),
        namespace: "default".to_string(),
        ..Default::default()
    }
}

pub fn container(id: &str, pod_id: &str) -> Container {
    Container {
        id: id.to_string(),
        pod_sandbox_id: pod_id.to_string(),
        name: format!("{}-name", id),
        state: ContainerState::Created,
        ..Default::default()
    }
}
