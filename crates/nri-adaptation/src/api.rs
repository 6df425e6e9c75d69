//! Data model shared between the engine and plugins.
//!
//! Pods and containers are produced by the runtime and are immutable to the
//! engine; plugins express requested changes through sparse
//! [`ContainerAdjustment`] overlays and [`ContainerUpdate`] requests.
//!
//! Scalar encoding: `Option` fields on adjustments and resources mean
//! *absent = leave unchanged*. For string-classed scalars (RDT class,
//! block I/O class, cgroups path) an explicit empty string means *clear*.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::owners::OwningPlugins;

/// Prefix marking a compound-field key for removal.
pub const REMOVAL_MARKER: &str = "-";

/// Mark a key for removal.
pub fn mark_for_removal(key: &str) -> String {
    format!("{}{}", REMOVAL_MARKER, key)
}

/// If `key` carries the removal marker, return the unmarked key.
pub fn marked_for_removal(key: &str) -> Option<&str> {
    key.strip_prefix(REMOVAL_MARKER)
}

/// A pod sandbox as known to the runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodSandbox {
    pub id: String,
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub runtime_handler: String,
    pub pid: u32,
    pub ips: Vec<String>,
    pub linux: Option<LinuxPodSandbox>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxPodSandbox {
    pub namespaces: Vec<LinuxNamespace>,
    pub pod_overhead: Option<LinuxResources>,
    pub pod_resources: Option<LinuxResources>,
    pub resources: Option<LinuxResources>,
    pub cgroup_parent: String,
    pub cgroups_path: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
    Removed,
}

/// A container as known to the runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub id: String,
    pub pod_sandbox_id: String,
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub hooks: Option<Hooks>,
    pub linux: Option<LinuxContainer>,
    pub user: Option<ContainerUser>,
    pub cdi_devices: Vec<CdiDevice>,
    pub rlimits: Vec<PosixRlimit>,
    pub pid: u32,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerUser {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub additional_gids: Vec<u32>,
    pub username: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxContainer {
    pub namespaces: Vec<LinuxNamespace>,
    pub devices: Vec<LinuxDevice>,
    pub resources: Option<LinuxResources>,
    pub oom_score_adj: Option<i32>,
    pub cgroups_path: String,
    pub seccomp_profile: Option<SecurityProfile>,
    pub io_priority: Option<LinuxIoPriority>,
    pub scheduler: Option<LinuxScheduler>,
    pub net_devices: HashMap<String, LinuxNetDevice>,
    pub sysctls: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub type_: String,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub destination: String,
    pub source: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub options: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxDevice {
    pub path: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub major: i64,
    pub minor: i64,
    pub file_mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxDeviceCgroup {
    pub allow: bool,
    #[serde(rename = "type")]
    pub type_: String,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub access: String,
}

/// Reference to a CDI device by fully-qualified name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdiDevice {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosixRlimit {
    #[serde(rename = "type")]
    pub type_: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxIoPriority {
    pub class: String,
    pub priority: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxScheduler {
    pub policy: String,
    pub nice: Option<i32>,
    pub priority: Option<i32>,
    pub runtime: Option<u64>,
    pub deadline: Option<u64>,
    pub period: Option<u64>,
}

/// A host network device moved into the container, keyed by host name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxNetDevice {
    /// Name of the device inside the container, empty to keep the host name.
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProfileKind {
    #[default]
    RuntimeDefault,
    Unconfined,
    Localhost,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    pub kind: SecurityProfileKind,
    /// Reference to a node-local profile, for [`SecurityProfileKind::Localhost`].
    pub localhost_ref: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxResources {
    pub cpu: Option<LinuxCpu>,
    pub memory: Option<LinuxMemory>,
    pub hugepage_limits: Vec<HugepageLimit>,
    /// Unified cgroup v2 entries.
    pub unified: HashMap<String, String>,
    /// Device cgroup rules, order-preserving.
    pub devices: Vec<LinuxDeviceCgroup>,
    /// Block I/O class; empty string clears it.
    pub blockio_class: Option<String>,
    /// RDT class; empty string clears it.
    pub rdt_class: Option<String>,
    pub pids: Option<LinuxPids>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxCpu {
    pub shares: Option<u64>,
    pub quota: Option<i64>,
    pub period: Option<u64>,
    pub realtime_runtime: Option<i64>,
    pub realtime_period: Option<u64>,
    pub cpus: Option<String>,
    pub mems: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxMemory {
    pub limit: Option<i64>,
    pub reservation: Option<i64>,
    pub swap: Option<i64>,
    pub kernel: Option<i64>,
    pub kernel_tcp: Option<i64>,
    pub swappiness: Option<u64>,
    pub disable_oom_killer: Option<bool>,
    pub use_hierarchy: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HugepageLimit {
    pub page_size: String,
    pub limit: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxPids {
    pub limit: i64,
}

/// OCI hooks, accumulated from all plugins in plugin order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hooks {
    pub prestart: Vec<Hook>,
    pub create_runtime: Vec<Hook>,
    pub create_container: Vec<Hook>,
    pub start_container: Vec<Hook>,
    pub poststart: Vec<Hook>,
    pub poststop: Vec<Hook>,
}

impl Hooks {
    pub fn append(&mut self, other: &Hooks) {
        self.prestart.extend(other.prestart.iter().cloned());
        self.create_runtime.extend(other.create_runtime.iter().cloned());
        self.create_container
            .extend(other.create_container.iter().cloned());
        self.start_container
            .extend(other.start_container.iter().cloned());
        self.poststart.extend(other.poststart.iter().cloned());
        self.poststop.extend(other.poststop.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.prestart.is_empty()
            && self.create_runtime.is_empty()
            && self.create_container.is_empty()
            && self.start_container.is_empty()
            && self.poststart.is_empty()
            && self.poststop.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hook {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub timeout: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Requested change to the argument list of a container being created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentAdjustment {
    /// Hard replacement of the argument list.
    Set(Vec<String>),
    /// Append to the composed argument list.
    Append(Vec<String>),
}

/// A sparse overlay of requested mutations to a container being created.
///
/// Removals are encoded by prefixing the relevant key (annotation key,
/// mount destination, environment name, device path, …) with
/// [`REMOVAL_MARKER`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerAdjustment {
    pub annotations: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<KeyValue>,
    pub hooks: Option<Hooks>,
    pub linux: Option<LinuxContainerAdjustment>,
    pub rlimits: Vec<PosixRlimit>,
    pub cdi_devices: Vec<CdiDevice>,
    pub args: Option<ArgumentAdjustment>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxContainerAdjustment {
    pub devices: Vec<LinuxDevice>,
    pub resources: Option<LinuxResources>,
    pub cgroups_path: Option<String>,
    pub oom_score_adj: Option<i32>,
    pub seccomp_profile: Option<SecurityProfile>,
    pub io_priority: Option<LinuxIoPriority>,
    pub scheduler: Option<LinuxScheduler>,
    pub namespaces: Vec<LinuxNamespace>,
    pub net_devices: HashMap<String, LinuxNetDevice>,
    pub sysctls: HashMap<String, String>,
}

impl LinuxContainerAdjustment {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
            && self.resources.is_none()
            && self.cgroups_path.is_none()
            && self.oom_score_adj.is_none()
            && self.seccomp_profile.is_none()
            && self.io_priority.is_none()
            && self.scheduler.is_none()
            && self.namespaces.is_empty()
            && self.net_devices.is_empty()
            && self.sysctls.is_empty()
    }
}

impl ContainerAdjustment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
            && self.mounts.is_empty()
            && self.env.is_empty()
            && self.hooks.as_ref().map_or(true, Hooks::is_empty)
            && self.linux.as_ref().map_or(true, LinuxContainerAdjustment::is_empty)
            && self.rlimits.is_empty()
            && self.cdi_devices.is_empty()
            && self.args.is_none()
    }

    pub fn add_annotation(&mut self, key: &str, value: &str) -> &mut Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn remove_annotation(&mut self, key: &str) -> &mut Self {
        self.annotations.insert(mark_for_removal(key), String::new());
        self
    }

    pub fn add_mount(&mut self, mount: Mount) -> &mut Self {
        self.mounts.push(mount);
        self
    }

    pub fn remove_mount(&mut self, destination: &str) -> &mut Self {
        self.mounts.push(Mount {
            destination: mark_for_removal(destination),
            ..Default::default()
        });
        self
    }

    pub fn add_env(&mut self, key: &str, value: &str) -> &mut Self {
        self.env.push(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn remove_env(&mut self, key: &str) -> &mut Self {
        self.env.push(KeyValue {
            key: mark_for_removal(key),
            value: String::new(),
        });
        self
    }

    pub fn add_hooks(&mut self, hooks: &Hooks) -> &mut Self {
        self.hooks.get_or_insert_with(Hooks::default).append(hooks);
        self
    }

    pub fn add_device(&mut self, device: LinuxDevice) -> &mut Self {
        self.linux_mut().devices.push(device);
        self
    }

    pub fn remove_device(&mut self, path: &str) -> &mut Self {
        self.linux_mut().devices.push(LinuxDevice {
            path: mark_for_removal(path),
            ..Default::default()
        });
        self
    }

    pub fn add_cdi_device(&mut self, name: &str) -> &mut Self {
        self.cdi_devices.push(CdiDevice {
            name: name.to_string(),
        });
        self
    }

    pub fn add_rlimit(&mut self, type_: &str, hard: u64, soft: u64) -> &mut Self {
        self.rlimits.push(PosixRlimit {
            type_: type_.to_string(),
            hard,
            soft,
        });
        self
    }

    /// Hard-replace the argument list.
    pub fn set_args(&mut self, args: Vec<String>) -> &mut Self {
        self.args = Some(ArgumentAdjustment::Set(args));
        self
    }

    /// Append to the composed argument list.
    pub fn append_args(&mut self, args: Vec<String>) -> &mut Self {
        self.args = Some(ArgumentAdjustment::Append(args));
        self
    }

    pub fn set_linux_cgroups_path(&mut self, path: &str) -> &mut Self {
        self.linux_mut().cgroups_path = Some(path.to_string());
        self
    }

    pub fn set_linux_oom_score_adj(&mut self, adj: i32) -> &mut Self {
        self.linux_mut().oom_score_adj = Some(adj);
        self
    }

    pub fn set_linux_seccomp_profile(&mut self, profile: SecurityProfile) -> &mut Self {
        self.linux_mut().seccomp_profile = Some(profile);
        self
    }

    pub fn set_linux_io_priority(&mut self, prio: LinuxIoPriority) -> &mut Self {
        self.linux_mut().io_priority = Some(prio);
        self
    }

    pub fn set_linux_scheduler(&mut self, scheduler: LinuxScheduler) -> &mut Self {
        self.linux_mut().scheduler = Some(scheduler);
        self
    }

    pub fn set_linux_namespace(&mut self, type_: &str, path: &str) -> &mut Self {
        self.linux_mut().namespaces.push(LinuxNamespace {
            type_: type_.to_string(),
            path: path.to_string(),
        });
        self
    }

    pub fn remove_linux_namespace(&mut self, type_: &str) -> &mut Self {
        self.linux_mut().namespaces.push(LinuxNamespace {
            type_: mark_for_removal(type_),
            path: String::new(),
        });
        self
    }

    pub fn add_linux_net_device(&mut self, host_name: &str, device: LinuxNetDevice) -> &mut Self {
        self.linux_mut()
            .net_devices
            .insert(host_name.to_string(), device);
        self
    }

    pub fn set_linux_sysctl(&mut self, key: &str, value: &str) -> &mut Self {
        self.linux_mut()
            .sysctls
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn remove_linux_sysctl(&mut self, key: &str) -> &mut Self {
        self.linux_mut()
            .sysctls
            .insert(mark_for_removal(key), String::new());
        self
    }

    pub fn set_linux_cpu_shares(&mut self, shares: u64) -> &mut Self {
        self.linux_cpu_mut().shares = Some(shares);
        self
    }

    pub fn set_linux_cpu_quota(&mut self, quota: i64) -> &mut Self {
        self.linux_cpu_mut().quota = Some(quota);
        self
    }

    pub fn set_linux_cpu_period(&mut self, period: u64) -> &mut Self {
        self.linux_cpu_mut().period = Some(period);
        self
    }

    pub fn set_linux_cpuset_cpus(&mut self, cpus: &str) -> &mut Self {
        self.linux_cpu_mut().cpus = Some(cpus.to_string());
        self
    }

    pub fn set_linux_cpuset_mems(&mut self, mems: &str) -> &mut Self {
        self.linux_cpu_mut().mems = Some(mems.to_string());
        self
    }

    pub fn set_linux_memory_limit(&mut self, limit: i64) -> &mut Self {
        self.linux_memory_mut().limit = Some(limit);
        self
    }

    pub fn set_linux_memory_swap(&mut self, swap: i64) -> &mut Self {
        self.linux_memory_mut().swap = Some(swap);
        self
    }

    pub fn add_linux_hugepage_limit(&mut self, page_size: &str, limit: u64) -> &mut Self {
        self.linux_resources_mut().hugepage_limits.push(HugepageLimit {
            page_size: page_size.to_string(),
            limit,
        });
        self
    }

    pub fn add_linux_unified(&mut self, key: &str, value: &str) -> &mut Self {
        self.linux_resources_mut()
            .unified
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn add_linux_device_cgroup_rule(&mut self, rule: LinuxDeviceCgroup) -> &mut Self {
        self.linux_resources_mut().devices.push(rule);
        self
    }

    /// Set the RDT class; an empty string clears it.
    pub fn set_linux_rdt_class(&mut self, class: &str) -> &mut Self {
        self.linux_resources_mut().rdt_class = Some(class.to_string());
        self
    }

    /// Set the block I/O class; an empty string clears it.
    pub fn set_linux_blockio_class(&mut self, class: &str) -> &mut Self {
        self.linux_resources_mut().blockio_class = Some(class.to_string());
        self
    }

    pub fn set_linux_pids_limit(&mut self, limit: i64) -> &mut Self {
        self.linux_resources_mut().pids = Some(LinuxPids { limit });
        self
    }

    fn linux_mut(&mut self) -> &mut LinuxContainerAdjustment {
        self.linux.get_or_insert_with(Default::default)
    }

    fn linux_resources_mut(&mut self) -> &mut LinuxResources {
        self.linux_mut().resources.get_or_insert_with(Default::default)
    }

    fn linux_cpu_mut(&mut self) -> &mut LinuxCpu {
        self.linux_resources_mut().cpu.get_or_insert_with(Default::default)
    }

    fn linux_memory_mut(&mut self) -> &mut LinuxMemory {
        self.linux_resources_mut().memory.get_or_insert_with(Default::default)
    }
}

/// A request to re-apply Linux resources to an existing container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerUpdate {
    pub container_id: String,
    pub linux: Option<LinuxContainerUpdate>,
    /// Failure to apply this update is not fatal to the triggering request.
    pub ignore_failure: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxContainerUpdate {
    pub resources: Option<LinuxResources>,
}

impl ContainerUpdate {
    pub fn new(container_id: &str) -> Self {
        ContainerUpdate {
            container_id: container_id.to_string(),
            ..Default::default()
        }
    }

    pub fn set_ignore_failure(&mut self, ignore: bool) -> &mut Self {
        self.ignore_failure = ignore;
        self
    }

    pub fn set_linux_cpu_shares(&mut self, shares: u64) -> &mut Self {
        self.linux_cpu_mut().shares = Some(shares);
        self
    }

    pub fn set_linux_cpu_quota(&mut self, quota: i64) -> &mut Self {
        self.linux_cpu_mut().quota = Some(quota);
        self
    }

    pub fn set_linux_cpuset_cpus(&mut self, cpus: &str) -> &mut Self {
        self.linux_cpu_mut().cpus = Some(cpus.to_string());
        self
    }

    pub fn set_linux_memory_limit(&mut self, limit: i64) -> &mut Self {
        self.linux_memory_mut().limit = Some(limit);
        self
    }

    /// Set the RDT class; an empty string clears it.
    pub fn set_linux_rdt_class(&mut self, class: &str) -> &mut Self {
        self.linux_resources_mut().rdt_class = Some(class.to_string());
        self
    }

    /// Set the block I/O class; an empty string clears it.
    pub fn set_linux_blockio_class(&mut self, class: &str) -> &mut Self {
        self.linux_resources_mut().blockio_class = Some(class.to_string());
        self
    }

    pub fn set_linux_pids_limit(&mut self, limit: i64) -> &mut Self {
        self.linux_resources_mut().pids = Some(LinuxPids { limit });
        self
    }

    pub fn add_linux_unified(&mut self, key: &str, value: &str) -> &mut Self {
        self.linux_resources_mut()
            .unified
            .insert(key.to_string(), value.to_string());
        self
    }

    fn linux_resources_mut(&mut self) -> &mut LinuxResources {
        self.linux
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
    }

    fn linux_cpu_mut(&mut self) -> &mut LinuxCpu {
        self.linux_resources_mut().cpu.get_or_insert_with(Default::default)
    }

    fn linux_memory_mut(&mut self) -> &mut LinuxMemory {
        self.linux_resources_mut().memory.get_or_insert_with(Default::default)
    }
}

/// A request to destroy a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerEviction {
    pub container_id: String,
    /// Human-readable reason for the eviction.
    pub reason: String,
}

//
// Request and response payloads.
//

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPluginRequest {
    pub plugin_name: String,
    pub plugin_idx: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureRequest {
    /// Plugin-specific configuration blob, empty if none was found.
    pub config: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub registration_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureResponse {
    /// Raw subscription mask, see [`crate::EventMask`].
    pub events: u64,
    /// Raw capability mask, see [`crate::CapabilityMask`].
    pub capabilities: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeRequest {
    pub pods: Vec<PodSandbox>,
    pub containers: Vec<Container>,
    /// More chunks of the snapshot follow this one.
    pub more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronizeResponse {
    /// Initial container updates requested by the plugin.
    pub update: Vec<ContainerUpdate>,
    pub more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerRequest {
    pub pod: PodSandbox,
    pub container: Container,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerResponse {
    pub adjust: Option<ContainerAdjustment>,
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainerRequest {
    pub pod: PodSandbox,
    pub container: Container,
    /// Resources the runtime intends to apply.
    pub linux_resources: Option<LinuxResources>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainerResponse {
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainerRequest {
    pub pod: PodSandbox,
    pub container: Container,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainerResponse {
    pub update: Vec<ContainerUpdate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePodSandboxRequest {
    pub pod: PodSandbox,
    pub overhead: Option<LinuxResources>,
    pub resources: Option<LinuxResources>,
}

/// Lifecycle notification without a dedicated response payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub event: Event,
    pub pod: Option<PodSandbox>,
    pub container: Option<Container>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainersRequest {
    pub update: Vec<ContainerUpdate>,
    pub evict: Vec<ContainerEviction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainersResponse {
    /// Updates the runtime refused to apply.
    pub failed: Vec<ContainerUpdate>,
}

/// Identity of a connected plugin as seen by validators.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginInstance {
    pub index: String,
    pub name: String,
}

/// Read-only bundle handed to validators after assembly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateContainerAdjustmentRequest {
    pub pod: PodSandbox,
    pub container: Container,
    pub adjust: Option<ContainerAdjustment>,
    pub update: Vec<ContainerUpdate>,
    pub owners: OwningPlugins,
    pub plugins: Vec<PluginInstance>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateContainerAdjustmentResponse {
    pub reject: bool,
    pub reason: String,
}

impl ValidateContainerAdjustmentResponse {
    pub fn accept() -> Self {
        Self::default()
    }

    pub fn reject(reason: &str) -> Self {
        ValidateContainerAdjustmentResponse {
            reject: true,
            reason: reason.to_string(),
        }
    }
}
