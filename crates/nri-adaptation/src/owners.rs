//! Ownership ledger for one request pipeline.
//!
//! While a single pipeline merges the responses of multiple plugins, the
//! ledger records which plugin first set each mutable field of each
//! container. A second plugin touching an already-claimed field is a
//! conflict unless the slot was first cleared by the claimant, which
//! leaves a removal sentinel the claim then replaces.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scalar fields with exactly one owner per container per pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimpleField {
    Args,
    CgroupsPath,
    OomScoreAdj,
    SeccompProfile,
    IoPriority,
    Scheduler,
    MemoryLimit,
    MemoryReservation,
    MemorySwapLimit,
    MemoryKernelLimit,
    MemoryKernelTcpLimit,
    MemorySwappiness,
    MemoryDisableOomKiller,
    MemoryUseHierarchy,
    CpuShares,
    CpuQuota,
    CpuPeriod,
    CpuRealtimeRuntime,
    CpuRealtimePeriod,
    CpusetCpus,
    CpusetMems,
    PidsLimit,
    BlockioClass,
    RdtClass,
}

impl fmt::Display for SimpleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimpleField::Args => "argument list",
            SimpleField::CgroupsPath => "cgroups path",
            SimpleField::OomScoreAdj => "OOM score adjustment",
            SimpleField::SeccompProfile => "seccomp profile",
            SimpleField::IoPriority => "I/O priority",
            SimpleField::Scheduler => "scheduler",
            SimpleField::MemoryLimit => "memory limit",
            SimpleField::MemoryReservation => "memory reservation",
            SimpleField::MemorySwapLimit => "memory swap limit",
            SimpleField::MemoryKernelLimit => "memory kernel limit",
            SimpleField::MemoryKernelTcpLimit => "memory kernel TCP limit",
            SimpleField::MemorySwappiness => "memory swappiness",
            SimpleField::MemoryDisableOomKiller => "memory OOM killer toggle",
            SimpleField::MemoryUseHierarchy => "memory hierarchy toggle",
            SimpleField::CpuShares => "cpu shares",
            SimpleField::CpuQuota => "cpu quota",
            SimpleField::CpuPeriod => "cpu period",
            SimpleField::CpuRealtimeRuntime => "cpu realtime runtime",
            SimpleField::CpuRealtimePeriod => "cpu realtime period",
            SimpleField::CpusetCpus => "cpuset cpus",
            SimpleField::CpusetMems => "cpuset mems",
            SimpleField::PidsLimit => "pids limit",
            SimpleField::BlockioClass => "block I/O class",
            SimpleField::RdtClass => "RDT class",
        };
        f.write_str(name)
    }
}

/// Fields claimed at per-sub-key granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompoundField {
    /// Keyed by annotation key.
    Annotation,
    /// Keyed by destination path.
    Mount,
    /// Keyed by variable name.
    Env,
    /// Keyed by device path.
    Device,
    /// Keyed by fully-qualified device name.
    CdiDevice,
    /// Keyed by namespace type.
    Namespace,
    /// Keyed by host interface name.
    NetDevice,
    /// Keyed by sysctl key.
    Sysctl,
    /// Keyed by page size.
    HugepageLimit,
    /// Keyed by cgroup v2 entry key.
    Unified,
    /// Keyed by rlimit type.
    Rlimit,
}

impl fmt::Display for CompoundField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompoundField::Annotation => "annotation",
            CompoundField::Mount => "mount",
            CompoundField::Env => "env",
            CompoundField::Device => "device",
            CompoundField::CdiDevice => "CDI device",
            CompoundField::Namespace => "namespace",
            CompoundField::NetDevice => "network device",
            CompoundField::Sysctl => "sysctl",
            CompoundField::HugepageLimit => "hugepage limit",
            CompoundField::Unified => "unified cgroup entry",
            CompoundField::Rlimit => "rlimit",
        };
        f.write_str(name)
    }
}

/// Owner of a single slot; `cleared` marks a removal sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOwner {
    pub plugin: String,
    pub cleared: bool,
}

impl FieldOwner {
    fn owned(plugin: &str) -> Self {
        FieldOwner {
            plugin: plugin.to_string(),
            cleared: false,
        }
    }

    fn sentinel(plugin: &str) -> Self {
        FieldOwner {
            plugin: plugin.to_string(),
            cleared: true,
        }
    }
}

/// Ownership state of one container's fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnedFields {
    pub simple: HashMap<SimpleField, FieldOwner>,
    pub compound: HashMap<CompoundField, HashMap<String, FieldOwner>>,
}

/// The ledger: per container ID, who owns what.
///
/// Lives for the duration of a single pipeline run; serializable so it can
/// travel inside validation requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwningPlugins {
    pub owners: HashMap<String, OwnedFields>,
}

impl OwningPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a scalar field of `container` for `plugin`.
    pub fn claim_simple(
        &mut self,
        container: &str,
        field: SimpleField,
        plugin: &str,
    ) -> Result<()> {
        let fields = self.owners.entry(container.to_string()).or_default();
        claim_slot(
            fields
                .simple
                .entry(field)
                .or_insert_with(|| FieldOwner::owned(plugin)),
            plugin,
            field.to_string(),
        )
    }

    /// Claim one sub-key of a compound field of `container` for `plugin`.
    pub fn claim_compound(
        &mut self,
        container: &str,
        field: CompoundField,
        key: &str,
        plugin: &str,
    ) -> Result<()> {
        let fields = self.owners.entry(container.to_string()).or_default();
        claim_slot(
            fields
                .compound
                .entry(field)
                .or_default()
                .entry(key.to_string())
                .or_insert_with(|| FieldOwner::owned(plugin)),
            plugin,
            format!("{} {:?}", field, key),
        )
    }

    /// Mark a scalar field with a removal sentinel bound to `plugin`.
    pub fn clear_simple(&mut self, container: &str, field: SimpleField, plugin: &str) {
        self.owners
            .entry(container.to_string())
            .or_default()
            .simple
            .insert(field, FieldOwner::sentinel(plugin));
    }

    /// Mark one sub-key of a compound field with a removal sentinel.
    pub fn clear_compound(
        &mut self,
        container: &str,
        field: CompoundField,
        key: &str,
        plugin: &str,
    ) {
        self.owners
            .entry(container.to_string())
            .or_default()
            .compound
            .entry(field)
            .or_default()
            .insert(key.to_string(), FieldOwner::sentinel(plugin));
    }

    /// Owner of a scalar field, if it is currently claimed (not cleared).
    pub fn owner_of_simple(&self, container: &str, field: SimpleField) -> Option<&str> {
        self.owners
            .get(container)
            .and_then(|f| f.simple.get(&field))
            .filter(|o| !o.cleared)
            .map(|o| o.plugin.as_str())
    }

    /// Owner of one compound sub-key, if it is currently claimed.
    pub fn owner_of_compound(
        &self,
        container: &str,
        field: CompoundField,
        key: &str,
    ) -> Option<&str> {
        self.owners
            .get(container)
            .and_then(|f| f.compound.get(&field))
            .and_then(|m| m.get(key))
            .filter(|o| !o.cleared)
            .map(|o| o.plugin.as_str())
    }
}

// Shared claim semantics: an unclaimed slot (freshly inserted above) is
// already owned by the claimant; a sentinel left by the claimant is
// replaced; anything else is a conflict naming both plugins.
fn claim_slot(slot: &mut FieldOwner, plugin: &str, what: String) -> Result<()> {
    if slot.plugin == plugin {
        slot.cleared = false;
        return Ok(());
    }
    Err(Error::conflict(&slot.plugin, plugin, what))
}
