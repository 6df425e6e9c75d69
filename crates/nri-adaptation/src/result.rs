//! Merging of per-plugin responses into one composed result.
//!
//! One [`PipelineResult`] exists per request pipeline. Plugin responses are
//! folded in strictly in plugin order; removal markers are applied before
//! additive changes of the same response, and every change is claimed in
//! the ownership ledger before it is merged, so the composed result is
//! deterministic and conflicts abort the pipeline.

use std::collections::HashMap;

use crate::api::*;
use crate::error::{Error, Result};
use crate::owners::{CompoundField, OwningPlugins, SimpleField};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineKind {
    /// Composing an adjustment for a container being created.
    Create,
    /// Composing updates in response to an update request.
    Update,
    /// Composing updates collected from a plain lifecycle event.
    Event,
}

pub(crate) struct PipelineResult {
    kind: PipelineKind,
    /// ID of the container the pipeline is about, empty for pod events.
    subject: String,
    adjust: ContainerAdjustment,
    updates: Vec<ContainerUpdate>,
    update_index: HashMap<String, usize>,
    evictions: Vec<ContainerEviction>,
    owners: OwningPlugins,
}

impl PipelineResult {
    pub fn for_create(container_id: &str) -> Self {
        Self::new(PipelineKind::Create, container_id)
    }

    pub fn for_update(container_id: &str) -> Self {
        Self::new(PipelineKind::Update, container_id)
    }

    pub fn for_event(container_id: &str) -> Self {
        Self::new(PipelineKind::Event, container_id)
    }

    fn new(kind: PipelineKind, subject: &str) -> Self {
        PipelineResult {
            kind,
            subject: subject.to_string(),
            adjust: ContainerAdjustment::default(),
            updates: Vec::new(),
            update_index: HashMap::new(),
            evictions: Vec::new(),
            owners: OwningPlugins::new(),
        }
    }

    pub fn owners(&self) -> &OwningPlugins {
        &self.owners
    }

    /// Fold one plugin's adjustment into the composed adjustment.
    pub fn apply_adjust(&mut self, plugin: &str, adjust: ContainerAdjustment) -> Result<()> {
        let id = self.subject.clone();

        self.adjust_annotations(&id, plugin, adjust.annotations)?;
        self.adjust_mounts(&id, plugin, adjust.mounts)?;
        self.adjust_env(&id, plugin, adjust.env)?;
        self.adjust_hooks(adjust.hooks);
        self.adjust_rlimits(&id, plugin, adjust.rlimits)?;
        self.adjust_cdi_devices(&id, plugin, adjust.cdi_devices)?;
        self.adjust_args(&id, plugin, adjust.args)?;

        if let Some(linux) = adjust.linux {
            self.adjust_devices(&id, plugin, linux.devices)?;
            self.adjust_namespaces(&id, plugin, linux.namespaces)?;
            self.adjust_net_devices(&id, plugin, linux.net_devices)?;
            self.adjust_sysctls(&id, plugin, linux.sysctls)?;

            let composed = self.adjust.linux.get_or_insert_with(Default::default);
            if let Some(path) = linux.cgroups_path {
                self.owners
                    .claim_simple(&id, SimpleField::CgroupsPath, plugin)?;
                composed.cgroups_path = Some(path);
            }
            if let Some(adj) = linux.oom_score_adj {
                self.owners
                    .claim_simple(&id, SimpleField::OomScoreAdj, plugin)?;
                composed.oom_score_adj = Some(adj);
            }
            if let Some(profile) = linux.seccomp_profile {
                self.owners
                    .claim_simple(&id, SimpleField::SeccompProfile, plugin)?;
                composed.seccomp_profile = Some(profile);
            }
            if let Some(prio) = linux.io_priority {
                self.owners
                    .claim_simple(&id, SimpleField::IoPriority, plugin)?;
                composed.io_priority = Some(prio);
            }
            if let Some(scheduler) = linux.scheduler {
                self.owners
                    .claim_simple(&id, SimpleField::Scheduler, plugin)?;
                composed.scheduler = Some(scheduler);
            }
            if let Some(resources) = linux.resources {
                merge_resources(
                    &mut self.owners,
                    &id,
                    plugin,
                    resources,
                    &mut composed.resources,
                )?;
            }
        }
        Ok(())
    }

    /// Fold one plugin's container updates into the composed update set.
    pub fn apply_updates(&mut self, plugin: &str, updates: Vec<ContainerUpdate>) -> Result<()> {
        for update in updates {
            let id = update.container_id.clone();
            if id.is_empty() {
                return Err(Error::protocol(plugin, "update without a container ID"));
            }
            if self.kind == PipelineKind::Create && id == self.subject {
                return Err(Error::protocol(
                    plugin,
                    format!(
                        "update targets container {:?} being created; use an adjustment",
                        id
                    ),
                ));
            }

            let idx = match self.update_index.get(&id).copied() {
                Some(i) => i,
                None => {
                    let mut slot = ContainerUpdate::new(&id);
                    slot.ignore_failure = true;
                    self.update_index.insert(id.clone(), self.updates.len());
                    self.updates.push(slot);
                    self.updates.len() - 1
                }
            };
            // A single must-succeed contributor makes the composed update
            // must-succeed.
            let slot = &mut self.updates[idx];
            slot.ignore_failure = slot.ignore_failure && update.ignore_failure;

            if let Some(linux) = update.linux {
                if let Some(resources) = linux.resources {
                    let dst = &mut slot
                        .linux
                        .get_or_insert_with(Default::default)
                        .resources;
                    merge_resources(&mut self.owners, &id, plugin, resources, dst)?;
                }
            }
        }
        Ok(())
    }

    /// Record requested evictions, deduplicated by container ID.
    pub fn apply_evictions(&mut self, evictions: Vec<ContainerEviction>) {
        for eviction in evictions {
            if self
                .evictions
                .iter()
                .any(|e| e.container_id == eviction.container_id)
            {
                continue;
            }
            self.evictions.push(eviction);
        }
    }

    pub fn into_create_response(self) -> CreateContainerResponse {
        CreateContainerResponse {
            adjust: if self.adjust.is_empty() {
                None
            } else {
                Some(self.adjust)
            },
            update: self.updates,
            evict: self.evictions,
        }
    }

    pub fn into_update_response(mut self) -> UpdateContainerResponse {
        // Surface the update for the requested container first.
        if let Some(&i) = self.update_index.get(&self.subject) {
            if i != 0 {
                self.updates.swap(0, i);
            }
        }
        UpdateContainerResponse {
            update: self.updates,
            evict: self.evictions,
        }
    }

    pub fn into_stop_response(self) -> StopContainerResponse {
        StopContainerResponse {
            update: self.updates,
        }
    }

    pub fn composed_adjust(&self) -> Option<ContainerAdjustment> {
        if self.adjust.is_empty() {
            None
        } else {
            Some(self.adjust.clone())
        }
    }

    pub fn composed_updates(&self) -> Vec<ContainerUpdate> {
        self.updates.clone()
    }

    fn adjust_annotations(
        &mut self,
        id: &str,
        plugin: &str,
        annotations: HashMap<String, String>,
    ) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = annotations
            .into_iter()
            .partition(|(k, _)| marked_for_removal(k).is_some());

        for (marked, _) in removals {
            let key = marked_for_removal(&marked).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Annotation, &key, plugin);
            self.adjust.annotations.remove(&key);
            self.adjust.annotations.insert(marked, String::new());
        }
        for (key, value) in additions {
            self.owners
                .claim_compound(id, CompoundField::Annotation, &key, plugin)?;
            self.adjust.annotations.insert(key, value);
        }
        Ok(())
    }

    fn adjust_mounts(&mut self, id: &str, plugin: &str, mounts: Vec<Mount>) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = mounts
            .into_iter()
            .partition(|m| marked_for_removal(&m.destination).is_some());

        for mount in removals {
            let dest = marked_for_removal(&mount.destination).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Mount, &dest, plugin);
            self.adjust.mounts.retain(|m| {
                m.destination != dest && marked_for_removal(&m.destination) != Some(dest.as_str())
            });
            self.adjust.mounts.push(mount);
        }
        for mount in additions {
            self.owners
                .claim_compound(id, CompoundField::Mount, &mount.destination, plugin)?;
            self.adjust.mounts.push(mount);
        }
        Ok(())
    }

    fn adjust_env(&mut self, id: &str, plugin: &str, env: Vec<KeyValue>) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = env
            .into_iter()
            .partition(|e| marked_for_removal(&e.key).is_some());

        for entry in removals {
            let key = marked_for_removal(&entry.key).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Env, &key, plugin);
            self.adjust
                .env
                .retain(|e| e.key != key && marked_for_removal(&e.key) != Some(key.as_str()));
            self.adjust.env.push(entry);
        }
        for entry in additions {
            self.owners
                .claim_compound(id, CompoundField::Env, &entry.key, plugin)?;
            self.adjust.env.push(entry);
        }
        Ok(())
    }

    // Hooks accumulate from all plugins in plugin order, without conflicts.
    fn adjust_hooks(&mut self, hooks: Option<Hooks>) {
        if let Some(hooks) = hooks {
            if !hooks.is_empty() {
                self.adjust
                    .hooks
                    .get_or_insert_with(Hooks::default)
                    .append(&hooks);
            }
        }
    }

    fn adjust_rlimits(&mut self, id: &str, plugin: &str, rlimits: Vec<PosixRlimit>) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = rlimits
            .into_iter()
            .partition(|r| marked_for_removal(&r.type_).is_some());

        for rlimit in removals {
            let type_ = marked_for_removal(&rlimit.type_).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Rlimit, &type_, plugin);
            self.adjust.rlimits.retain(|r| {
                r.type_ != type_ && marked_for_removal(&r.type_) != Some(type_.as_str())
            });
            self.adjust.rlimits.push(rlimit);
        }
        for rlimit in additions {
            self.owners
                .claim_compound(id, CompoundField::Rlimit, &rlimit.type_, plugin)?;
            self.adjust.rlimits.push(rlimit);
        }
        Ok(())
    }

    fn adjust_cdi_devices(
        &mut self,
        id: &str,
        plugin: &str,
        devices: Vec<CdiDevice>,
    ) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| marked_for_removal(&d.name).is_some());

        for device in removals {
            let name = marked_for_removal(&device.name).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::CdiDevice, &name, plugin);
            self.adjust
                .cdi_devices
                .retain(|d| d.name != name && marked_for_removal(&d.name) != Some(name.as_str()));
            self.adjust.cdi_devices.push(device);
        }
        for device in additions {
            self.owners
                .claim_compound(id, CompoundField::CdiDevice, &device.name, plugin)?;
            self.adjust.cdi_devices.push(device);
        }
        Ok(())
    }

    fn adjust_devices(&mut self, id: &str, plugin: &str, devices: Vec<LinuxDevice>) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|d| marked_for_removal(&d.path).is_some());

        let composed = &mut self.adjust.linux.get_or_insert_with(Default::default).devices;
        for device in removals {
            let path = marked_for_removal(&device.path).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Device, &path, plugin);
            composed.retain(|d| d.path != path && marked_for_removal(&d.path) != Some(path.as_str()));
            composed.push(device);
        }
        for device in additions {
            self.owners
                .claim_compound(id, CompoundField::Device, &device.path, plugin)?;
            self.adjust
                .linux
                .get_or_insert_with(Default::default)
                .devices
                .push(device);
        }
        Ok(())
    }

    fn adjust_namespaces(
        &mut self,
        id: &str,
        plugin: &str,
        namespaces: Vec<LinuxNamespace>,
    ) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = namespaces
            .into_iter()
            .partition(|n| marked_for_removal(&n.type_).is_some());

        for ns in removals {
            let type_ = marked_for_removal(&ns.type_).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Namespace, &type_, plugin);
            let composed = &mut self.adjust.linux.get_or_insert_with(Default::default).namespaces;
            composed.retain(|n| n.type_ != type_ && marked_for_removal(&n.type_) != Some(type_.as_str()));
            composed.push(ns);
        }
        for ns in additions {
            self.owners
                .claim_compound(id, CompoundField::Namespace, &ns.type_, plugin)?;
            self.adjust
                .linux
                .get_or_insert_with(Default::default)
                .namespaces
                .push(ns);
        }
        Ok(())
    }

    fn adjust_net_devices(
        &mut self,
        id: &str,
        plugin: &str,
        devices: HashMap<String, LinuxNetDevice>,
    ) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = devices
            .into_iter()
            .partition(|(k, _)| marked_for_removal(k).is_some());

        let composed = self.adjust.linux.get_or_insert_with(Default::default);
        for (marked, _) in removals {
            let key = marked_for_removal(&marked).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::NetDevice, &key, plugin);
            composed.net_devices.remove(&key);
            composed.net_devices.insert(marked, LinuxNetDevice::default());
        }
        for (key, device) in additions {
            self.owners
                .claim_compound(id, CompoundField::NetDevice, &key, plugin)?;
            self.adjust
                .linux
                .get_or_insert_with(Default::default)
                .net_devices
                .insert(key, device);
        }
        Ok(())
    }

    fn adjust_sysctls(
        &mut self,
        id: &str,
        plugin: &str,
        sysctls: HashMap<String, String>,
    ) -> Result<()> {
        let (removals, additions): (Vec<_>, Vec<_>) = sysctls
            .into_iter()
            .partition(|(k, _)| marked_for_removal(k).is_some());

        let composed = self.adjust.linux.get_or_insert_with(Default::default);
        for (marked, _) in removals {
            let key = marked_for_removal(&marked).unwrap().to_string();
            self.owners
                .clear_compound(id, CompoundField::Sysctl, &key, plugin);
            composed.sysctls.remove(&key);
            composed.sysctls.insert(marked, String::new());
        }
        for (key, value) in additions {
            self.owners
                .claim_compound(id, CompoundField::Sysctl, &key, plugin)?;
            self.adjust
                .linux
                .get_or_insert_with(Default::default)
                .sysctls
                .insert(key, value);
        }
        Ok(())
    }

    fn adjust_args(
        &mut self,
        id: &str,
        plugin: &str,
        args: Option<ArgumentAdjustment>,
    ) -> Result<()> {
        match args {
            None => Ok(()),
            Some(ArgumentAdjustment::Set(args)) => {
                self.owners.claim_simple(id, SimpleField::Args, plugin)?;
                self.adjust.args = Some(ArgumentAdjustment::Set(args));
                Ok(())
            }
            Some(ArgumentAdjustment::Append(args)) => {
                self.adjust.args = Some(match self.adjust.args.take() {
                    None => ArgumentAdjustment::Append(args),
                    Some(ArgumentAdjustment::Set(mut prior)) => {
                        prior.extend(args);
                        ArgumentAdjustment::Set(prior)
                    }
                    Some(ArgumentAdjustment::Append(mut prior)) => {
                        prior.extend(args);
                        ArgumentAdjustment::Append(prior)
                    }
                });
                Ok(())
            }
        }
    }
}

// Merge one plugin's resource request into a composed resource struct,
// claiming every touched sub-field in the ledger first.
fn merge_resources(
    owners: &mut OwningPlugins,
    id: &str,
    plugin: &str,
    src: LinuxResources,
    dst: &mut Option<LinuxResources>,
) -> Result<()> {
    let dst = dst.get_or_insert_with(Default::default);

    if let Some(cpu) = src.cpu {
        let composed = dst.cpu.get_or_insert_with(Default::default);
        if let Some(shares) = cpu.shares {
            owners.claim_simple(id, SimpleField::CpuShares, plugin)?;
            composed.shares = Some(shares);
        }
        if let Some(quota) = cpu.quota {
            owners.claim_simple(id, SimpleField::CpuQuota, plugin)?;
            composed.quota = Some(quota);
        }
        if let Some(period) = cpu.period {
            owners.claim_simple(id, SimpleField::CpuPeriod, plugin)?;
            composed.period = Some(period);
        }
        if let Some(runtime) = cpu.realtime_runtime {
            owners.claim_simple(id, SimpleField::CpuRealtimeRuntime, plugin)?;
            composed.realtime_runtime = Some(runtime);
        }
        if let Some(period) = cpu.realtime_period {
            owners.claim_simple(id, SimpleField::CpuRealtimePeriod, plugin)?;
            composed.realtime_period = Some(period);
        }
        if let Some(cpus) = cpu.cpus {
            owners.claim_simple(id, SimpleField::CpusetCpus, plugin)?;
            composed.cpus = Some(cpus);
        }
        if let Some(mems) = cpu.mems {
            owners.claim_simple(id, SimpleField::CpusetMems, plugin)?;
            composed.mems = Some(mems);
        }
    }

    if let Some(memory) = src.memory {
        let composed = dst.memory.get_or_insert_with(Default::default);
        if let Some(limit) = memory.limit {
            owners.claim_simple(id, SimpleField::MemoryLimit, plugin)?;
            composed.limit = Some(limit);
        }
        if let Some(reservation) = memory.reservation {
            owners.claim_simple(id, SimpleField::MemoryReservation, plugin)?;
            composed.reservation = Some(reservation);
        }
        if let Some(swap) = memory.swap {
            owners.claim_simple(id, SimpleField::MemorySwapLimit, plugin)?;
            composed.swap = Some(swap);
        }
        if let Some(kernel) = memory.kernel {
            owners.claim_simple(id, SimpleField::MemoryKernelLimit, plugin)?;
            composed.kernel = Some(kernel);
        }
        if let Some(kernel_tcp) = memory.kernel_tcp {
            owners.claim_simple(id, SimpleField::MemoryKernelTcpLimit, plugin)?;
            composed.kernel_tcp = Some(kernel_tcp);
        }
        if let Some(swappiness) = memory.swappiness {
            owners.claim_simple(id, SimpleField::MemorySwappiness, plugin)?;
            composed.swappiness = Some(swappiness);
        }
        if let Some(disable) = memory.disable_oom_killer {
            owners.claim_simple(id, SimpleField::MemoryDisableOomKiller, plugin)?;
            composed.disable_oom_killer = Some(disable);
        }
        if let Some(use_hierarchy) = memory.use_hierarchy {
            owners.claim_simple(id, SimpleField::MemoryUseHierarchy, plugin)?;
            composed.use_hierarchy = Some(use_hierarchy);
        }
    }

    for limit in src.hugepage_limits {
        owners.claim_compound(id, CompoundField::HugepageLimit, &limit.page_size, plugin)?;
        match dst
            .hugepage_limits
            .iter_mut()
            .find(|l| l.page_size == limit.page_size)
        {
            Some(slot) => *slot = limit,
            None => dst.hugepage_limits.push(limit),
        }
    }

    for (key, value) in src.unified {
        owners.claim_compound(id, CompoundField::Unified, &key, plugin)?;
        dst.unified.insert(key, value);
    }

    // Device cgroup rules append in plugin order without conflict detection.
    dst.devices.extend(src.devices);

    if let Some(class) = src.blockio_class {
        owners.claim_simple(id, SimpleField::BlockioClass, plugin)?;
        dst.blockio_class = Some(class);
    }
    if let Some(class) = src.rdt_class {
        owners.claim_simple(id, SimpleField::RdtClass, plugin)?;
        dst.rdt_class = Some(class);
    }
    if let Some(pids) = src.pids {
        owners.claim_simple(id, SimpleField::PidsLimit, plugin)?;
        dst.pids = Some(pids);
    }

    Ok(())
}
