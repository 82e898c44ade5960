//! Routing table from role names to worker instances.
//!
//! Built once while the pipeline starts and read-only afterwards. Every
//! cluster member builds the same instance list for a role (members sorted,
//! then instances per member), so a selector index means the same worker in
//! every process.
//!
//! Records owned by another member are first merged into a per-instance
//! stage and leave the process on [`Registry::forward_staged`], so a hot
//! identity crosses the network once per forward tick.

use super::remote::RemoteSender;
use super::role::Role;
use crate::core::{Result, StrataError};
use crate::metrics::{Metric, RemoteMessage};
use crate::stream::{DataCache, PersistenceWorker, WorkerHandle};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// One worker instance of a role.
#[derive(Debug, Clone)]
pub enum WorkerRef {
    /// Lives in this process.
    Local(WorkerHandle),
    /// Lives on another cluster member.
    Remote { address: SocketAddr, instance: u32 },
}

struct RoleEntry {
    role: Role,
    instances: Vec<WorkerRef>,
    /// Pre-merge buffer per instance, present for remote ones only.
    stages: Vec<Option<DataCache>>,
}

/// Role name to worker instances.
pub struct Registry {
    roles: FxHashMap<Arc<str>, RoleEntry>,
    sender: Option<Arc<dyn RemoteSender>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name).map(|entry| &entry.role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values().map(|entry| &entry.role)
    }

    /// Instance of `role` owning `key`, with its index.
    pub fn resolve(&self, role: &str, key: Option<&str>) -> Result<(usize, &WorkerRef)> {
        let entry = self
            .roles
            .get(role)
            .ok_or_else(|| StrataError::UnknownRole(role.to_string()))?;
        let index = entry
            .role
            .selector()
            .select_index(entry.instances.len(), key)
            .ok_or_else(|| StrataError::NoInstance {
                role: role.to_string(),
                index: 0,
            })?;
        Ok((index, &entry.instances[index]))
    }

    /// Route `metric` to the instance of `role` owning its id.
    ///
    /// Records for a remote instance are merged into its stage and sent by
    /// the next [`Registry::forward_staged`].
    pub async fn dispatch(&self, role: &str, metric: Metric) -> Result<()> {
        let entry = self
            .roles
            .get(role)
            .ok_or_else(|| StrataError::UnknownRole(role.to_string()))?;
        let (index, target) = self.resolve(role, Some(metric.id()))?;
        match target {
            WorkerRef::Local(handle) => handle.submit(metric).await,
            WorkerRef::Remote { address, .. } => {
                if self.sender.is_none() {
                    return Err(StrataError::remote(format!(
                        "no remote sender for {} at {}",
                        role, address
                    )));
                }
                match entry.stages.get(index).and_then(Option::as_ref) {
                    Some(stage) => stage.accept(metric),
                    None => Err(StrataError::NoInstance {
                        role: role.to_string(),
                        index,
                    }),
                }
            },
        }
    }

    /// Records waiting in remote stages.
    pub fn staged(&self) -> usize {
        self.roles
            .values()
            .flat_map(|entry| entry.stages.iter().flatten())
            .map(DataCache::current_size)
            .sum()
    }

    /// Drain every remote stage and hand the merged records to the sender.
    ///
    /// Returns how many records were accepted by the sender. Records the
    /// sender rejects are dropped with a warning.
    pub async fn forward_staged(&self) -> usize {
        let Some(sender) = self.sender.as_ref() else {
            return 0;
        };
        let mut forwarded = 0;
        for (name, entry) in &self.roles {
            for (target, stage) in entry.instances.iter().zip(&entry.stages) {
                let (WorkerRef::Remote { address, instance }, Some(stage)) = (target, stage) else {
                    continue;
                };
                let Some(drained) = stage.switch_and_drain() else {
                    continue;
                };
                for metric in drained {
                    let record = match metric.define().serialize(&metric) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(role = %name, id = metric.id(), "Failed to serialize staged record: {}", e);
                            continue;
                        },
                    };
                    let message = RemoteMessage {
                        role: name.to_string(),
                        instance: *instance,
                        record: Some(record),
                    };
                    match sender.send(*address, message).await {
                        Ok(()) => forwarded += 1,
                        Err(e) => warn!(
                            role = %name,
                            peer = %address,
                            category = e.category(),
                            "Dropping staged record: {}",
                            e
                        ),
                    }
                }
            }
        }
        forwarded
    }

    /// Local worker at `index` of `role`. Used by the remote server.
    pub fn local_instance(&self, role: &str, index: usize) -> Result<&WorkerHandle> {
        let entry = self
            .roles
            .get(role)
            .ok_or_else(|| StrataError::UnknownRole(role.to_string()))?;
        match entry.instances.get(index) {
            Some(WorkerRef::Local(handle)) => Ok(handle),
            _ => Err(StrataError::NoInstance {
                role: role.to_string(),
                index,
            }),
        }
    }

    /// Every worker living in this process.
    pub fn local_workers(&self) -> Vec<Arc<PersistenceWorker>> {
        self.roles
            .values()
            .flat_map(|entry| entry.instances.iter())
            .filter_map(|instance| match instance {
                WorkerRef::Local(handle) => Some(Arc::clone(handle.worker())),
                WorkerRef::Remote { .. } => None,
            })
            .collect()
    }
}

/// Collects roles before freezing them into a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    roles: FxHashMap<Arc<str>, RoleEntry>,
    sender: Option<Arc<dyn RemoteSender>>,
}

impl RegistryBuilder {
    /// Register `role` with its instances in routing order.
    pub fn role(mut self, role: Role, instances: Vec<WorkerRef>) -> Result<Self> {
        if instances.is_empty() {
            return Err(StrataError::config(format!("role {} has no instances", role)));
        }
        let name: Arc<str> = Arc::from(role.name());
        if self.roles.contains_key(&name) {
            return Err(StrataError::config(format!("role {} registered twice", role)));
        }
        let stages = instances
            .iter()
            .map(|instance| match instance {
                WorkerRef::Local(_) => None,
                WorkerRef::Remote { .. } => Some(DataCache::default()),
            })
            .collect();
        self.roles.insert(
            name,
            RoleEntry {
                role,
                instances,
                stages,
            },
        );
        Ok(self)
    }

    pub fn remote_sender(mut self, sender: Arc<dyn RemoteSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            roles: self.roles,
            sender: self.sender,
        }
    }
}
