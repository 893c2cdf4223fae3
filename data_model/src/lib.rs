pub mod test_objects;

use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, FromRepr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(u32);

impl ContainerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a container slot.
///
/// `New -> Allocated -> Active -> Killed`, with `Killed` reachable from any
/// state. The discriminant is the ordinal persisted in the container journal
/// and must never be reordered.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    EnumIter,
    FromRepr,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    #[default]
    New = 0,
    Allocated = 1,
    Active = 2,
    Killed = 3,
}

impl ContainerState {
    pub fn ordinal(&self) -> i32 {
        *self as u8 as i32
    }

    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        u8::try_from(ordinal).ok().and_then(Self::from_repr)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Killed)
    }
}

impl Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Container state as a single atomically visible value.
///
/// Shared with monitoring threads through [`Container::state_handle`], so a
/// reader never observes a state composed from multiple fields.
#[derive(Debug, Default)]
pub struct ContainerStateCell(AtomicU8);

impl ContainerStateCell {
    pub fn new(state: ContainerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ContainerState {
        // Only valid discriminants are ever stored.
        ContainerState::from_repr(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn store(&self, state: ContainerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl PartialEq for ContainerStateCell {
    fn eq(&self, other: &Self) -> bool {
        self.load() == other.load()
    }
}

impl Eq for ContainerStateCell {}

/// Unresolved host/port of the buffer server running next to a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BufferServerAddress {
    pub host: String,
    pub port: u16,
}

impl BufferServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for BufferServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorRef {
    pub id: u32,
    pub name: String,
}

impl OperatorRef {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl Display for OperatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceRequirements {
    pub memory_mb: i32,
    pub vcores: i32,
}

/// Grant notification from the cluster resource manager.
///
/// The resource manager only echoes back the priority of the request it
/// satisfied, so `priority` is the key used to find the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct Allocation {
    pub priority: i32,
    pub external_id: String,
    pub host: String,
    pub node_http_address: Option<String>,
    pub memory_mb: i32,
    pub vcores: i32,
    pub buffer_server: Option<BufferServerAddress>,
}

impl AllocationBuilder {
    pub fn build(&mut self) -> Result<Allocation> {
        let priority = self
            .priority
            .ok_or_else(|| anyhow!("priority is required"))?;
        let external_id = self
            .external_id
            .clone()
            .ok_or_else(|| anyhow!("external_id is required"))?;
        if external_id.is_empty() {
            return Err(anyhow!("external_id must not be empty"));
        }
        let host = self.host.clone().ok_or_else(|| anyhow!("host is required"))?;
        Ok(Allocation {
            priority,
            external_id,
            host,
            node_http_address: self.node_http_address.clone().flatten(),
            memory_mb: self.memory_mb.unwrap_or_default(),
            vcores: self.vcores.unwrap_or_default(),
            buffer_server: self.buffer_server.clone().flatten(),
        })
    }
}

/// Physical handle for one execution container requested from the cluster.
///
/// The id is assigned once by the plan's sequence and never changes.
/// Allocation-dependent fields are only written once the container reaches
/// [`ContainerState::Allocated`].
#[derive(Debug, PartialEq, Eq)]
pub struct Container {
    id: ContainerId,
    state: Arc<ContainerStateCell>,
    pub external_id: Option<String>,
    pub resource_request_priority: i32,
    pub required_memory_mb: i32,
    pub allocated_memory_mb: i32,
    pub required_vcores: i32,
    pub allocated_vcores: i32,
    pub host: Option<String>,
    pub node_http_address: Option<String>,
    pub buffer_server_address: Option<BufferServerAddress>,
    operators: Vec<OperatorRef>,
    pub started_time: Option<u64>,
    pub finished_time: Option<u64>,
    pub restart_attempts: u32,
}

impl Container {
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            state: Arc::new(ContainerStateCell::new(ContainerState::New)),
            external_id: None,
            resource_request_priority: 0,
            required_memory_mb: 0,
            allocated_memory_mb: 0,
            required_vcores: 0,
            allocated_vcores: 0,
            host: None,
            node_http_address: None,
            buffer_server_address: None,
            operators: Vec::new(),
            started_time: None,
            finished_time: None,
            restart_attempts: 0,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn state(&self) -> ContainerState {
        self.state.load()
    }

    /// Overwrites the state. Sequencing is the caller's responsibility.
    pub fn set_state(&self, state: ContainerState) {
        self.state.store(state);
    }

    pub fn state_handle(&self) -> Arc<ContainerStateCell> {
        self.state.clone()
    }

    pub fn requirements(&self) -> ResourceRequirements {
        ResourceRequirements {
            memory_mb: self.required_memory_mb,
            vcores: self.required_vcores,
        }
    }

    pub fn operators(&self) -> &[OperatorRef] {
        &self.operators
    }

    pub fn add_operator(&mut self, operator: OperatorRef) {
        self.operators.push(operator);
    }

    /// Records the resource manager grant and moves the container to
    /// `Allocated`.
    pub fn allocate(&mut self, allocation: &Allocation) {
        self.external_id = Some(allocation.external_id.clone());
        self.host = Some(allocation.host.clone());
        self.node_http_address = allocation.node_http_address.clone();
        self.allocated_memory_mb = allocation.memory_mb;
        self.allocated_vcores = allocation.vcores;
        self.buffer_server_address = allocation.buffer_server.clone();
        self.set_state(ContainerState::Allocated);
    }

    pub fn to_id_state_string(&self) -> String {
        format!(
            "Container[id={}({}),state={}]",
            self.id,
            self.external_id.as_deref().unwrap_or("null"),
            self.state()
        )
    }
}

impl Clone for Container {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            // A clone gets its own state cell; sharing it would couple the two.
            state: Arc::new(ContainerStateCell::new(self.state())),
            external_id: self.external_id.clone(),
            resource_request_priority: self.resource_request_priority,
            required_memory_mb: self.required_memory_mb,
            allocated_memory_mb: self.allocated_memory_mb,
            required_vcores: self.required_vcores,
            allocated_vcores: self.allocated_vcores,
            host: self.host.clone(),
            node_http_address: self.node_http_address.clone(),
            buffer_server_address: self.buffer_server_address.clone(),
            operators: self.operators.clone(),
            started_time: self.started_time,
            finished_time: self.finished_time,
            restart_attempts: self.restart_attempts,
        }
    }
}

impl Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operators: Vec<String> = self.operators.iter().map(|op| op.to_string()).collect();
        write!(
            f,
            "Container[id={}({}),state={},operators=[{}]]",
            self.id,
            self.external_id.as_deref().unwrap_or("null"),
            self.state(),
            operators.join(",")
        )
    }
}
