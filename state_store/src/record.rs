//! Wire codec for container state records.
//!
//! Field order is fixed and shared with every historical journal:
//!
//! ```text
//! container_id:i32 state:i32 external_id:str? priority:i32
//! required_memory_mb:i32 allocated_memory_mb:i32
//! required_vcores:i32 allocated_vcores:i32
//! buffer_server_host:str? [buffer_server_port:i32 if host present]
//! host:str? node_http_address:str?
//! ```
//!
//! Integers are big-endian. A `str?` is a presence marker byte followed, when
//! present, by a big-endian u32 byte length and UTF-8 bytes. An absent value is
//! distinct from a present empty string.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use data_model::{BufferServerAddress, Container, ContainerId, ContainerState};
use serde::Serialize;

use crate::JournalError;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

/// Snapshot of the journaled fields of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStateRecord {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub external_id: Option<String>,
    pub resource_request_priority: i32,
    pub required_memory_mb: i32,
    pub allocated_memory_mb: i32,
    pub required_vcores: i32,
    pub allocated_vcores: i32,
    pub buffer_server_address: Option<BufferServerAddress>,
    pub host: Option<String>,
    pub node_http_address: Option<String>,
}

impl From<&Container> for ContainerStateRecord {
    fn from(container: &Container) -> Self {
        Self {
            container_id: container.id(),
            state: container.state(),
            external_id: container.external_id.clone(),
            resource_request_priority: container.resource_request_priority,
            required_memory_mb: container.required_memory_mb,
            allocated_memory_mb: container.allocated_memory_mb,
            required_vcores: container.required_vcores,
            allocated_vcores: container.allocated_vcores,
            buffer_server_address: container.buffer_server_address.clone(),
            host: container.host.clone(),
            node_http_address: container.node_http_address.clone(),
        }
    }
}

impl ContainerStateRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32(self.container_id.get() as i32);
        buf.put_i32(self.state.ordinal());
        put_string(&mut buf, self.external_id.as_deref());
        buf.put_i32(self.resource_request_priority);
        buf.put_i32(self.required_memory_mb);
        buf.put_i32(self.allocated_memory_mb);
        buf.put_i32(self.required_vcores);
        buf.put_i32(self.allocated_vcores);
        match &self.buffer_server_address {
            Some(address) => {
                put_string(&mut buf, Some(&address.host));
                buf.put_i32(address.port as i32);
            }
            None => put_string(&mut buf, None),
        }
        put_string(&mut buf, self.host.as_deref());
        put_string(&mut buf, self.node_http_address.as_deref());
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, JournalError> {
        let buf = &mut bytes;
        let raw_id = get_i32(buf, "container_id")?;
        let container_id = u32::try_from(raw_id)
            .map(ContainerId::new)
            .map_err(|_| JournalError::InvalidContainerId(raw_id))?;
        let raw_state = get_i32(buf, "state")?;
        let state =
            ContainerState::from_ordinal(raw_state).ok_or(JournalError::UnknownState(raw_state))?;
        let external_id = get_string(buf, "external_id")?;
        let resource_request_priority = get_i32(buf, "resource_request_priority")?;
        let required_memory_mb = get_i32(buf, "required_memory_mb")?;
        let allocated_memory_mb = get_i32(buf, "allocated_memory_mb")?;
        let required_vcores = get_i32(buf, "required_vcores")?;
        let allocated_vcores = get_i32(buf, "allocated_vcores")?;
        let buffer_server_address = match get_string(buf, "buffer_server_host")? {
            Some(host) => {
                let raw_port = get_i32(buf, "buffer_server_port")?;
                let port =
                    u16::try_from(raw_port).map_err(|_| JournalError::InvalidPort(raw_port))?;
                Some(BufferServerAddress { host, port })
            }
            None => None,
        };
        let host = get_string(buf, "host")?;
        let node_http_address = get_string(buf, "node_http_address")?;
        if buf.has_remaining() {
            return Err(JournalError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            container_id,
            state,
            external_id,
            resource_request_priority,
            required_memory_mb,
            allocated_memory_mb,
            required_vcores,
            allocated_vcores,
            buffer_server_address,
            host,
            node_http_address,
        })
    }

    /// Restores the journaled fields into `container`.
    ///
    /// Returns false without touching the container when the ids differ. An
    /// absent buffer server address leaves the container's address as is.
    pub fn apply(&self, container: &mut Container) -> bool {
        if container.id() != self.container_id {
            return false;
        }
        container.set_state(self.state);
        container.external_id = self.external_id.clone();
        container.resource_request_priority = self.resource_request_priority;
        container.required_memory_mb = self.required_memory_mb;
        container.allocated_memory_mb = self.allocated_memory_mb;
        container.required_vcores = self.required_vcores;
        container.allocated_vcores = self.allocated_vcores;
        if let Some(address) = &self.buffer_server_address {
            container.buffer_server_address = Some(address.clone());
        }
        container.host = self.host.clone();
        container.node_http_address = self.node_http_address.clone();
        true
    }
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(PRESENT);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        None => buf.put_u8(ABSENT),
    }
}

fn ensure_remaining(buf: &&[u8], needed: usize, field: &'static str) -> Result<(), JournalError> {
    if buf.remaining() < needed {
        return Err(JournalError::Truncated {
            field,
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn get_i32(buf: &mut &[u8], field: &'static str) -> Result<i32, JournalError> {
    ensure_remaining(buf, 4, field)?;
    Ok(buf.get_i32())
}

fn get_string(buf: &mut &[u8], field: &'static str) -> Result<Option<String>, JournalError> {
    ensure_remaining(buf, 1, field)?;
    match buf.get_u8() {
        ABSENT => Ok(None),
        PRESENT => {
            ensure_remaining(buf, 4, field)?;
            let len = buf.get_u32() as usize;
            ensure_remaining(buf, len, field)?;
            let value = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| JournalError::InvalidUtf8 { field })?;
            buf.advance(len);
            Ok(Some(value))
        }
        marker => Err(JournalError::InvalidMarker { marker, field }),
    }
}
