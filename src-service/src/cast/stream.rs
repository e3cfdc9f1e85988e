//! Stream side of a screencast: the buffer pool and per-frame metadata.
//!
//! The transport owns the pool slots; we own the memory behind them. Slots are
//! addressed by [`PoolId`] and the backing [`ManagedBuffer`]s live in an arena
//! keyed by that id.

use std::collections::HashMap;

use super::buffer::{BufferType, ManagedBuffer, PlaneInfo};
use super::damage::{fit_to_capacity, Rect};
use super::error::CastError;
use super::negotiate::{DataType, ParamsUpdate};
use super::session::PendingFrame;

/// Opaque id of a transport pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u64);

/// Some consumers treat a zero chunk size as an empty buffer.
pub const DMABUF_PLACEHOLDER_CHUNK_SIZE: u32 = 9;

/// Transport connection state as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error(String),
}

/// Metadata written into a pool slot before it is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
    /// Presentation time in nanoseconds
    pub pts_ns: i64,
    pub corrupted: bool,
    pub seq: u64,
    /// `wl_output` transform of the captured output
    pub transform: u32,
    /// At most the slot's damage capacity
    pub damage: Vec<Rect>,
}

/// What the transport needs to describe one pool slot's memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBufferSetup {
    pub data_type: DataType,
    pub planes: Vec<PlaneInfo>,
    /// Chunk size per plane
    pub chunk_sizes: Vec<u32>,
}

/// Streaming transport operations used by the session.
pub trait StreamBackend {
    fn update_params(&mut self, update: &ParamsUpdate) -> Result<(), CastError>;
    /// Take a free slot; `None` when the consumer holds them all.
    fn dequeue(&mut self) -> Option<PoolId>;
    /// Damage metadata slots available in a pool slot.
    fn damage_capacity(&self, id: PoolId) -> usize;
    fn queue(&mut self, id: PoolId, meta: &FrameMeta) -> Result<(), CastError>;
}

pub struct StreamEndpoint<S, H> {
    backend: S,
    pool: HashMap<PoolId, ManagedBuffer<H>>,
    seq: u64,
    state: StreamState,
    node_id: Option<u32>,
}

impl<S: StreamBackend, H> StreamEndpoint<S, H> {
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            pool: HashMap::new(),
            seq: 0,
            state: StreamState::Unconnected,
            node_id: None,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.backend
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Record a state change; returns the previous state.
    pub fn set_state(&mut self, state: StreamState) -> StreamState {
        std::mem::replace(&mut self.state, state)
    }

    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }

    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    pub fn set_node_id(&mut self, node_id: u32) {
        self.node_id = Some(node_id);
    }

    /// Next sequence number to be written.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn publish(&mut self, update: &ParamsUpdate) -> Result<(), CastError> {
        match update {
            ParamsUpdate::Formats(formats) => {
                tracing::debug!("publishing {} format(s)", formats.len())
            }
            ParamsUpdate::Buffers(req) => tracing::debug!(
                "publishing {} buffer requirements, {} block(s)",
                req.buffer_type.as_str(),
                req.blocks
            ),
        }
        self.backend.update_params(update)
    }

    pub fn insert_buffer(&mut self, id: PoolId, buffer: ManagedBuffer<H>) {
        if self.pool.insert(id, buffer).is_some() {
            tracing::warn!("pool slot {:?} replaced without removal", id);
        }
    }

    pub fn remove_buffer(&mut self, id: PoolId) -> Option<ManagedBuffer<H>> {
        self.pool.remove(&id)
    }

    pub fn buffer(&self, id: PoolId) -> Option<&ManagedBuffer<H>> {
        self.pool.get(&id)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Remove every buffer, for teardown.
    pub fn drain_buffers(&mut self) -> Vec<ManagedBuffer<H>> {
        self.pool.drain().map(|(_, b)| b).collect()
    }

    /// Memory description of a slot for the transport.
    pub fn buffer_setup(&self, id: PoolId) -> Option<PoolBufferSetup> {
        let buffer = self.pool.get(&id)?;
        let planes = buffer.planes();
        let (data_type, chunk_sizes) = match buffer.buffer_type() {
            BufferType::Shm => (DataType::MemFd, planes.iter().map(|p| p.size).collect()),
            BufferType::Dmabuf => (
                DataType::DmaBuf,
                planes
                    .iter()
                    .map(|p| {
                        if p.size == 0 {
                            DMABUF_PLACEHOLDER_CHUNK_SIZE
                        } else {
                            p.size
                        }
                    })
                    .collect(),
            ),
        };
        Some(PoolBufferSetup {
            data_type,
            planes,
            chunk_sizes,
        })
    }

    pub fn dequeue(&mut self) -> Option<PoolId> {
        let id = self.backend.dequeue()?;
        if !self.pool.contains_key(&id) {
            tracing::warn!("dequeued slot {:?} has no buffer attached", id);
        }
        Some(id)
    }

    /// Hand a finished frame to the consumer.
    ///
    /// Returns `false` when the frame had no slot and was dropped.
    pub fn enqueue(&mut self, frame: PendingFrame) -> Result<bool, CastError> {
        let Some(id) = frame.buffer else {
            tracing::warn!("no stream buffer for finished frame, dropping it");
            return Ok(false);
        };

        let capacity = self.backend.damage_capacity(id);
        let meta = FrameMeta {
            pts_ns: frame.pts_ns(),
            corrupted: frame.is_corrupted(),
            seq: self.seq,
            transform: frame.transform,
            damage: fit_to_capacity(frame.damage.rects(), capacity),
        };
        if meta.corrupted {
            tracing::debug!("queueing corrupted frame {}", meta.seq);
        } else {
            tracing::trace!("queueing frame {} with {} damage rect(s)", meta.seq, meta.damage.len());
        }

        self.backend.queue(id, &meta)?;
        self.seq += 1;
        Ok(true)
    }
}
