//! In-memory stand-ins for the compositor, the stream and the GPU.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};

use drm_fourcc::{DrmFourcc, DrmModifier};

use super::buffer::{
    Backing, BufferDescriptor, BufferImporter, GpuBufferObject, GpuDevice, ManagedBuffer, Plane,
    PlaneInfo, ShmBacking, ShmFactory,
};
use super::error::CastError;
use super::negotiate::ParamsUpdate;
use super::session::{CaptureBackend, CaptureTarget};
use super::stream::{FrameMeta, PoolId, StreamBackend};

pub const XRGB8888: u32 = DrmFourcc::Xrgb8888 as u32;
pub const ARGB8888: u32 = DrmFourcc::Argb8888 as u32;

/// A modifier in the Intel vendor namespace.
pub fn vendor_modifier(n: u64) -> DrmModifier {
    DrmModifier::from(0x0100_0000_0000_0000 | n)
}

fn null_fd() -> OwnedFd {
    OwnedFd::from(File::open("/dev/null").unwrap())
}

/// A shared-memory buffer backed by `/dev/null`, for pool bookkeeping tests.
pub fn shm_buffer(desc: &BufferDescriptor, handle: u32) -> ManagedBuffer<u32> {
    let plane = Plane {
        fd: null_fd(),
        offset: 0,
        stride: desc.stride,
        size: desc.size,
    };
    ManagedBuffer::new(
        *desc,
        Backing::Shm(ShmBacking {
            plane,
            name: "test".to_string(),
        }),
        handle,
    )
}

/// Anonymous memfd objects, independent of `/dev/shm`.
pub struct MemfdShm;

impl ShmFactory for MemfdShm {
    fn create(&self) -> Result<(OwnedFd, String), CastError> {
        let name = CString::new("wlcast-test").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(CastError::ResourceExhausted("memfd_create".into()));
        }
        Ok((unsafe { OwnedFd::from_raw_fd(fd) }, "memfd:wlcast-test".into()))
    }
}

/// Compositor stand-in; buffer handles are plain integers.
#[derive(Debug, Default)]
pub struct FakeCapture {
    pub captures: usize,
    pub copies: Vec<u32>,
    pub discards: usize,
    pub imported: usize,
    pub destroyed: usize,
    pub last_planes: usize,
    pub reject_dmabuf: bool,
    next_handle: u32,
}

impl FakeCapture {
    /// A compositor that refuses every dmabuf import.
    pub fn rejecting_dmabuf() -> Self {
        Self {
            reject_dmabuf: true,
            ..Default::default()
        }
    }

    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.imported += 1;
        self.next_handle
    }
}

impl BufferImporter for FakeCapture {
    type Buffer = u32;

    fn import_shm(&mut self, _fd: BorrowedFd<'_>, _desc: &BufferDescriptor) -> Result<u32, CastError> {
        Ok(self.next())
    }

    fn import_dmabuf(
        &mut self,
        _desc: &BufferDescriptor,
        _modifier: DrmModifier,
        planes: &[PlaneInfo],
    ) -> Result<u32, CastError> {
        if self.reject_dmabuf {
            return Err(CastError::ImportFailed("rejected by compositor".into()));
        }
        self.last_planes = planes.len();
        Ok(self.next())
    }

    fn destroy_buffer(&mut self, _buffer: u32) {
        self.destroyed += 1;
    }
}

impl CaptureBackend for FakeCapture {
    fn capture_output(&mut self, _target: &CaptureTarget) -> Result<(), CastError> {
        self.captures += 1;
        Ok(())
    }

    fn copy(&mut self, buffer: &u32) -> Result<(), CastError> {
        self.copies.push(*buffer);
        Ok(())
    }

    fn discard_frame(&mut self) {
        self.discards += 1;
    }
}

/// Stream stand-in with a fixed set of pool slots.
#[derive(Debug, Default)]
pub struct FakeStream {
    free: VecDeque<PoolId>,
    damage_capacity: usize,
    pub queued: Vec<(PoolId, FrameMeta)>,
    pub updates: Vec<ParamsUpdate>,
}

impl FakeStream {
    pub fn with_slots(ids: &[u64], damage_capacity: usize) -> Self {
        Self {
            free: ids.iter().map(|&id| PoolId(id)).collect(),
            damage_capacity,
            ..Default::default()
        }
    }

    /// The consumer gives a slot back.
    pub fn release(&mut self, id: PoolId) {
        if !self.free.contains(&id) {
            self.free.push_back(id);
        }
    }

    pub fn release_all(&mut self) {
        let ids: Vec<PoolId> = self.queued.iter().map(|(id, _)| *id).collect();
        for id in ids {
            self.release(id);
        }
    }
}

impl StreamBackend for FakeStream {
    fn update_params(&mut self, update: &ParamsUpdate) -> Result<(), CastError> {
        self.updates.push(update.clone());
        Ok(())
    }

    fn dequeue(&mut self) -> Option<PoolId> {
        self.free.pop_front()
    }

    fn damage_capacity(&self, _id: PoolId) -> usize {
        self.damage_capacity
    }

    fn queue(&mut self, id: PoolId, meta: &FrameMeta) -> Result<(), CastError> {
        self.queued.push((id, meta.clone()));
        Ok(())
    }
}

struct FakeBo {
    modifier: DrmModifier,
    planes: u32,
    stride: u32,
}

impl GpuBufferObject for FakeBo {
    fn modifier(&self) -> DrmModifier {
        self.modifier
    }

    fn plane_count(&self) -> u32 {
        self.planes
    }

    fn stride_for_plane(&self, _plane: u32) -> u32 {
        self.stride
    }

    fn offset(&self, plane: u32) -> u32 {
        plane * 4096
    }

    fn fd_for_plane(&self, _plane: u32) -> Result<OwnedFd, CastError> {
        Ok(null_fd())
    }
}

/// GPU stand-in realizing a fixed set of explicit modifiers.
pub struct FakeGpu {
    supported: Vec<DrmModifier>,
    planes: u32,
    implicit: bool,
    fail: Cell<bool>,
    attempts: Cell<usize>,
    linear: Cell<usize>,
}

impl FakeGpu {
    pub fn new(supported: Vec<DrmModifier>, planes: u32) -> Self {
        Self {
            supported,
            planes,
            implicit: false,
            fail: Cell::new(false),
            attempts: Cell::new(0),
            linear: Cell::new(0),
        }
    }

    /// Whether allocations without explicit modifiers succeed.
    pub fn with_implicit(mut self, implicit: bool) -> Self {
        self.implicit = implicit;
        self
    }

    pub fn fail_everything(&self) {
        self.fail.set(true);
    }

    pub fn allocation_attempts(&self) -> usize {
        self.attempts.get()
    }

    pub fn linear_requests(&self) -> usize {
        self.linear.get()
    }
}

impl GpuDevice for FakeGpu {
    fn create_with_modifiers(
        &self,
        desc: &BufferDescriptor,
        modifiers: &[DrmModifier],
    ) -> Result<Box<dyn GpuBufferObject>, CastError> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail.get() {
            return Err(CastError::AllocationFailed("device lost".into()));
        }
        let modifier = modifiers
            .iter()
            .copied()
            .find(|m| self.supported.contains(m))
            .ok_or_else(|| CastError::AllocationFailed("no supported modifier".into()))?;
        Ok(Box::new(FakeBo {
            modifier,
            planes: self.planes,
            stride: desc.width * 4,
        }))
    }

    fn create(
        &self,
        desc: &BufferDescriptor,
        linear: bool,
    ) -> Result<Box<dyn GpuBufferObject>, CastError> {
        self.attempts.set(self.attempts.get() + 1);
        if linear {
            self.linear.set(self.linear.get() + 1);
        }
        if self.fail.get() || !self.implicit {
            return Err(CastError::AllocationFailed("implicit allocation refused".into()));
        }
        Ok(Box::new(FakeBo {
            modifier: if linear {
                DrmModifier::Linear
            } else {
                DrmModifier::Invalid
            },
            planes: 1,
            stride: desc.width * 4,
        }))
    }

    fn modifier_plane_count(&self, _format: u32, modifier: DrmModifier) -> Option<u32> {
        self.supported.contains(&modifier).then_some(self.planes)
    }
}
