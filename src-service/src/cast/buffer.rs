//! Allocation of frame buffers shared between the compositor and the stream.
//!
//! A buffer is either a POSIX shared-memory object or a GPU buffer object
//! exported as dmabuf planes. Every plane owns its file descriptor, so dropping
//! a [`ManagedBuffer`] closes each descriptor exactly once and releases the
//! GPU object. The compositor-side handle has to be destroyed through
//! [`ManagedBuffer::release`].

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use drm_fourcc::DrmModifier;

use super::error::CastError;

/// How a buffer's memory is shared with the compositor and the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferType {
    Shm,
    Dmabuf,
}

impl BufferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferType::Shm => "shm",
            BufferType::Dmabuf => "dmabuf",
        }
    }
}

/// Buffer constraints reported by the compositor for one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    /// DRM fourcc code
    pub format: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row; zero when the compositor does not dictate it
    pub stride: u32,
    /// Total bytes; zero when the compositor does not dictate it
    pub size: u32,
}

impl BufferDescriptor {
    pub fn shm(format: u32, width: u32, height: u32, stride: u32) -> Self {
        Self {
            format,
            width,
            height,
            stride,
            size: stride.saturating_mul(height),
        }
    }

    pub fn dmabuf(format: u32, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            stride: 0,
            size: 0,
        }
    }

    /// Whether the compositor has reported this transport at all.
    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Whether a buffer built from `self` can still receive a frame described by `other`.
    pub fn is_compatible_with(&self, other: &BufferDescriptor) -> bool {
        self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && (other.stride == 0 || self.stride == other.stride)
    }
}

/// One memory plane of a buffer.
#[derive(Debug)]
pub struct Plane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

impl Plane {
    pub fn info(&self) -> PlaneInfo {
        PlaneInfo {
            fd: self.fd.as_raw_fd(),
            offset: self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Borrowed view of a plane handed to importers and the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

/// A GPU buffer object created by a [`GpuDevice`].
pub trait GpuBufferObject {
    fn modifier(&self) -> DrmModifier;
    fn plane_count(&self) -> u32;
    fn stride_for_plane(&self, plane: u32) -> u32;
    fn offset(&self, plane: u32) -> u32;
    /// Export a new descriptor for a plane.
    fn fd_for_plane(&self, plane: u32) -> Result<OwnedFd, CastError>;
}

/// GPU allocation device.
pub trait GpuDevice {
    /// Allocate with any of the given explicit modifiers.
    fn create_with_modifiers(
        &self,
        desc: &BufferDescriptor,
        modifiers: &[DrmModifier],
    ) -> Result<Box<dyn GpuBufferObject>, CastError>;

    /// Allocate with the driver's implicit layout, or a linear one.
    fn create(
        &self,
        desc: &BufferDescriptor,
        linear: bool,
    ) -> Result<Box<dyn GpuBufferObject>, CastError>;

    /// Number of memory planes for a format/modifier pair, if the device supports it.
    fn modifier_plane_count(&self, format: u32, modifier: DrmModifier) -> Option<u32>;
}

/// Turns allocated memory into compositor-side buffer handles.
pub trait BufferImporter {
    type Buffer;

    fn import_shm(
        &mut self,
        fd: BorrowedFd<'_>,
        desc: &BufferDescriptor,
    ) -> Result<Self::Buffer, CastError>;

    fn import_dmabuf(
        &mut self,
        desc: &BufferDescriptor,
        modifier: DrmModifier,
        planes: &[PlaneInfo],
    ) -> Result<Self::Buffer, CastError>;

    fn destroy_buffer(&mut self, buffer: Self::Buffer);
}

/// Shared-memory backing.
#[derive(Debug)]
pub struct ShmBacking {
    pub plane: Plane,
    pub name: String,
}

/// GPU backing. The buffer object is dropped after its exported planes.
pub struct GpuBacking {
    pub planes: Vec<Plane>,
    pub modifier: DrmModifier,
    pub bo: Box<dyn GpuBufferObject>,
}

impl std::fmt::Debug for GpuBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBacking")
            .field("planes", &self.planes)
            .field("modifier", &self.modifier)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Backing {
    Shm(ShmBacking),
    Gpu(GpuBacking),
}

/// An allocated buffer together with its compositor-side handle.
#[derive(Debug)]
pub struct ManagedBuffer<H> {
    desc: BufferDescriptor,
    backing: Backing,
    handle: Option<H>,
}

impl<H> ManagedBuffer<H> {
    pub fn new(desc: BufferDescriptor, backing: Backing, handle: H) -> Self {
        Self {
            desc,
            backing,
            handle: Some(handle),
        }
    }

    pub fn buffer_type(&self) -> BufferType {
        match self.backing {
            Backing::Shm(_) => BufferType::Shm,
            Backing::Gpu(_) => BufferType::Dmabuf,
        }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn modifier(&self) -> DrmModifier {
        match &self.backing {
            Backing::Shm(_) => DrmModifier::Invalid,
            Backing::Gpu(gpu) => gpu.modifier,
        }
    }

    pub fn planes(&self) -> Vec<PlaneInfo> {
        match &self.backing {
            Backing::Shm(shm) => vec![shm.plane.info()],
            Backing::Gpu(gpu) => gpu.planes.iter().map(Plane::info).collect(),
        }
    }

    /// Destroy the compositor handle, then drop the memory.
    pub fn release<I>(mut self, importer: &mut I)
    where
        I: BufferImporter<Buffer = H>,
    {
        if let Some(handle) = self.handle.take() {
            importer.destroy_buffer(handle);
        }
    }
}

/// Source of anonymous shared-memory objects.
pub trait ShmFactory {
    /// Create an unlinked object; returns its descriptor and the name it was created under.
    fn create(&self) -> Result<(OwnedFd, String), CastError>;
}

/// Creation attempts before giving up on name collisions.
const SHM_CREATE_RETRIES: u32 = 100;

/// POSIX `shm_open` objects with random names, unlinked right after creation.
#[derive(Debug, Clone)]
pub struct PosixShm {
    prefix: String,
}

impl PosixShm {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_start_matches('/').replace('/', "-"),
        }
    }

    fn random_name(&self) -> String {
        format!("/{}-{:08x}", self.prefix, rand::random::<u32>())
    }
}

impl ShmFactory for PosixShm {
    fn create(&self) -> Result<(OwnedFd, String), CastError> {
        for _ in 0..SHM_CREATE_RETRIES {
            let name = self.random_name();
            let cname = CString::new(name.clone())
                .map_err(|e| CastError::InvalidParameters(format!("shm name: {}", e)))?;

            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
                )
            };
            if fd >= 0 {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                return Ok((fd, name));
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(CastError::ResourceExhausted(format!("shm_open: {}", err)));
            }
        }

        Err(CastError::ResourceExhausted(format!(
            "no free shm name after {} attempts",
            SHM_CREATE_RETRIES
        )))
    }
}

/// Allocation policy shared by all buffers of a session.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorOptions {
    /// Implicit-modifier GPU buffers use a linear layout
    pub force_linear: bool,
    /// Largest shared-memory allocation in bytes
    pub max_shm_bytes: u64,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            force_linear: false,
            max_shm_bytes: 256 * 1024 * 1024,
        }
    }
}

pub struct BufferAllocator {
    shm: Box<dyn ShmFactory>,
    gpu: Option<Rc<dyn GpuDevice>>,
    options: AllocatorOptions,
}

impl BufferAllocator {
    pub fn new(
        shm: Box<dyn ShmFactory>,
        gpu: Option<Rc<dyn GpuDevice>>,
        options: AllocatorOptions,
    ) -> Self {
        Self { shm, gpu, options }
    }

    pub fn gpu(&self) -> Option<&Rc<dyn GpuDevice>> {
        self.gpu.as_ref()
    }

    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    /// Allocate a buffer and import it into the compositor.
    pub fn allocate<I: BufferImporter>(
        &self,
        importer: &mut I,
        buffer_type: BufferType,
        desc: &BufferDescriptor,
        modifier: DrmModifier,
    ) -> Result<ManagedBuffer<I::Buffer>, CastError> {
        match buffer_type {
            BufferType::Shm => self.allocate_shm(importer, desc),
            BufferType::Dmabuf => self.allocate_gpu(importer, desc, modifier),
        }
    }

    fn allocate_shm<I: BufferImporter>(
        &self,
        importer: &mut I,
        desc: &BufferDescriptor,
    ) -> Result<ManagedBuffer<I::Buffer>, CastError> {
        let size = desc.stride as u64 * desc.height as u64;
        if size == 0 {
            return Err(CastError::InvalidParameters(format!(
                "empty shm buffer {}x{} stride {}",
                desc.width, desc.height, desc.stride
            )));
        }
        if size > self.options.max_shm_bytes || size > u32::MAX as u64 {
            return Err(CastError::ResourceExhausted(format!(
                "shm buffer of {} bytes exceeds limit of {}",
                size, self.options.max_shm_bytes
            )));
        }

        let (fd, name) = self.shm.create()?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(CastError::ResourceExhausted(format!(
                "ftruncate {}: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        let desc = BufferDescriptor {
            size: size as u32,
            ..*desc
        };
        let handle = importer
            .import_shm(fd.as_fd(), &desc)
            .map_err(|e| CastError::AllocationFailed(e.to_string()))?;

        tracing::debug!(
            "allocated shm buffer {} ({}x{}, stride {}, {} bytes)",
            name,
            desc.width,
            desc.height,
            desc.stride,
            size
        );

        let plane = Plane {
            fd,
            offset: 0,
            stride: desc.stride,
            size: size as u32,
        };
        Ok(ManagedBuffer::new(
            desc,
            Backing::Shm(ShmBacking { plane, name }),
            handle,
        ))
    }

    fn allocate_gpu<I: BufferImporter>(
        &self,
        importer: &mut I,
        desc: &BufferDescriptor,
        modifier: DrmModifier,
    ) -> Result<ManagedBuffer<I::Buffer>, CastError> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| CastError::AllocationFailed("no GPU device".to_string()))?;

        let bo = match modifier {
            DrmModifier::Invalid => gpu.create(desc, self.options.force_linear),
            m => gpu.create_with_modifiers(desc, &[m]).or_else(|e| {
                if m == DrmModifier::Linear {
                    tracing::debug!("explicit linear allocation failed ({}), retrying implicit linear", e);
                    gpu.create(desc, true)
                } else {
                    Err(e)
                }
            }),
        }
        .map_err(|e| CastError::AllocationFailed(e.to_string()))?;

        let plane_count = bo.plane_count();
        let mut planes = Vec::with_capacity(plane_count as usize);
        for plane in 0..plane_count {
            // Already exported planes are closed when `planes` drops
            let fd = bo.fd_for_plane(plane).map_err(|e| {
                CastError::AllocationFailed(format!("export of plane {}: {}", plane, e))
            })?;
            planes.push(Plane {
                fd,
                offset: bo.offset(plane),
                stride: bo.stride_for_plane(plane),
                size: 0,
            });
        }

        let infos: Vec<PlaneInfo> = planes.iter().map(Plane::info).collect();
        let chosen = bo.modifier();
        let handle = importer
            .import_dmabuf(desc, chosen, &infos)
            .map_err(|e| CastError::AllocationFailed(e.to_string()))?;

        tracing::debug!(
            "allocated dmabuf buffer {}x{} with {} plane(s), modifier {:#x}",
            desc.width,
            desc.height,
            plane_count,
            u64::from(chosen)
        );

        let desc = BufferDescriptor {
            stride: planes.first().map(|p| p.stride).unwrap_or(0),
            ..*desc
        };
        Ok(ManagedBuffer::new(
            desc,
            Backing::Gpu(GpuBacking {
                planes,
                modifier: chosen,
                bo,
            }),
            handle,
        ))
    }
}
