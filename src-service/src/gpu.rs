//! GPU buffer allocation through libgbm on a DRM render node.

use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::path::Path;

use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, BufferObjectFlags, Device};

use crate::cast::buffer::{BufferDescriptor, GpuBufferObject, GpuDevice};
use crate::cast::CastError;

pub struct GbmDevice {
    device: Device<File>,
}

impl GbmDevice {
    pub fn open(render_node: &Path) -> Result<Self, CastError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(render_node)
            .map_err(|e| {
                CastError::Unsupported(format!("cannot open {}: {}", render_node.display(), e))
            })?;
        let device = Device::new(file).map_err(|e| {
            CastError::Unsupported(format!(
                "cannot create gbm device on {}: {}",
                render_node.display(),
                e
            ))
        })?;
        tracing::info!("gbm device on {}", render_node.display());
        Ok(Self { device })
    }
}

fn fourcc(desc: &BufferDescriptor) -> Result<DrmFourcc, CastError> {
    DrmFourcc::try_from(desc.format).map_err(|_| {
        CastError::InvalidParameters(format!("unknown fourcc {:#010x}", desc.format))
    })
}

struct GbmBuffer(BufferObject<()>);

impl GpuBufferObject for GbmBuffer {
    fn modifier(&self) -> DrmModifier {
        self.0.modifier()
    }

    fn plane_count(&self) -> u32 {
        self.0.plane_count()
    }

    fn stride_for_plane(&self, plane: u32) -> u32 {
        self.0.stride_for_plane(plane as i32)
    }

    fn offset(&self, plane: u32) -> u32 {
        self.0.offset(plane as i32)
    }

    fn fd_for_plane(&self, plane: u32) -> Result<OwnedFd, CastError> {
        self.0
            .fd_for_plane(plane as i32)
            .map_err(|e| CastError::AllocationFailed(format!("plane {} export failed: {}", plane, e)))
    }
}

impl GpuDevice for GbmDevice {
    fn create_with_modifiers(
        &self,
        desc: &BufferDescriptor,
        modifiers: &[DrmModifier],
    ) -> Result<Box<dyn GpuBufferObject>, CastError> {
        let bo = self
            .device
            .create_buffer_object_with_modifiers2::<()>(
                desc.width,
                desc.height,
                fourcc(desc)?,
                modifiers.iter().copied(),
                BufferObjectFlags::RENDERING,
            )
            .map_err(|e| CastError::AllocationFailed(format!("gbm allocation failed: {}", e)))?;
        Ok(Box::new(GbmBuffer(bo)))
    }

    fn create(
        &self,
        desc: &BufferDescriptor,
        linear: bool,
    ) -> Result<Box<dyn GpuBufferObject>, CastError> {
        let mut usage = BufferObjectFlags::RENDERING;
        if linear {
            usage |= BufferObjectFlags::LINEAR;
        }
        let bo = self
            .device
            .create_buffer_object::<()>(desc.width, desc.height, fourcc(desc)?, usage)
            .map_err(|e| CastError::AllocationFailed(format!("gbm allocation failed: {}", e)))?;
        Ok(Box::new(GbmBuffer(bo)))
    }

    fn modifier_plane_count(&self, format: u32, modifier: DrmModifier) -> Option<u32> {
        let format = DrmFourcc::try_from(format).ok()?;
        self.device
            .format_modifier_plane_count(format, modifier)
            .filter(|&n| n > 0)
    }
}
