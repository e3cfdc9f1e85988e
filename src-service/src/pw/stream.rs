//! [`StreamBackend`] over a PipeWire output stream with caller-allocated buffers.
//!
//! Pool slots are the stream's `pw_buffer`s. Each one is tagged with its
//! [`PoolId`] through `user_data` when it is added, so dequeued buffers map back
//! to the memory the session attached.

use std::collections::HashMap;
use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use libspa::pod::Pod;
use libspa_sys::{
    spa_buffer, spa_meta, spa_meta_header, spa_meta_region, spa_meta_videotransform,
};
use pipewire::stream::Stream;
use pipewire::sys::pw_buffer;

use crate::cast::negotiate::{DataType, ParamsUpdate};
use crate::cast::{CastError, FrameMeta, PoolBufferSetup, PoolId, Rect, StreamBackend};

use super::pod;

pub struct PwStreamBackend {
    stream: Rc<Stream>,
    slots: HashMap<PoolId, NonNull<pw_buffer>>,
    next_id: u64,
}

/// Metadata block of `meta_type` with at least `min_size` bytes.
unsafe fn find_meta(buffer: *mut spa_buffer, meta_type: u32, min_size: usize) -> Option<*mut spa_meta> {
    let buffer = buffer.as_ref()?;
    (0..buffer.n_metas as usize)
        .map(|i| buffer.metas.add(i))
        .find(|&meta| (*meta).type_ == meta_type && (*meta).size as usize >= min_size && !(*meta).data.is_null())
}

fn region(rect: &Rect) -> spa_meta_region {
    let mut region: spa_meta_region = unsafe { std::mem::zeroed() };
    region.region.position.x = rect.x;
    region.region.position.y = rect.y;
    region.region.size.width = rect.width;
    region.region.size.height = rect.height;
    region
}

impl PwStreamBackend {
    pub fn new(stream: Rc<Stream>) -> Self {
        Self {
            stream,
            slots: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    fn slot_id(buffer: *mut pw_buffer) -> Option<PoolId> {
        let raw = unsafe { buffer.as_ref()?.user_data } as usize;
        (raw != 0).then_some(PoolId(raw as u64))
    }

    /// Tag a buffer the stream just added.
    pub fn register(&mut self, buffer: *mut pw_buffer) -> Option<PoolId> {
        let slot = NonNull::new(buffer)?;
        let id = PoolId(self.next_id);
        self.next_id += 1;
        unsafe { (*buffer).user_data = id.0 as usize as *mut c_void };
        self.slots.insert(id, slot);
        Some(id)
    }

    /// Forget a buffer the stream is about to free.
    pub fn unregister(&mut self, buffer: *mut pw_buffer) -> Option<PoolId> {
        let id = Self::detach(buffer)?;
        self.forget(id);
        Some(id)
    }

    /// Untag a buffer the stream is about to free, leaving the slot table alone.
    ///
    /// Only valid inside the stream's `remove_buffer` callback. The returned id
    /// must be passed to [`forget`](Self::forget) before the slot is used again.
    pub fn detach(buffer: *mut pw_buffer) -> Option<PoolId> {
        let id = Self::slot_id(buffer)?;
        unsafe {
            if let Some(spa) = (*buffer).buffer.as_mut() {
                for i in 0..spa.n_datas as usize {
                    (*spa.datas.add(i)).fd = -1;
                }
            }
            (*buffer).user_data = ptr::null_mut();
        }
        Some(id)
    }

    /// Drop the slot entry of a detached buffer.
    pub fn forget(&mut self, id: PoolId) {
        self.slots.remove(&id);
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Point a slot's data blocks at the session's memory.
    pub fn attach(&self, id: PoolId, setup: &PoolBufferSetup) -> Result<(), CastError> {
        let slot = self
            .slots
            .get(&id)
            .ok_or_else(|| CastError::InvalidParameters(format!("unknown pool slot {:?}", id)))?;
        let data_type = match setup.data_type {
            DataType::MemFd => libspa_sys::SPA_DATA_MemFd,
            DataType::DmaBuf => libspa_sys::SPA_DATA_DmaBuf,
        };

        unsafe {
            let spa = (*slot.as_ptr())
                .buffer
                .as_mut()
                .ok_or_else(|| CastError::InvalidParameters("pool slot has no spa buffer".into()))?;
            if spa.n_datas as usize != setup.planes.len() {
                return Err(CastError::InvalidParameters(format!(
                    "slot has {} data blocks for {} planes",
                    spa.n_datas,
                    setup.planes.len()
                )));
            }
            if spa.n_datas > 0 && (*spa.datas).type_ & (1 << data_type) == 0 {
                return Err(CastError::InvalidParameters(format!(
                    "slot does not accept data type {}",
                    data_type
                )));
            }

            for (i, (plane, chunk_size)) in setup.planes.iter().zip(&setup.chunk_sizes).enumerate() {
                let data = &mut *spa.datas.add(i);
                data.type_ = data_type;
                data.flags = 0;
                data.fd = plane.fd as i64;
                data.mapoffset = 0;
                data.maxsize = plane.size;
                data.data = ptr::null_mut();
                if let Some(chunk) = data.chunk.as_mut() {
                    chunk.offset = plane.offset;
                    chunk.stride = plane.stride as i32;
                    chunk.size = *chunk_size;
                    chunk.flags = libspa_sys::SPA_CHUNK_FLAG_NONE as i32;
                }
            }
        }
        Ok(())
    }

    unsafe fn write_meta(spa: *mut spa_buffer, meta: &FrameMeta) {
        if let Some(m) = find_meta(spa, libspa_sys::SPA_META_Header, size_of::<spa_meta_header>()) {
            let header = &mut *((*m).data as *mut spa_meta_header);
            header.pts = meta.pts_ns;
            header.flags = if meta.corrupted {
                libspa_sys::SPA_META_HEADER_FLAG_CORRUPTED
            } else {
                0
            };
            header.seq = meta.seq;
            header.dts_offset = 0;
        }

        if let Some(m) = find_meta(
            spa,
            libspa_sys::SPA_META_VideoTransform,
            size_of::<spa_meta_videotransform>(),
        ) {
            (*((*m).data as *mut spa_meta_videotransform)).transform = meta.transform;
        }

        if let Some(m) = find_meta(spa, libspa_sys::SPA_META_VideoDamage, size_of::<spa_meta_region>()) {
            let capacity = (*m).size as usize / size_of::<spa_meta_region>();
            let regions = (*m).data as *mut spa_meta_region;
            for i in 0..capacity {
                match meta.damage.get(i) {
                    Some(rect) => *regions.add(i) = region(rect),
                    None => {
                        // A zero-sized region ends a short list
                        *regions.add(i) = region(&Rect::default());
                        break;
                    }
                }
            }
        }

        let spa = &mut *spa;
        let flags = if meta.corrupted {
            libspa_sys::SPA_CHUNK_FLAG_CORRUPTED as i32
        } else {
            libspa_sys::SPA_CHUNK_FLAG_NONE as i32
        };
        for i in 0..spa.n_datas as usize {
            if let Some(chunk) = (*spa.datas.add(i)).chunk.as_mut() {
                chunk.flags = flags;
            }
        }
    }
}

impl StreamBackend for PwStreamBackend {
    fn update_params(&mut self, update: &ParamsUpdate) -> Result<(), CastError> {
        let pods = pod::params_pods(update)?;
        let mut params = pods
            .iter()
            .map(|bytes| {
                Pod::from_bytes(bytes)
                    .ok_or_else(|| CastError::InvalidParameters("invalid pod".into()))
            })
            .collect::<Result<Vec<&Pod>, CastError>>()?;
        self.stream
            .update_params(&mut params)
            .map_err(|e| CastError::StreamDisconnected(format!("update_params failed: {}", e)))
    }

    fn dequeue(&mut self) -> Option<PoolId> {
        let buffer = unsafe { self.stream.dequeue_raw_buffer() };
        if buffer.is_null() {
            return None;
        }
        match Self::slot_id(buffer) {
            Some(id) => Some(id),
            None => {
                tracing::warn!("dequeued untagged buffer, returning it");
                unsafe { self.stream.queue_raw_buffer(buffer) };
                None
            }
        }
    }

    fn damage_capacity(&self, id: PoolId) -> usize {
        let Some(slot) = self.slots.get(&id) else {
            return 0;
        };
        unsafe {
            find_meta(
                (*slot.as_ptr()).buffer,
                libspa_sys::SPA_META_VideoDamage,
                size_of::<spa_meta_region>(),
            )
            .map(|m| (*m).size as usize / size_of::<spa_meta_region>())
            .unwrap_or(0)
        }
    }

    fn queue(&mut self, id: PoolId, meta: &FrameMeta) -> Result<(), CastError> {
        let slot = self
            .slots
            .get(&id)
            .ok_or_else(|| CastError::InvalidParameters(format!("unknown pool slot {:?}", id)))?;
        let buffer = slot.as_ptr();
        unsafe {
            Self::write_meta((*buffer).buffer, meta);
            let res = self.stream.queue_raw_buffer(buffer);
            if res < 0 {
                return Err(CastError::StreamDisconnected(format!(
                    "queue_buffer failed: {}",
                    res
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspa_sys::spa_data;

    #[test]
    fn test_detach_untags_buffer_and_drops_fds() {
        let mut datas: [spa_data; 2] = unsafe { std::mem::zeroed() };
        datas[0].fd = 11;
        datas[1].fd = 12;
        let mut spa: spa_buffer = unsafe { std::mem::zeroed() };
        spa.n_datas = 2;
        spa.datas = datas.as_mut_ptr();
        let mut buffer: pw_buffer = unsafe { std::mem::zeroed() };
        buffer.buffer = &mut spa;
        buffer.user_data = 7usize as *mut c_void;

        assert_eq!(PwStreamBackend::detach(&mut buffer), Some(PoolId(7)));
        assert!(buffer.user_data.is_null());
        assert_eq!(datas[0].fd, -1);
        assert_eq!(datas[1].fd, -1);

        // A second removal of the same buffer finds no tag
        assert_eq!(PwStreamBackend::detach(&mut buffer), None);
    }

    #[test]
    fn test_detach_ignores_untagged_buffer() {
        let mut buffer: pw_buffer = unsafe { std::mem::zeroed() };
        assert_eq!(PwStreamBackend::detach(&mut buffer), None);
        assert_eq!(PwStreamBackend::detach(ptr::null_mut()), None);
    }
}
