//! Wayland side of the screencast: globals, outputs and wlr-screencopy frames.
//!
//! One connection serves every cast. Frame events are tagged with the key of
//! the cast that requested them and queued on [`WaylandState`]; the driver
//! drains them after each dispatch and routes them to the sessions.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use drm_fourcc::DrmModifier;
use wayland_client::backend::WaylandError;
use wayland_client::protocol::{wl_buffer, wl_output, wl_registry, wl_shm, wl_shm_pool};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};
use wayland_protocols_wlr::screencopy::v1::client::{
    zwlr_screencopy_frame_v1, zwlr_screencopy_manager_v1,
};

use crate::cast::buffer::{BufferDescriptor, BufferImporter, PlaneInfo};
use crate::cast::format::{drm_from_wl_shm, wl_shm_from_drm};
use crate::cast::{CaptureBackend, CaptureEvent, CaptureTarget, CastError, OutputId, Rect};
use crate::chooser::OutputInfo;

/// Screencopy version that reports dmabuf constraints and `buffer_done`.
const SCREENCOPY_VERSION: u32 = 3;
/// Last linux-dmabuf version that sends `modifier` events.
const LINUX_DMABUF_VERSION: u32 = 3;

struct OutputEntry {
    output: wl_output::WlOutput,
    info: OutputInfo,
    done: bool,
}

/// Dispatch state of the shared connection.
pub struct WaylandState {
    shm: Option<wl_shm::WlShm>,
    screencopy: Option<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1>,
    dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    outputs: Vec<OutputEntry>,
    modifiers: Vec<(u32, DrmModifier)>,
    events: VecDeque<(u64, CaptureEvent)>,
}

impl WaylandState {
    fn new() -> Self {
        Self {
            shm: None,
            screencopy: None,
            dmabuf: None,
            outputs: Vec::new(),
            modifiers: Vec::new(),
            events: VecDeque::new(),
        }
    }

    fn push(&mut self, key: u64, event: CaptureEvent) {
        self.events.push_back((key, event));
    }
}

fn wayland_err(context: &str, e: impl std::fmt::Display) -> CastError {
    CastError::Wayland(format!("{}: {}", context, e))
}

pub struct WaylandContext {
    conn: Connection,
    queue: EventQueue<WaylandState>,
    state: WaylandState,
}

impl WaylandContext {
    /// Connect to `$WAYLAND_DISPLAY` and collect globals and output details.
    pub fn connect() -> Result<Self, CastError> {
        let conn = Connection::connect_to_env()
            .map_err(|e| wayland_err("failed to connect to Wayland display", e))?;

        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        conn.display().get_registry(&qh, ());

        let mut state = WaylandState::new();
        // Globals, then output details and dmabuf modifiers
        queue
            .roundtrip(&mut state)
            .map_err(|e| wayland_err("roundtrip failed", e))?;
        queue
            .roundtrip(&mut state)
            .map_err(|e| wayland_err("roundtrip failed", e))?;

        if state.shm.is_none() {
            return Err(CastError::Unsupported("compositor has no wl_shm".into()));
        }
        tracing::info!(
            "wayland connected: screencopy {}, linux-dmabuf {}, {} output(s), {} modifier(s)",
            state.screencopy.is_some(),
            state.dmabuf.is_some(),
            state.outputs.len(),
            state.modifiers.len()
        );

        Ok(Self { conn, queue, state })
    }

    pub fn has_screencopy(&self) -> bool {
        self.state.screencopy.is_some()
    }

    /// Outputs that finished their initial description.
    pub fn outputs(&self) -> Vec<OutputInfo> {
        self.state
            .outputs
            .iter()
            .filter(|o| o.done)
            .map(|o| o.info.clone())
            .collect()
    }

    pub fn output(&self, id: OutputId) -> Option<OutputInfo> {
        self.state
            .outputs
            .iter()
            .find(|o| o.info.id == id)
            .map(|o| o.info.clone())
    }

    /// (fourcc, modifier) pairs the compositor can import.
    pub fn modifiers(&self) -> Vec<(u32, DrmModifier)> {
        self.state.modifiers.clone()
    }

    /// Capture backend for one cast. Events of its frames carry `key`.
    pub fn capture_for(&self, key: u64, target: &CaptureTarget) -> Result<WaylandCapture, CastError> {
        let manager = self
            .state
            .screencopy
            .clone()
            .ok_or_else(|| CastError::Unsupported("compositor has no wlr-screencopy".into()))?;
        let shm = self
            .state
            .shm
            .clone()
            .ok_or_else(|| CastError::Unsupported("compositor has no wl_shm".into()))?;
        let output = self
            .state
            .outputs
            .iter()
            .find(|o| o.info.id == target.output)
            .map(|o| o.output.clone())
            .ok_or_else(|| {
                CastError::InvalidParameters(format!("output {} not found", target.output.0))
            })?;

        Ok(WaylandCapture {
            key,
            qh: self.queue.handle(),
            shm,
            manager,
            dmabuf: self.state.dmabuf.clone(),
            output,
            frame: None,
        })
    }

    /// Block until the compositor handled every request sent so far.
    pub fn roundtrip(&mut self) -> Result<(), CastError> {
        self.queue
            .roundtrip(&mut self.state)
            .map(|_| ())
            .map_err(|e| wayland_err("roundtrip failed", e))
    }

    /// Block until at least one event was dispatched.
    pub fn blocking_dispatch(&mut self) -> Result<(), CastError> {
        self.queue
            .blocking_dispatch(&mut self.state)
            .map(|_| ())
            .map_err(|e| wayland_err("dispatch failed", e))
    }

    /// Read whatever is available on the socket without blocking and dispatch it.
    pub fn dispatch_available(&mut self) -> Result<(), CastError> {
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| wayland_err("dispatch failed", e))?;

        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(wayland_err("read failed", e)),
            }
        }

        self.queue
            .dispatch_pending(&mut self.state)
            .map(|_| ())
            .map_err(|e| wayland_err("dispatch failed", e))
    }

    pub fn flush(&self) -> Result<(), CastError> {
        match self.conn.flush() {
            Ok(()) => Ok(()),
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(wayland_err("flush failed", e)),
        }
    }

    /// Descriptor to poll for readability.
    pub fn poll_fd(&self) -> RawFd {
        self.conn.backend().poll_fd().as_raw_fd()
    }

    pub fn take_events(&mut self) -> Vec<(u64, CaptureEvent)> {
        self.state.events.drain(..).collect()
    }
}

/// Screencopy capture of one output for one cast.
pub struct WaylandCapture {
    key: u64,
    qh: QueueHandle<WaylandState>,
    shm: wl_shm::WlShm,
    manager: zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
    dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    output: wl_output::WlOutput,
    frame: Option<zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1>,
}

impl WaylandCapture {
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl BufferImporter for WaylandCapture {
    type Buffer = wl_buffer::WlBuffer;

    fn import_shm(
        &mut self,
        fd: BorrowedFd<'_>,
        desc: &BufferDescriptor,
    ) -> Result<wl_buffer::WlBuffer, CastError> {
        let format = wl_shm::Format::try_from(wl_shm_from_drm(desc.format)).map_err(|_| {
            CastError::InvalidParameters(format!("unknown shm format {:#010x}", desc.format))
        })?;
        let size = i32::try_from(desc.size)
            .map_err(|_| CastError::InvalidParameters(format!("shm size {} too large", desc.size)))?;

        let pool = self.shm.create_pool(fd, size, &self.qh, ());
        let buffer = pool.create_buffer(
            0,
            desc.width as i32,
            desc.height as i32,
            desc.stride as i32,
            format,
            &self.qh,
            (),
        );
        // The buffer keeps the mapping alive
        pool.destroy();
        Ok(buffer)
    }

    fn import_dmabuf(
        &mut self,
        desc: &BufferDescriptor,
        modifier: DrmModifier,
        planes: &[PlaneInfo],
    ) -> Result<wl_buffer::WlBuffer, CastError> {
        let dmabuf = self
            .dmabuf
            .as_ref()
            .ok_or_else(|| CastError::ImportFailed("compositor has no linux-dmabuf".into()))?;

        let modifier = u64::from(modifier);
        let params = dmabuf.create_params(&self.qh, self.key);
        for (index, plane) in planes.iter().enumerate() {
            // The plane descriptor outlives this request; the compositor dups it
            let fd = unsafe { BorrowedFd::borrow_raw(plane.fd) };
            params.add(
                fd,
                index as u32,
                plane.offset,
                plane.stride,
                (modifier >> 32) as u32,
                (modifier & 0xffff_ffff) as u32,
            );
        }
        let buffer = params.create_immed(
            desc.width as i32,
            desc.height as i32,
            desc.format,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &self.qh,
            (),
        );
        params.destroy();
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: wl_buffer::WlBuffer) {
        buffer.destroy();
    }
}

impl CaptureBackend for WaylandCapture {
    fn capture_output(&mut self, target: &CaptureTarget) -> Result<(), CastError> {
        if let Some(old) = self.frame.take() {
            old.destroy();
        }
        if !self.output.is_alive() {
            return Err(CastError::CaptureFailed(format!(
                "output {} is gone",
                target.output.0
            )));
        }
        let frame = self.manager.capture_output(
            i32::from(target.with_cursor),
            &self.output,
            &self.qh,
            self.key,
        );
        self.frame = Some(frame);
        Ok(())
    }

    fn copy(&mut self, buffer: &wl_buffer::WlBuffer) -> Result<(), CastError> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| CastError::CaptureFailed("no frame to copy".into()))?;
        if frame.version() >= 2 {
            frame.copy_with_damage(buffer);
        } else {
            frame.copy(buffer);
        }
        Ok(())
    }

    fn discard_frame(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
    }
}

impl Drop for WaylandCapture {
    fn drop(&mut self) {
        self.discard_frame();
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_shm" => {
                    state.shm = Some(registry.bind::<wl_shm::WlShm, _, _>(name, 1, qh, ()));
                }
                "zwlr_screencopy_manager_v1" => {
                    state.screencopy = Some(
                        registry.bind::<zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1, _, _>(
                            name,
                            version.min(SCREENCOPY_VERSION),
                            qh,
                            (),
                        ),
                    );
                }
                "zwp_linux_dmabuf_v1" if version >= LINUX_DMABUF_VERSION => {
                    state.dmabuf = Some(
                        registry.bind::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, _, _>(
                            name,
                            LINUX_DMABUF_VERSION,
                            qh,
                            (),
                        ),
                    );
                }
                "wl_output" => {
                    let output =
                        registry.bind::<wl_output::WlOutput, _, _>(name, version.min(4), qh, name);
                    state.outputs.push(OutputEntry {
                        output,
                        info: OutputInfo {
                            id: OutputId(name),
                            name: format!("output-{}", name),
                            description: String::new(),
                            width: 0,
                            height: 0,
                            refresh_mhz: 0,
                            transform: 0,
                        },
                        done: false,
                    });
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(pos) = state.outputs.iter().position(|o| o.info.id.0 == name) {
                    let entry = state.outputs.remove(pos);
                    tracing::info!("output {} removed", entry.info.name);
                    if entry.output.version() >= 3 {
                        entry.output.release();
                    }
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for WaylandState {
    fn event(
        state: &mut Self,
        _output: &wl_output::WlOutput,
        event: wl_output::Event,
        global: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.outputs.iter_mut().find(|o| o.info.id.0 == *global) else {
            return;
        };

        match event {
            wl_output::Event::Geometry { transform, .. } => {
                entry.info.transform = match transform {
                    WEnum::Value(t) => u32::from(t),
                    WEnum::Unknown(raw) => raw,
                };
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                if let WEnum::Value(flags) = flags {
                    if flags.contains(wl_output::Mode::Current) {
                        entry.info.width = width;
                        entry.info.height = height;
                        entry.info.refresh_mhz = refresh;
                    }
                }
            }
            wl_output::Event::Name { name } => entry.info.name = name,
            wl_output::Event::Description { description } => entry.info.description = description,
            wl_output::Event::Done => entry.done = true,
            _ => {}
        }
    }
}

impl Dispatch<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _dmabuf: &zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1,
        event: zwp_linux_dmabuf_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zwp_linux_dmabuf_v1::Event::Modifier {
            format,
            modifier_hi,
            modifier_lo,
        } = event
        {
            let modifier = DrmModifier::from(((modifier_hi as u64) << 32) | modifier_lo as u64);
            if !state.modifiers.contains(&(format, modifier)) {
                state.modifiers.push((format, modifier));
            }
        }
    }
}

impl Dispatch<zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1, u64> for WaylandState {
    fn event(
        state: &mut Self,
        _params: &zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        key: &u64,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            tracing::error!("compositor rejected dmabuf import for cast {}", key);
            state.push(*key, CaptureEvent::ImportRejected);
        }
    }
}

impl Dispatch<zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1, u64> for WaylandState {
    fn event(
        state: &mut Self,
        frame: &zwlr_screencopy_frame_v1::ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        key: &u64,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_screencopy_frame_v1::Event;

        let key = *key;
        match event {
            Event::Buffer {
                format,
                width,
                height,
                stride,
            } => {
                let code = match format {
                    WEnum::Value(f) => u32::from(f),
                    WEnum::Unknown(raw) => raw,
                };
                state.push(
                    key,
                    CaptureEvent::Buffer {
                        format: drm_from_wl_shm(code),
                        width,
                        height,
                        stride,
                    },
                );
                // Before v3 the shm constraints are the only ones sent
                if frame.version() < 3 {
                    state.push(key, CaptureEvent::BufferDone);
                }
            }
            Event::LinuxDmabuf {
                format,
                width,
                height,
            } => state.push(
                key,
                CaptureEvent::LinuxDmabuf {
                    format,
                    width,
                    height,
                },
            ),
            Event::BufferDone => state.push(key, CaptureEvent::BufferDone),
            Event::Flags { flags } => {
                let y_invert = matches!(
                    flags,
                    WEnum::Value(f) if f.contains(zwlr_screencopy_frame_v1::Flags::YInvert)
                );
                state.push(key, CaptureEvent::Flags { y_invert });
            }
            Event::Damage {
                x,
                y,
                width,
                height,
            } => state.push(
                key,
                CaptureEvent::Damage(Rect::new(x as i32, y as i32, width, height)),
            ),
            Event::Ready {
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
            } => state.push(
                key,
                CaptureEvent::Ready {
                    tv_sec: ((tv_sec_hi as u64) << 32) | tv_sec_lo as u64,
                    tv_nsec,
                },
            ),
            Event::Failed => state.push(key, CaptureEvent::Failed),
            _ => {}
        }
    }
}

delegate_noop!(WaylandState: ignore wl_shm::WlShm);
delegate_noop!(WaylandState: ignore wl_shm_pool::WlShmPool);
delegate_noop!(WaylandState: ignore wl_buffer::WlBuffer);
delegate_noop!(WaylandState: ignore zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1);
