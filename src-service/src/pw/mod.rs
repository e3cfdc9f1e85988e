//! PipeWire driver: owns the loop, the Wayland connection and every cast.
//!
//! All work happens on one thread. The loop is iterated by hand so that
//! Wayland events, stream callbacks and capture timers interleave without
//! locks. Callbacks only queue [`SessionEvent`]s on their cast; a callback
//! that fires while the session is busy leaves its event for the outer drain.

pub mod pod;
pub mod stream;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libspa::param::ParamType;
use libspa::pod::Pod;
use libspa::support::system::IoFlags;
use libspa::utils::Direction;
use pipewire::context::Context;
use pipewire::core::Core;
use pipewire::loop_::{LoopRef, TimerSource};
use pipewire::main_loop::MainLoop;
use pipewire::properties::properties;
use pipewire::stream::{Stream, StreamFlags, StreamListener, StreamState as PwStreamState};
use wlcast_common::ScreencastConfig;

use crate::cast::negotiate::{NegotiationConfig, DEFAULT_FRAMERATE};
use crate::cast::{
    AllocatorOptions, BufferAllocator, CaptureSession, CaptureTarget, CastError,
    FormatNegotiator, FrameState, GpuDevice, PoolId, PosixShm, SessionEvent, StreamEvent,
    StreamState, TimerRequest,
};
use crate::chooser::OutputInfo;
use crate::portal::CastLauncher;
use crate::wayland::{WaylandCapture, WaylandContext};

use self::stream::PwStreamBackend;

/// Longest the loop sleeps before checking for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
/// How long a new stream may take to get its node id.
const NODE_ID_TIMEOUT: Duration = Duration::from_secs(5);
/// Compositor round trips allowed for the first capture.
const BOOTSTRAP_ATTEMPTS: u32 = 3;
/// PipeWire's "no id".
const SPA_ID_INVALID: u32 = u32::MAX;

type PwSession = CaptureSession<WaylandCapture, PwStreamBackend>;

struct CastCell {
    session: RefCell<PwSession>,
    pending: RefCell<VecDeque<SessionEvent>>,
    /// Pool slots freed by the stream while the session was busy
    removed: RefCell<Vec<PoolId>>,
}

impl CastCell {
    fn new(session: PwSession) -> Self {
        Self {
            session: RefCell::new(session),
            pending: RefCell::new(VecDeque::new()),
            removed: RefCell::new(Vec::new()),
        }
    }

    fn post(&self, event: SessionEvent) {
        self.pending.borrow_mut().push_back(event);
        self.pump();
    }

    /// Feed queued events to the session unless it is already handling one.
    fn pump(&self) {
        let Ok(mut session) = self.session.try_borrow_mut() else {
            return;
        };
        loop {
            let removed = std::mem::take(&mut *self.removed.borrow_mut());
            for id in removed {
                session.stream_mut().backend_mut().forget(id);
                session.handle(SessionEvent::Stream(StreamEvent::BufferRemoved(id)));
            }
            let next = self.pending.borrow_mut().pop_front();
            let Some(event) = next else {
                if self.removed.borrow().is_empty() {
                    break;
                }
                continue;
            };
            session.handle(event);
        }
    }
}

struct ActiveCast {
    cast_id: String,
    cell: Rc<CastCell>,
    stream: Rc<Stream>,
    listener: Option<StreamListener<()>>,
}

fn pw_err(context: &str, e: impl std::fmt::Display) -> CastError {
    CastError::StreamDisconnected(format!("{}: {}", context, e))
}

fn iterate(loop_: &LoopRef, timeout: Duration) {
    loop_.enter();
    let res = loop_.iterate(timeout);
    loop_.leave();
    if res < 0 {
        tracing::warn!("pipewire loop iteration failed: {}", res);
    }
}

fn stream_state(state: &PwStreamState) -> StreamState {
    match state {
        PwStreamState::Error(msg) => StreamState::Error(msg.clone()),
        PwStreamState::Unconnected => StreamState::Unconnected,
        PwStreamState::Connecting => StreamState::Connecting,
        PwStreamState::Paused => StreamState::Paused,
        PwStreamState::Streaming => StreamState::Streaming,
    }
}

/// Route queued compositor events to their casts.
fn route_capture_events(wayland: &mut WaylandContext, casts: &BTreeMap<u64, ActiveCast>) {
    for (key, event) in wayland.take_events() {
        match casts.get(&key) {
            Some(cast) => cast.cell.post(SessionEvent::Capture(event)),
            None => tracing::trace!("dropping event for finished cast {}", key),
        }
    }
}

fn register_listener(cast: &ActiveCast) -> Result<StreamListener<()>, CastError> {
    let on_state = Rc::downgrade(&cast.cell);
    let on_param = Rc::downgrade(&cast.cell);
    let on_add = Rc::downgrade(&cast.cell);
    let on_remove = Rc::downgrade(&cast.cell);
    let on_process = Rc::downgrade(&cast.cell);

    cast.stream
        .add_local_listener_with_user_data(())
        .state_changed(move |stream, _, _old, new| {
            let Some(cell) = on_state.upgrade() else { return };
            let node_id = stream.node_id();
            cell.post(SessionEvent::Stream(StreamEvent::StateChanged {
                state: stream_state(&new),
                node_id: (node_id != SPA_ID_INVALID).then_some(node_id),
            }));
        })
        .param_changed(move |_, _, id, param| {
            if id != ParamType::Format.as_raw() {
                return;
            }
            let (Some(param), Some(cell)) = (param, on_param.upgrade()) else {
                return;
            };
            match pod::parse_stream_format(param.as_bytes()) {
                Ok(format) => cell.post(SessionEvent::Stream(StreamEvent::FormatChanged(format))),
                Err(e) => tracing::warn!("ignoring consumer format: {}", e),
            }
        })
        .add_buffer(move |_, _, buffer| {
            let Some(cell) = on_add.upgrade() else { return };
            attach_buffer(&cell, buffer);
            cell.pump();
        })
        .remove_buffer(move |_, _, buffer| {
            let Some(cell) = on_remove.upgrade() else { return };
            let Ok(mut session) = cell.session.try_borrow_mut() else {
                if let Some(id) = PwStreamBackend::detach(buffer) {
                    tracing::debug!("pool buffer {:?} removed while the session is busy", id);
                    cell.removed.borrow_mut().push(id);
                }
                return;
            };
            if let Some(id) = session.stream_mut().backend_mut().unregister(buffer) {
                session.handle(SessionEvent::Stream(StreamEvent::BufferRemoved(id)));
            }
            drop(session);
            cell.pump();
        })
        .process(move |_, _| {
            if let Some(cell) = on_process.upgrade() {
                cell.post(SessionEvent::Stream(StreamEvent::ProcessReady));
            }
        })
        .register()
        .map_err(|e| pw_err("failed to register stream listener", e))
}

/// Allocate memory for a new pool slot and describe it to the stream.
fn attach_buffer(cell: &CastCell, buffer: *mut pipewire::sys::pw_buffer) {
    let Ok(mut session) = cell.session.try_borrow_mut() else {
        tracing::error!("pool buffer added while the session is busy");
        return;
    };
    let Some(id) = session.stream_mut().backend_mut().register(buffer) else {
        return;
    };
    session.handle(SessionEvent::Stream(StreamEvent::BufferAdded(id)));

    match session.buffer_setup(id) {
        Some(setup) => {
            if let Err(e) = session.stream().backend().attach(id, &setup) {
                tracing::error!("failed to attach buffer {:?}: {}", id, e);
            }
        }
        None => tracing::warn!("pool buffer {:?} has no memory", id),
    }
}

pub struct Screencaster {
    casts: BTreeMap<u64, ActiveCast>,
    by_id: HashMap<String, u64>,
    next_key: u64,
    wayland: WaylandContext,
    gpu: Option<Rc<dyn GpuDevice>>,
    config: ScreencastConfig,
    core: Core,
    _context: Context,
    mainloop: MainLoop,
}

impl Screencaster {
    pub fn new(config: &ScreencastConfig) -> Result<Self, CastError> {
        pipewire::init();

        let mainloop = MainLoop::new(None).map_err(|e| pw_err("failed to create main loop", e))?;
        let context = Context::new(&mainloop).map_err(|e| pw_err("failed to create context", e))?;
        let core = context
            .connect(None)
            .map_err(|e| pw_err("failed to connect to PipeWire", e))?;
        let wayland = WaylandContext::connect()?;

        Ok(Self {
            casts: BTreeMap::new(),
            by_id: HashMap::new(),
            next_key: 1,
            wayland,
            gpu: open_gpu(config),
            config: config.clone(),
            core,
            _context: context,
            mainloop,
        })
    }

    pub fn wayland(&self) -> &WaylandContext {
        &self.wayland
    }

    pub fn active_casts(&self) -> usize {
        self.casts.len()
    }

    fn negotiator(&self, output: &OutputInfo) -> FormatNegotiator {
        let mut framerate = output.framerate().unwrap_or(DEFAULT_FRAMERATE);
        if let Some(cap) = self.config.fps_cap() {
            framerate = framerate.min(cap.ceil() as u32).max(1);
        }
        let mut negotiator = FormatNegotiator::new(
            self.gpu.clone(),
            NegotiationConfig {
                framerate,
                disable_dmabuf: self.config.disable_dmabuf || self.gpu.is_none(),
                force_linear: self.config.force_mod_linear,
            },
        );
        negotiator.set_compositor_modifiers(self.wayland.modifiers());
        negotiator
    }

    /// Run the first capture of `key` until the compositor reported its constraints.
    fn bootstrap(&mut self, key: u64) -> Result<(), CastError> {
        let cell = match self.casts.get(&key) {
            Some(cast) => cast.cell.clone(),
            None => return Err(CastError::InvalidParameters(format!("unknown cast {}", key))),
        };

        for attempt in 1..=BOOTSTRAP_ATTEMPTS {
            cell.session.borrow_mut().start();
            if cell.session.borrow().is_errored() {
                return Err(CastError::CaptureFailed("capture request rejected".into()));
            }
            self.wayland.flush()?;

            loop {
                self.wayland.blocking_dispatch()?;
                route_capture_events(&mut self.wayland, &self.casts);

                let session = cell.session.borrow();
                if session.is_errored() {
                    return Err(CastError::CaptureFailed("initial capture failed".into()));
                }
                if session.is_initialized() {
                    return Ok(());
                }
                if session.frame_state() == FrameState::Idle {
                    tracing::warn!("initial capture attempt {} failed", attempt);
                    break;
                }
            }
        }
        Err(CastError::CaptureFailed(
            "compositor never reported buffer constraints".into(),
        ))
    }

    /// Iterate the loop until the stream of `key` has a node id.
    fn wait_for_node(&mut self, key: u64) -> Result<u32, CastError> {
        let deadline = Instant::now() + NODE_ID_TIMEOUT;
        loop {
            let Some(cast) = self.casts.get(&key) else {
                return Err(CastError::StreamDisconnected("cast ended while connecting".into()));
            };
            {
                let session = cast.cell.session.borrow();
                if session.is_errored() {
                    return Err(CastError::StreamDisconnected("stream failed to connect".into()));
                }
                if let Some(node_id) = session.stream().node_id() {
                    return Ok(node_id);
                }
            }
            if Instant::now() >= deadline {
                return Err(CastError::StreamDisconnected("timed out waiting for node id".into()));
            }
            iterate(self.mainloop.loop_(), SHUTDOWN_POLL);
            self.wayland.dispatch_available()?;
            route_capture_events(&mut self.wayland, &self.casts);
        }
    }

    fn connect_stream(&mut self, key: u64) -> Result<u32, CastError> {
        let listener = {
            let cast = self
                .casts
                .get(&key)
                .ok_or_else(|| CastError::InvalidParameters(format!("unknown cast {}", key)))?;
            let listener = register_listener(cast)?;

            let update = cast.cell.session.borrow().initial_params();
            let pods = pod::params_pods(&update)?;
            let mut params = pods
                .iter()
                .map(|bytes| {
                    Pod::from_bytes(bytes)
                        .ok_or_else(|| CastError::InvalidParameters("invalid pod".into()))
                })
                .collect::<Result<Vec<&Pod>, CastError>>()?;

            let loop_ = self.mainloop.loop_();
            loop_.enter();
            let connected = cast.stream.connect(
                Direction::Output,
                None,
                StreamFlags::ALLOC_BUFFERS,
                &mut params,
            );
            loop_.leave();
            connected.map_err(|e| pw_err("failed to connect stream", e))?;
            listener
        };

        if let Some(cast) = self.casts.get_mut(&key) {
            cast.listener = Some(listener);
        }
        self.wait_for_node(key)
    }

    /// Drive every cast until `shutdown` is set or no cast is left.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<(), CastError> {
        let loop_ = self.mainloop.loop_();
        // Wakes the loop; events are read by dispatch_available below
        let _wayland_source = loop_.add_io(self.wayland.poll_fd(), IoFlags::IN, |_| {});
        let mut timers: HashMap<u64, TimerSource> = HashMap::new();
        let mut result = Ok(());

        tracing::info!("screencast loop running with {} cast(s)", self.casts.len());
        while !shutdown.load(Ordering::SeqCst) && !self.casts.is_empty() {
            if let Err(e) = self.wayland.flush() {
                result = Err(e);
                break;
            }
            iterate(loop_, SHUTDOWN_POLL);

            if let Err(e) = self.wayland.dispatch_available() {
                result = Err(e);
                break;
            }
            route_capture_events(&mut self.wayland, &self.casts);

            sync_timers(loop_, &self.casts, &mut timers);

            let failed: Vec<(String, Option<String>)> = self
                .casts
                .values()
                .filter_map(|c| {
                    let session = c.cell.session.try_borrow().ok()?;
                    let disconnected = match session.stream().state() {
                        StreamState::Error(msg) => Some(msg.clone()),
                        _ => None,
                    };
                    let errored = session.is_errored();
                    errored.then(|| (c.cast_id.clone(), disconnected))
                })
                .collect();
            for (cast_id, disconnected) in failed {
                tracing::error!("cast {} failed, stopping it", cast_id);
                if let Some(key) = self.by_id.remove(&cast_id) {
                    timers.remove(&key);
                    if let Some(cast) = self.casts.remove(&key) {
                        teardown(cast);
                    }
                }
                if let Some(msg) = disconnected {
                    result = Err(CastError::StreamDisconnected(msg));
                }
            }
            if result.is_err() {
                break;
            }
        }

        timers.clear();
        let keys: Vec<u64> = self.casts.keys().copied().collect();
        for key in keys {
            if let Some(cast) = self.casts.remove(&key) {
                teardown(cast);
            }
        }
        self.by_id.clear();
        if let Err(e) = self.wayland.flush() {
            tracing::warn!("final flush failed: {}", e);
        }
        tracing::info!("screencast loop stopped");
        result
    }
}

/// Create timers for new casts and apply pending timer requests.
fn sync_timers<'l>(
    loop_: &'l LoopRef,
    casts: &BTreeMap<u64, ActiveCast>,
    timers: &mut HashMap<u64, TimerSource<'l>>,
) {
    timers.retain(|key, _| casts.contains_key(key));

    for (key, cast) in casts {
        let timer = timers.entry(*key).or_insert_with(|| {
            let cell: Weak<CastCell> = Rc::downgrade(&cast.cell);
            loop_.add_timer(move |_| {
                if let Some(cell) = cell.upgrade() {
                    cell.post(SessionEvent::TimerFired);
                }
            })
        });

        let request = match cast.cell.session.try_borrow_mut() {
            Ok(mut session) => session.take_timer_request(),
            Err(_) => None,
        };
        let Some(request) = request else {
            continue;
        };
        if let TimerRequest::Arm(delay) = request {
            tracing::trace!("cast {} next capture in {:?}", cast.cast_id, delay);
        }
        let fallback = request.apply(|delay| {
            timer
                .update_timer(delay, None)
                .into_result()
                .map(|_| ())
        });
        if let Some(event) = fallback {
            cast.cell.post(event);
        }
    }
}

fn teardown(cast: ActiveCast) {
    let ActiveCast {
        cast_id,
        cell,
        stream,
        listener,
    } = cast;

    cell.pending.borrow_mut().clear();
    match cell.session.try_borrow_mut() {
        Ok(mut session) => {
            for id in cell.removed.borrow_mut().drain(..) {
                session.stream_mut().backend_mut().forget(id);
            }
            session.handle(SessionEvent::Quit);
            session.shutdown();
        }
        Err(_) => tracing::error!("cast {} is busy during teardown", cast_id),
    }
    drop(listener);
    if let Err(e) = stream.disconnect() {
        tracing::warn!("failed to disconnect stream of {}: {}", cast_id, e);
    }
    tracing::info!("cast {} stopped", cast_id);
}

#[cfg(feature = "gbm")]
fn open_gpu(config: &ScreencastConfig) -> Option<Rc<dyn GpuDevice>> {
    if config.disable_dmabuf {
        return None;
    }
    match crate::gpu::GbmDevice::open(std::path::Path::new(&config.render_node)) {
        Ok(device) => Some(Rc::new(device)),
        Err(e) => {
            tracing::warn!("dmabuf unavailable: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "gbm"))]
fn open_gpu(_config: &ScreencastConfig) -> Option<Rc<dyn GpuDevice>> {
    tracing::info!("built without gbm, streaming through shared memory");
    None
}

impl CastLauncher for Screencaster {
    fn start_cast(
        &mut self,
        cast_id: &str,
        target: &CaptureTarget,
        output: &OutputInfo,
    ) -> Result<u32, CastError> {
        let key = self.next_key;
        self.next_key += 1;

        let capture = self.wayland.capture_for(key, target)?;
        let stream = Stream::new(
            &self.core,
            &format!("wlcast-stream-{}", cast_id),
            properties! {
                *pipewire::keys::MEDIA_CLASS => "Video/Source",
            },
        )
        .map_err(|e| pw_err("failed to create stream", e))?;
        let stream = Rc::new(stream);

        let allocator = BufferAllocator::new(
            Box::new(PosixShm::new("wlcast")),
            self.gpu.clone(),
            AllocatorOptions {
                force_linear: self.config.force_mod_linear,
                max_shm_bytes: self.config.max_shm_bytes,
            },
        );
        let session = CaptureSession::new(
            cast_id,
            *target,
            capture,
            PwStreamBackend::new(stream.clone()),
            allocator,
            self.negotiator(output),
            self.config.fps_cap(),
        )
        .with_transform(output.transform);

        self.casts.insert(
            key,
            ActiveCast {
                cast_id: cast_id.to_string(),
                cell: Rc::new(CastCell::new(session)),
                stream,
                listener: None,
            },
        );
        self.by_id.insert(cast_id.to_string(), key);

        let started = self.bootstrap(key).and_then(|_| self.connect_stream(key));
        match started {
            Ok(node_id) => {
                tracing::info!("cast {} streaming on node {}", cast_id, node_id);
                Ok(node_id)
            }
            Err(e) => {
                self.stop_cast(cast_id);
                Err(e)
            }
        }
    }

    fn stop_cast(&mut self, cast_id: &str) {
        let Some(key) = self.by_id.remove(cast_id) else {
            return;
        };
        if let Some(cast) = self.casts.remove(&key) {
            teardown(cast);
        }
        if let Err(e) = self.wayland.flush() {
            tracing::warn!("flush after stopping {} failed: {}", cast_id, e);
        }
    }
}
