//! Per-output capture session.
//!
//! A session turns "the consumer wants a frame" into one compositor capture
//! and hands the result to the stream. All input arrives through
//! [`CaptureSession::handle`]; the event loop driving it only routes events and
//! arms the deferred-capture timer the session asks for.
//!
//! Frame states run `Idle -> Started -> {Succeeded, Failed,
//! NeedsRenegotiation} -> Idle`. At most one capture is in flight.

use std::time::Duration;

use tracing::Span;

use super::buffer::{BufferAllocator, BufferDescriptor, BufferImporter, BufferType};
use super::damage::{DamageTracker, Rect};
use super::error::CastError;
use super::fps::FpsLimiter;
use super::negotiate::{FormatNegotiator, ParamsUpdate, StreamFormat};
use super::stream::{PoolBufferSetup, PoolId, StreamBackend, StreamEndpoint, StreamState};

/// Compositor output handle (the `wl_output` global name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTarget {
    pub output: OutputId,
    pub with_cursor: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Started,
    Succeeded,
    Failed,
    NeedsRenegotiation,
}

/// Events of one compositor capture frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Shared-memory constraints; `format` is a DRM fourcc code
    Buffer {
        format: u32,
        width: u32,
        height: u32,
        stride: u32,
    },
    /// GPU-shared constraints
    LinuxDmabuf { format: u32, width: u32, height: u32 },
    /// All constraints reported
    BufferDone,
    Flags { y_invert: bool },
    Damage(Rect),
    Ready { tv_sec: u64, tv_nsec: u32 },
    Failed,
    /// The compositor refused a dmabuf import after accepting the request
    ImportRejected,
}

/// Events from the streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StateChanged {
        state: StreamState,
        node_id: Option<u32>,
    },
    FormatChanged(StreamFormat),
    BufferAdded(PoolId),
    BufferRemoved(PoolId),
    /// The consumer can take another frame
    ProcessReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Capture(CaptureEvent),
    Stream(StreamEvent),
    /// The deferred-capture timer fired
    TimerFired,
    Quit,
}

/// Request for the driver's deferred-capture timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Arm(Duration),
    Cancel,
}

impl TimerRequest {
    /// Apply the request through `update` (`Some` arms, `None` disarms).
    ///
    /// When arming fails the capture cannot wait for the timer; the returned
    /// event must be delivered right away instead.
    pub fn apply<E: std::fmt::Display>(
        self,
        update: impl FnOnce(Option<Duration>) -> Result<(), E>,
    ) -> Option<SessionEvent> {
        match self {
            TimerRequest::Arm(delay) => match update(Some(delay)) {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!("failed to arm capture timer for {:?}: {}", delay, e);
                    Some(SessionEvent::TimerFired)
                }
            },
            TimerRequest::Cancel => {
                if let Err(e) = update(None) {
                    tracing::error!("failed to cancel capture timer: {}", e);
                }
                None
            }
        }
    }
}

/// Compositor capture protocol.
pub trait CaptureBackend: BufferImporter {
    /// Ask the compositor for one frame of `target`.
    fn capture_output(&mut self, target: &CaptureTarget) -> Result<(), CastError>;
    /// Copy the current frame into `buffer`.
    fn copy(&mut self, buffer: &Self::Buffer) -> Result<(), CastError>;
    /// Drop the current frame object, if any.
    fn discard_frame(&mut self);
}

/// The frame currently being captured.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    pub buffer: Option<PoolId>,
    pub y_invert: bool,
    pub transform: u32,
    pub damage: DamageTracker,
    pub corrupted: bool,
    pub timestamp: Option<(u64, u32)>,
}

impl PendingFrame {
    pub fn new(buffer: Option<PoolId>) -> Self {
        Self {
            buffer,
            y_invert: false,
            transform: 0,
            damage: DamageTracker::new(),
            corrupted: false,
            timestamp: None,
        }
    }

    /// Forget what the previous capture reported, keeping the buffer.
    fn reset_capture(&mut self) {
        self.y_invert = false;
        self.damage.clear();
        self.corrupted = false;
        self.timestamp = None;
    }

    /// Y-flipped frames are not flipped back, only flagged.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted || self.y_invert
    }

    pub fn pts_ns(&self) -> i64 {
        match self.timestamp {
            Some((sec, nsec)) => (sec as i64)
                .saturating_mul(1_000_000_000)
                .saturating_add(nsec as i64),
            None => 0,
        }
    }
}

pub struct CaptureSession<C: CaptureBackend, S: StreamBackend> {
    cast_id: String,
    target: CaptureTarget,
    transform: u32,
    capture: C,
    stream: StreamEndpoint<S, C::Buffer>,
    allocator: BufferAllocator,
    negotiator: FormatNegotiator,
    fps: FpsLimiter,
    max_fps: Option<f64>,
    state: FrameState,
    frame: Option<PendingFrame>,
    initialized: bool,
    quit: bool,
    err: bool,
    timer: Option<TimerRequest>,
    span: Span,
}

impl<C: CaptureBackend, S: StreamBackend> CaptureSession<C, S> {
    pub fn new(
        cast_id: impl Into<String>,
        target: CaptureTarget,
        capture: C,
        stream: S,
        allocator: BufferAllocator,
        negotiator: FormatNegotiator,
        max_fps: Option<f64>,
    ) -> Self {
        let cast_id = cast_id.into();
        let span = tracing::info_span!("screencast", cast_id = %cast_id);
        Self {
            cast_id,
            target,
            transform: 0,
            capture,
            stream: StreamEndpoint::new(stream),
            allocator,
            negotiator,
            fps: FpsLimiter::new(),
            max_fps,
            state: FrameState::Idle,
            frame: None,
            initialized: false,
            quit: false,
            err: false,
            timer: None,
            span,
        }
    }

    /// Output transform to report in frame metadata.
    pub fn with_transform(mut self, transform: u32) -> Self {
        self.transform = transform;
        self
    }

    pub fn cast_id(&self) -> &str {
        &self.cast_id
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    pub fn pending_frame(&self) -> Option<&PendingFrame> {
        self.frame.as_ref()
    }

    /// Whether the compositor's buffer constraints are known.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_errored(&self) -> bool {
        self.err
    }

    pub fn is_quitting(&self) -> bool {
        self.quit
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    pub fn stream(&self) -> &StreamEndpoint<S, C::Buffer> {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut StreamEndpoint<S, C::Buffer> {
        &mut self.stream
    }

    pub fn negotiator(&self) -> &FormatNegotiator {
        &self.negotiator
    }

    pub fn negotiator_mut(&mut self) -> &mut FormatNegotiator {
        &mut self.negotiator
    }

    /// Format list to connect the stream with.
    pub fn initial_params(&self) -> ParamsUpdate {
        ParamsUpdate::Formats(self.negotiator.proposals())
    }

    /// Memory description of a pool slot after `BufferAdded`.
    pub fn buffer_setup(&self, id: PoolId) -> Option<PoolBufferSetup> {
        self.stream.buffer_setup(id)
    }

    /// Timer change requested since the last call.
    pub fn take_timer_request(&mut self) -> Option<TimerRequest> {
        self.timer.take()
    }

    /// Capture once to learn the compositor's buffer constraints.
    pub fn start(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::info!(
            "starting capture of output {} (cursor: {})",
            self.target.output.0,
            self.target.with_cursor
        );
        self.request_capture();
    }

    pub fn handle(&mut self, event: SessionEvent) {
        let span = self.span.clone();
        let _enter = span.enter();

        match event {
            SessionEvent::Capture(event) => self.on_capture_event(event),
            SessionEvent::Stream(event) => self.on_stream_event(event),
            SessionEvent::TimerFired => self.request_capture(),
            SessionEvent::Quit => {
                tracing::info!("stopping");
                self.quit = true;
                self.timer = Some(TimerRequest::Cancel);
            }
        }
    }

    /// Issue a capture request if the session is idle and the stream consumes frames.
    pub fn request_capture(&mut self) {
        if self.quit || self.err {
            return;
        }
        if self.state != FrameState::Idle {
            tracing::debug!("capture already in flight ({:?})", self.state);
            return;
        }
        if self.initialized && !self.stream.is_streaming() {
            tracing::trace!("stream not consuming, not capturing");
            return;
        }

        self.state = FrameState::Started;
        self.fps.mark_cycle_start();
        let transform = self.transform;
        let frame = self.frame.get_or_insert_with(|| PendingFrame::new(None));
        frame.reset_capture();
        frame.transform = transform;

        if let Err(e) = self.capture.capture_output(&self.target) {
            tracing::error!("capture request failed: {}", e);
            self.state = FrameState::Idle;
            self.err = true;
        }
    }

    /// Release every pooled buffer.
    pub fn shutdown(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        self.quit = true;
        self.capture.discard_frame();
        self.frame = None;
        let buffers = self.stream.drain_buffers();
        tracing::debug!("releasing {} buffer(s)", buffers.len());
        for buffer in buffers {
            buffer.release(&mut self.capture);
        }
    }

    fn frame_mut(&mut self) -> &mut PendingFrame {
        self.frame.get_or_insert_with(|| PendingFrame::new(None))
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Buffer {
                format,
                width,
                height,
                stride,
            } => {
                tracing::trace!("shm constraints {:#010x} {}x{} stride {}", format, width, height, stride);
                self.negotiator.update_descriptor(
                    BufferType::Shm,
                    BufferDescriptor::shm(format, width, height, stride),
                );
            }
            CaptureEvent::LinuxDmabuf {
                format,
                width,
                height,
            } => {
                tracing::trace!("dmabuf constraints {:#010x} {}x{}", format, width, height);
                self.negotiator.update_descriptor(
                    BufferType::Dmabuf,
                    BufferDescriptor::dmabuf(format, width, height),
                );
            }
            CaptureEvent::Flags { y_invert } => self.frame_mut().y_invert = y_invert,
            CaptureEvent::Damage(rect) => self.frame_mut().damage.add(rect),
            CaptureEvent::BufferDone => self.on_buffer_done(),
            CaptureEvent::Ready { tv_sec, tv_nsec } => {
                if self.state != FrameState::Started {
                    tracing::debug!("ignoring ready event in state {:?}", self.state);
                    return;
                }
                self.frame_mut().timestamp = Some((tv_sec, tv_nsec));
                self.state = FrameState::Succeeded;
                self.finalize();
            }
            CaptureEvent::Failed => {
                if self.state != FrameState::Started {
                    tracing::debug!("ignoring failed event in state {:?}", self.state);
                    return;
                }
                tracing::warn!("compositor failed to capture frame");
                self.state = FrameState::Failed;
                self.finalize();
            }
            CaptureEvent::ImportRejected => {
                if self.negotiator.dmabuf_disabled() {
                    tracing::debug!("dmabuf import rejected after fallback");
                    return;
                }
                tracing::warn!("compositor rejected a dmabuf buffer");
                self.fall_back_to_shm();
            }
        }
    }

    fn on_buffer_done(&mut self) {
        if self.state != FrameState::Started {
            tracing::debug!("ignoring buffer_done in state {:?}", self.state);
            return;
        }

        if !self.initialized {
            self.initialized = true;
            tracing::info!(
                "compositor constraints: shm {:?}, dmabuf {:?}",
                self.negotiator.descriptor(BufferType::Shm),
                self.negotiator.descriptor(BufferType::Dmabuf)
            );
            self.capture.discard_frame();
            self.state = FrameState::Idle;
            return;
        }

        if !self.stream.is_streaming() {
            self.capture.discard_frame();
            self.state = FrameState::Idle;
            return;
        }

        let Some(id) = self.frame.as_ref().and_then(|f| f.buffer) else {
            tracing::warn!("no stream buffer to copy into");
            self.state = FrameState::Failed;
            self.finalize();
            return;
        };
        let Some(buffer) = self.stream.buffer(id) else {
            tracing::warn!("stream buffer {:?} has no backing", id);
            self.state = FrameState::Failed;
            self.finalize();
            return;
        };

        let reported = self.negotiator.descriptor(buffer.buffer_type());
        if !buffer.descriptor().is_compatible_with(reported) {
            tracing::info!(
                "buffer {:?} no longer matches compositor constraints {:?}, renegotiating",
                buffer.descriptor(),
                reported
            );
            self.state = FrameState::NeedsRenegotiation;
            self.finalize();
            return;
        }

        let result = match buffer.handle() {
            Some(handle) => self.capture.copy(handle),
            None => Err(CastError::CaptureFailed("buffer was not imported".into())),
        };
        if let Err(e) = result {
            tracing::warn!("copy request failed: {}", e);
            self.state = FrameState::Failed;
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        self.capture.discard_frame();
        let state = std::mem::replace(&mut self.state, FrameState::Idle);

        if self.quit || self.err {
            return;
        }
        if !self.stream.is_streaming() {
            return;
        }

        match state {
            FrameState::NeedsRenegotiation => {
                let update = ParamsUpdate::Formats(self.negotiator.proposals());
                if let Err(e) = self.stream.publish(&update) {
                    tracing::error!("failed to republish formats: {}", e);
                }
            }
            FrameState::Succeeded | FrameState::Failed => {
                let Some(mut frame) = self.frame.take() else {
                    return;
                };
                if state == FrameState::Failed {
                    frame.corrupted = true;
                }
                if let Err(e) = self.stream.enqueue(frame) {
                    tracing::error!("failed to queue frame: {}", e);
                }
            }
            FrameState::Idle | FrameState::Started => {}
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StateChanged { state, node_id } => self.on_state_changed(state, node_id),
            StreamEvent::FormatChanged(format) => self.on_format_changed(format),
            StreamEvent::BufferAdded(id) => self.on_buffer_added(id),
            StreamEvent::BufferRemoved(id) => {
                if let Some(buffer) = self.stream.remove_buffer(id) {
                    buffer.release(&mut self.capture);
                }
                if let Some(frame) = self.frame.as_mut() {
                    if frame.buffer == Some(id) {
                        frame.buffer = None;
                    }
                }
            }
            StreamEvent::ProcessReady => self.on_process(),
        }
    }

    fn on_state_changed(&mut self, state: StreamState, node_id: Option<u32>) {
        if let Some(node_id) = node_id {
            if self.stream.node_id() != Some(node_id) {
                tracing::info!("stream node id {}", node_id);
            }
            self.stream.set_node_id(node_id);
        }

        let old = self.stream.set_state(state.clone());
        tracing::debug!("stream state {:?} -> {:?}", old, state);

        match state {
            StreamState::Streaming => tracing::info!("stream started"),
            StreamState::Paused if old == StreamState::Streaming => {
                // Hand the held slot back so the consumer is not starved
                if let Some(mut frame) = self.frame.take() {
                    if frame.buffer.is_some() {
                        frame.corrupted |= self.state != FrameState::Succeeded;
                        if let Err(e) = self.stream.enqueue(frame) {
                            tracing::warn!("failed to return buffer on pause: {}", e);
                        }
                    }
                }
            }
            StreamState::Error(msg) => {
                tracing::error!("stream error: {}", msg);
                self.err = true;
                self.timer = Some(TimerRequest::Cancel);
            }
            _ => {}
        }
    }

    fn on_format_changed(&mut self, format: StreamFormat) {
        let update = match self.negotiator.on_stream_format(&format) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!("cannot use consumer format: {}", e);
                self.negotiator.disable_dmabuf();
                ParamsUpdate::Formats(self.negotiator.proposals())
            }
        };
        if let Err(e) = self.stream.publish(&update) {
            tracing::error!("failed to publish params: {}", e);
        }
    }

    fn on_buffer_added(&mut self, id: PoolId) {
        let Some(negotiated) = self.negotiator.negotiated().copied() else {
            tracing::warn!("pool buffer {:?} added before format negotiation", id);
            return;
        };
        let desc = *self.negotiator.descriptor(negotiated.buffer_type);

        match self.allocator.allocate(
            &mut self.capture,
            negotiated.buffer_type,
            &desc,
            negotiated.modifier,
        ) {
            Ok(buffer) => self.stream.insert_buffer(id, buffer),
            Err(e) if e.is_recoverable() && negotiated.buffer_type == BufferType::Dmabuf => {
                tracing::warn!("dmabuf allocation failed: {}", e);
                self.fall_back_to_shm();
            }
            Err(e) => {
                tracing::error!("buffer allocation failed: {}", e);
                self.err = true;
            }
        }
    }

    /// Stop offering dmabuf for the rest of the session and republish.
    fn fall_back_to_shm(&mut self) {
        self.negotiator.disable_dmabuf();
        let update = ParamsUpdate::Formats(self.negotiator.proposals());
        if let Err(e) = self.stream.publish(&update) {
            tracing::error!("failed to republish formats: {}", e);
        }
    }

    fn on_process(&mut self) {
        if !self.stream.is_streaming() {
            tracing::trace!("process while not streaming");
            return;
        }
        if self.frame.as_ref().is_some_and(|f| f.buffer.is_some()) {
            tracing::trace!("buffer already exported");
            return;
        }

        let Some(id) = self.stream.dequeue() else {
            tracing::warn!("out of buffers");
            return;
        };
        self.frame_mut().buffer = Some(id);

        if self.stream.sequence() > 0 {
            let delay = self.fps.measure_and_delay(self.target_fps());
            if !delay.is_zero() {
                self.timer = Some(TimerRequest::Arm(delay));
                return;
            }
        }
        self.request_capture();
    }

    fn target_fps(&self) -> f64 {
        let negotiated = self.negotiator.framerate() as f64;
        match self.max_fps {
            Some(cap) if negotiated > 0.0 => negotiated.min(cap),
            Some(cap) => cap,
            None => negotiated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::buffer::{AllocatorOptions, GpuDevice};
    use crate::cast::negotiate::{ModifierOffer, NegotiationConfig};
    use crate::cast::format::PixelFormat;
    use crate::cast::testing::{vendor_modifier, FakeCapture, FakeGpu, FakeStream, MemfdShm, XRGB8888};
    use drm_fourcc::DrmModifier;
    use std::rc::Rc;

    const TARGET: CaptureTarget = CaptureTarget {
        output: OutputId(42),
        with_cursor: true,
    };

    type Session = CaptureSession<FakeCapture, FakeStream>;

    #[test]
    fn test_timer_request_arms_with_delay() {
        let mut seen = None;
        let event = TimerRequest::Arm(Duration::from_millis(16)).apply(|d| {
            seen = Some(d);
            Ok::<(), String>(())
        });
        assert_eq!(event, None);
        assert_eq!(seen, Some(Some(Duration::from_millis(16))));
    }

    #[test]
    fn test_failed_arm_captures_immediately() {
        let event = TimerRequest::Arm(Duration::from_millis(16))
            .apply(|_| Err::<(), _>("timerfd gone"));
        assert_eq!(event, Some(SessionEvent::TimerFired));

        let event = TimerRequest::Cancel.apply(|_| Err::<(), _>("timerfd gone"));
        assert_eq!(event, None);
    }

    fn session_with(gpu: Option<Rc<FakeGpu>>) -> Session {
        let gpu = gpu.map(|g| g as Rc<dyn GpuDevice>);
        let allocator = BufferAllocator::new(
            Box::new(MemfdShm),
            gpu.clone(),
            AllocatorOptions::default(),
        );
        let negotiator = FormatNegotiator::new(gpu, NegotiationConfig::default());
        CaptureSession::new(
            "test-cast",
            TARGET,
            FakeCapture::default(),
            FakeStream::with_slots(&[1, 2], 4),
            allocator,
            negotiator,
            None,
        )
    }

    fn constraints(width: u32, height: u32) -> Vec<SessionEvent> {
        vec![
            SessionEvent::Capture(CaptureEvent::Buffer {
                format: XRGB8888,
                width,
                height,
                stride: width * 4,
            }),
            SessionEvent::Capture(CaptureEvent::LinuxDmabuf {
                format: XRGB8888,
                width,
                height,
            }),
            SessionEvent::Capture(CaptureEvent::BufferDone),
        ]
    }

    fn feed(session: &mut Session, events: Vec<SessionEvent>) {
        for event in events {
            session.handle(event);
        }
    }

    fn shm_format(framerate: u32) -> StreamFormat {
        StreamFormat {
            format: PixelFormat::Bgrx,
            width: 64,
            height: 32,
            max_framerate: (framerate, 1),
            modifier: None,
        }
    }

    fn streaming() -> SessionEvent {
        SessionEvent::Stream(StreamEvent::StateChanged {
            state: StreamState::Streaming,
            node_id: Some(77),
        })
    }

    /// Bootstrapped, shm negotiated, two pool buffers, streaming.
    fn streaming_session(framerate: u32) -> Session {
        let mut s = session_with(None);
        s.start();
        feed(&mut s, constraints(64, 32));
        feed(
            &mut s,
            vec![
                SessionEvent::Stream(StreamEvent::FormatChanged(shm_format(framerate))),
                SessionEvent::Stream(StreamEvent::BufferAdded(PoolId(1))),
                SessionEvent::Stream(StreamEvent::BufferAdded(PoolId(2))),
                streaming(),
            ],
        );
        s
    }

    fn ready() -> SessionEvent {
        SessionEvent::Capture(CaptureEvent::Ready {
            tv_sec: 12,
            tv_nsec: 500,
        })
    }

    #[test]
    fn test_bootstrap_learns_constraints_without_copy() {
        let mut s = session_with(None);
        s.start();
        assert_eq!(s.frame_state(), FrameState::Started);
        feed(&mut s, constraints(1920, 1080));

        assert!(s.is_initialized());
        assert_eq!(s.frame_state(), FrameState::Idle);
        assert_eq!(s.capture().captures, 1);
        assert!(s.capture().copies.is_empty());
        assert_eq!(s.capture().discards, 1);
        assert_eq!(
            s.negotiator().descriptor(BufferType::Shm),
            &BufferDescriptor::shm(XRGB8888, 1920, 1080, 7680)
        );
        let ParamsUpdate::Formats(formats) = s.initial_params() else {
            panic!("expected formats");
        };
        assert_eq!(formats.len(), 1);
    }

    #[test]
    fn test_no_capture_before_streaming() {
        let mut s = session_with(None);
        s.start();
        feed(&mut s, constraints(64, 32));
        s.request_capture();
        assert_eq!(s.capture().captures, 1);
    }

    #[test]
    fn test_double_request_issues_one_capture() {
        let mut s = streaming_session(60);
        let before = s.capture().captures;
        s.request_capture();
        s.request_capture();
        assert_eq!(s.capture().captures, before + 1);
        assert_eq!(s.frame_state(), FrameState::Started);
    }

    #[test]
    fn test_full_cycle_queues_frame() {
        let mut s = streaming_session(60);
        assert_eq!(s.stream().node_id(), Some(77));
        assert_eq!(s.stream().pool_len(), 2);

        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        assert_eq!(s.frame_state(), FrameState::Started);
        let held = s.pending_frame().and_then(|f| f.buffer).unwrap();

        feed(&mut s, constraints(64, 32));
        assert_eq!(s.capture().copies.len(), 1);
        s.handle(SessionEvent::Capture(CaptureEvent::Damage(Rect::new(0, 0, 8, 8))));
        s.handle(ready());

        assert_eq!(s.frame_state(), FrameState::Idle);
        assert!(s.pending_frame().is_none());
        let queued = &s.stream().backend().queued;
        assert_eq!(queued.len(), 1);
        let (id, meta) = &queued[0];
        assert_eq!(*id, held);
        assert_eq!(meta.seq, 0);
        assert!(!meta.corrupted);
        assert_eq!(meta.pts_ns, 12_000_000_500);
        assert_eq!(meta.damage, vec![Rect::new(0, 0, 8, 8)]);
    }

    #[test]
    fn test_pacing_defers_next_capture() {
        // 1 fps leaves plenty of room before the next frame is due
        let mut s = streaming_session(1);
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        feed(&mut s, constraints(64, 32));
        s.handle(ready());
        let captures = s.capture().captures;

        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        match s.take_timer_request() {
            Some(TimerRequest::Arm(delay)) => {
                assert!(delay > Duration::from_millis(500) && delay <= Duration::from_secs(1))
            }
            other => panic!("expected armed timer, got {:?}", other),
        }
        assert_eq!(s.capture().captures, captures);

        s.handle(SessionEvent::TimerFired);
        assert_eq!(s.capture().captures, captures + 1);
    }

    #[test]
    fn test_failed_and_flipped_frames_are_corrupted_without_seq_gaps() {
        let mut s = streaming_session(60);

        // Succeeded
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        feed(&mut s, constraints(64, 32));
        s.handle(ready());
        s.stream_mut().backend_mut().release_all();

        // Failed. The timer either captures or finds the capture already started.
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        s.handle(SessionEvent::TimerFired);
        feed(&mut s, constraints(64, 32));
        s.handle(SessionEvent::Capture(CaptureEvent::Failed));
        s.stream_mut().backend_mut().release_all();

        // Y-inverted
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        s.handle(SessionEvent::TimerFired);
        feed(&mut s, constraints(64, 32));
        s.handle(SessionEvent::Capture(CaptureEvent::Flags { y_invert: true }));
        s.handle(ready());

        let metas: Vec<(u64, bool)> = s
            .stream()
            .backend()
            .queued
            .iter()
            .map(|(_, m)| (m.seq, m.corrupted))
            .collect();
        assert_eq!(metas, vec![(0, false), (1, true), (2, true)]);
        assert!(!s.is_errored());
    }

    #[test]
    fn test_size_change_triggers_renegotiation() {
        let mut s = streaming_session(60);
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        let published = s.stream().backend().updates.len();

        feed(&mut s, constraints(128, 64));

        assert_eq!(s.frame_state(), FrameState::Idle);
        assert!(s.capture().copies.is_empty());
        assert!(s.stream().backend().queued.is_empty());
        let updates = &s.stream().backend().updates;
        assert_eq!(updates.len(), published + 1);
        let ParamsUpdate::Formats(formats) = updates.last().unwrap() else {
            panic!("expected formats");
        };
        assert_eq!(formats[0].width, 128);
        // The slot is kept until the transport replaces the pool
        assert!(s.pending_frame().unwrap().buffer.is_some());
    }

    #[test]
    fn test_removed_buffer_is_released_and_detached() {
        let mut s = streaming_session(60);
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        let held = s.pending_frame().and_then(|f| f.buffer).unwrap();

        s.handle(SessionEvent::Stream(StreamEvent::BufferRemoved(held)));
        assert_eq!(s.capture().destroyed, 1);
        assert!(s.pending_frame().unwrap().buffer.is_none());

        // Nothing to copy into
        feed(&mut s, constraints(64, 32));
        assert!(s.capture().copies.is_empty());
        assert!(s.stream().backend().queued.is_empty());
    }

    #[test]
    fn test_pause_returns_held_buffer() {
        let mut s = streaming_session(60);
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        s.handle(SessionEvent::Stream(StreamEvent::StateChanged {
            state: StreamState::Paused,
            node_id: None,
        }));

        let queued = &s.stream().backend().queued;
        assert_eq!(queued.len(), 1);
        assert!(queued[0].1.corrupted);

        // The in-flight capture completes without touching the stream
        feed(&mut s, constraints(64, 32));
        assert_eq!(s.frame_state(), FrameState::Idle);
        assert_eq!(s.stream().backend().queued.len(), 1);
    }

    #[test]
    fn test_quit_cancels_timer_and_stops_capturing() {
        let mut s = streaming_session(60);
        s.handle(SessionEvent::Quit);
        assert_eq!(s.take_timer_request(), Some(TimerRequest::Cancel));
        let captures = s.capture().captures;
        s.handle(SessionEvent::Stream(StreamEvent::ProcessReady));
        assert_eq!(s.capture().captures, captures);
    }

    #[test]
    fn test_stream_error_marks_session() {
        let mut s = streaming_session(60);
        s.handle(SessionEvent::Stream(StreamEvent::StateChanged {
            state: StreamState::Error("connection reset".into()),
            node_id: None,
        }));
        assert!(s.is_errored());
        s.request_capture();
        assert_eq!(s.frame_state(), FrameState::Idle);
    }

    #[test]
    fn test_gpu_exhaustion_degrades_to_shm_for_good() {
        let gpu = Rc::new(FakeGpu::new(Vec::new(), 1));
        let mut s = session_with(Some(gpu.clone()));
        s.negotiator_mut()
            .set_compositor_modifiers(vec![(XRGB8888, DrmModifier::Invalid), (XRGB8888, vendor_modifier(2))]);
        s.start();
        feed(&mut s, constraints(64, 32));

        let ParamsUpdate::Formats(initial) = s.initial_params() else {
            panic!("expected formats");
        };
        assert_eq!(initial[0].buffer_type, BufferType::Dmabuf);

        let mut dmabuf = shm_format(60);
        dmabuf.modifier = Some(ModifierOffer::Unfixated(vec![DrmModifier::Invalid]));
        s.handle(SessionEvent::Stream(StreamEvent::FormatChanged(dmabuf.clone())));
        assert!(s.negotiator().dmabuf_disabled());
        let attempts = gpu.allocation_attempts();

        // The consumer falls back to shm and streaming goes on
        feed(
            &mut s,
            vec![
                SessionEvent::Stream(StreamEvent::FormatChanged(dmabuf)),
                SessionEvent::Stream(StreamEvent::FormatChanged(shm_format(60))),
                SessionEvent::Stream(StreamEvent::BufferAdded(PoolId(1))),
                streaming(),
                SessionEvent::Stream(StreamEvent::ProcessReady),
            ],
        );
        feed(&mut s, constraints(64, 32));
        s.handle(ready());

        assert_eq!(gpu.allocation_attempts(), attempts);
        assert_eq!(s.stream().backend().queued.len(), 1);
        let ParamsUpdate::Formats(latest) = s.initial_params() else {
            panic!("expected formats");
        };
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].buffer_type, BufferType::Shm);
    }

    #[test]
    fn test_dmabuf_buffer_allocation_failure_republishes_shm() {
        let modifier = vendor_modifier(6);
        let gpu = Rc::new(FakeGpu::new(vec![modifier], 1));
        let mut s = session_with(Some(gpu.clone()));
        s.negotiator_mut()
            .set_compositor_modifiers(vec![(XRGB8888, modifier)]);
        s.start();
        feed(&mut s, constraints(64, 32));

        let mut fixed = shm_format(60);
        fixed.modifier = Some(ModifierOffer::Fixed(modifier));
        s.handle(SessionEvent::Stream(StreamEvent::FormatChanged(fixed)));
        gpu.fail_everything();
        s.handle(SessionEvent::Stream(StreamEvent::BufferAdded(PoolId(1))));

        assert!(!s.is_errored());
        assert!(s.negotiator().dmabuf_disabled());
        assert_eq!(s.stream().pool_len(), 0);
        let ParamsUpdate::Formats(formats) = s.stream().backend().updates.last().unwrap() else {
            panic!("expected formats");
        };
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].buffer_type, BufferType::Shm);
    }

    #[test]
    fn test_rejected_dmabuf_import_falls_back_to_shm() {
        let modifier = vendor_modifier(6);
        let gpu = Rc::new(FakeGpu::new(vec![modifier], 1));
        let mut s = session_with(Some(gpu));
        s.negotiator_mut()
            .set_compositor_modifiers(vec![(XRGB8888, modifier)]);
        s.start();
        feed(&mut s, constraints(64, 32));

        let mut fixed = shm_format(60);
        fixed.modifier = Some(ModifierOffer::Fixed(modifier));
        s.handle(SessionEvent::Stream(StreamEvent::FormatChanged(fixed)));
        s.handle(SessionEvent::Stream(StreamEvent::BufferAdded(PoolId(1))));
        assert_eq!(s.stream().pool_len(), 1);

        s.handle(SessionEvent::Capture(CaptureEvent::ImportRejected));
        assert!(!s.is_errored());
        assert!(s.negotiator().dmabuf_disabled());
        let updates = s.stream().backend().updates.len();
        let ParamsUpdate::Formats(formats) = s.stream().backend().updates.last().unwrap() else {
            panic!("expected formats");
        };
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].buffer_type, BufferType::Shm);

        // Later rejections of buffers still in the old pool change nothing
        s.handle(SessionEvent::Capture(CaptureEvent::ImportRejected));
        assert_eq!(s.stream().backend().updates.len(), updates);
    }

    #[test]
    fn test_shutdown_releases_pool() {
        let mut s = streaming_session(60);
        s.shutdown();
        assert_eq!(s.capture().destroyed, 2);
        assert_eq!(s.stream().pool_len(), 0);
        assert!(s.is_quitting());
    }
}
