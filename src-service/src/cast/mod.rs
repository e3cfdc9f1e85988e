//! Capture-to-stream pipeline.
//!
//! Platform glue (Wayland, GBM, PipeWire) plugs into the traits defined here:
//! [`CaptureBackend`] for the compositor, [`GpuDevice`] for buffer allocation
//! and [`StreamBackend`] for the consumer side.

pub mod buffer;
pub mod damage;
pub mod error;
pub mod format;
pub mod fps;
pub mod negotiate;
pub mod session;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{
    AllocatorOptions, BufferAllocator, BufferDescriptor, BufferImporter, BufferType, GpuBufferObject,
    GpuDevice, ManagedBuffer, PlaneInfo, PosixShm, ShmFactory,
};
pub use damage::{DamageTracker, Rect};
pub use error::CastError;
pub use format::PixelFormat;
pub use fps::FpsLimiter;
pub use negotiate::{
    FormatNegotiator, FormatProposal, NegotiatedFormat, NegotiationConfig, ParamsUpdate,
    StreamFormat,
};
pub use session::{
    CaptureBackend, CaptureEvent, CaptureSession, CaptureTarget, FrameState, OutputId,
    SessionEvent, StreamEvent, TimerRequest,
};
pub use stream::{FrameMeta, PoolBufferSetup, PoolId, StreamBackend, StreamEndpoint, StreamState};
