//! wlcast: stream wlroots screencopy frames to PipeWire.
//!
//! The capture pipeline in [`cast`] is platform-independent and tested with
//! in-crate fakes. [`wayland`], [`gpu`] and [`pw`] bind it to the compositor,
//! libgbm and PipeWire.

pub mod cast;
pub mod chooser;
pub mod hooks;
pub mod portal;

#[cfg(target_os = "linux")]
pub mod wayland;

#[cfg(all(target_os = "linux", feature = "gbm"))]
pub mod gpu;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub mod pw;
