//! wlcast Common Library
//!
//! Configuration and portal-facing types shared between the screencast service
//! and its front-ends.

pub mod config;
pub mod types;

pub use config::{AppConfig, ChooserType, ScreencastConfig};
pub use types::*;
