//! ScreenCast portal sessions.
//!
//! Implements the CreateSession / SelectSources / Start / Close flow of the
//! desktop portal without the D-Bus plumbing: a front-end translates method
//! calls into these functions and returns the [`PortalResponse`] codes.

use std::collections::HashMap;

use serde::Serialize;
use wlcast_common::{CursorMode, PersistMode, PortalResponse, SelectSourcesOptions, SourceType};

use crate::cast::{CaptureTarget, CastError};
use crate::chooser::{OutputChooser, OutputInfo};
use crate::hooks::Hooks;

/// Starts and stops the capture pipelines behind portal sessions.
pub trait CastLauncher {
    /// Start capturing `target`; returns the stream node id.
    fn start_cast(
        &mut self,
        cast_id: &str,
        target: &CaptureTarget,
        output: &OutputInfo,
    ) -> Result<u32, CastError>;

    fn stop_cast(&mut self, cast_id: &str);
}

/// What a started session hands back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartResults {
    pub node_id: u32,
    pub source_type: SourceType,
    pub persist_mode: PersistMode,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone)]
struct Selection {
    target: CaptureTarget,
    output: OutputInfo,
    persist_mode: PersistMode,
}

#[derive(Debug, Clone)]
pub struct PortalSession {
    pub handle: String,
    pub app_id: String,
    pub cast_id: Option<String>,
    selection: Option<Selection>,
}

impl PortalSession {
    pub fn is_started(&self) -> bool {
        self.cast_id.is_some()
    }

    pub fn target(&self) -> Option<&CaptureTarget> {
        self.selection.as_ref().map(|s| &s.target)
    }
}

/// Unique id for a cast of `app_id`.
pub fn new_cast_id(app_id: &str) -> String {
    let app = if app_id.is_empty() { "wlcast" } else { app_id };
    format!("{}-{}", app, chrono::Utc::now().timestamp_millis())
}

pub struct Portal {
    sessions: HashMap<String, PortalSession>,
    capture_available: bool,
    hooks: Hooks,
    active_casts: usize,
}

impl Portal {
    /// Source types this portal can capture.
    pub const AVAILABLE_SOURCE_TYPES: u32 = 1;
    /// Cursor modes this portal supports (hidden, embedded).
    pub const AVAILABLE_CURSOR_MODES: u32 = 1 | 2;

    pub fn new(capture_available: bool, hooks: Hooks) -> Self {
        Self {
            sessions: HashMap::new(),
            capture_available,
            hooks,
            active_casts: 0,
        }
    }

    pub fn session(&self, handle: &str) -> Option<&PortalSession> {
        self.sessions.get(handle)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn create_session(&mut self, handle: &str, app_id: &str) -> PortalResponse {
        if !self.capture_available {
            tracing::warn!("compositor has no screencopy support, refusing session");
            return PortalResponse::Cancelled;
        }
        if self.sessions.contains_key(handle) {
            tracing::warn!("session {} already exists", handle);
            return PortalResponse::Cancelled;
        }

        tracing::info!("create session {} for {:?}", handle, app_id);
        self.sessions.insert(
            handle.to_string(),
            PortalSession {
                handle: handle.to_string(),
                app_id: app_id.to_string(),
                cast_id: None,
                selection: None,
            },
        );
        PortalResponse::Success
    }

    pub fn select_sources(
        &mut self,
        handle: &str,
        options: &SelectSourcesOptions,
        outputs: &[OutputInfo],
        chooser: &mut dyn OutputChooser,
    ) -> PortalResponse {
        let Some(session) = self.sessions.get_mut(handle) else {
            tracing::warn!("select sources on unknown session {}", handle);
            return PortalResponse::Cancelled;
        };
        if session.is_started() {
            tracing::warn!("select sources on started session {}", handle);
            return PortalResponse::Cancelled;
        }

        if !SourceType::Monitor.is_in(options.source_mask() & Self::AVAILABLE_SOURCE_TYPES) {
            tracing::warn!("unsupported source types {:#x}", options.source_mask());
            return PortalResponse::Cancelled;
        }
        if options.multiple {
            tracing::debug!("multiple sources requested, selecting one");
        }

        let cursor_mode = options.cursor_mode.unwrap_or_default();
        if cursor_mode.bit() & Self::AVAILABLE_CURSOR_MODES == 0 {
            tracing::warn!("unsupported cursor mode {:?}", cursor_mode);
            return PortalResponse::Cancelled;
        }

        let Some(id) = chooser.choose(outputs) else {
            return PortalResponse::Cancelled;
        };
        let Some(output) = outputs.iter().find(|o| o.id == id) else {
            return PortalResponse::Cancelled;
        };

        tracing::info!("session {} selected output {}", handle, output.name);
        session.selection = Some(Selection {
            target: CaptureTarget {
                output: id,
                with_cursor: cursor_mode == CursorMode::Embedded,
            },
            output: output.clone(),
            persist_mode: options.persist_mode,
        });
        PortalResponse::Success
    }

    pub fn start(
        &mut self,
        handle: &str,
        launcher: &mut dyn CastLauncher,
    ) -> (PortalResponse, Option<StartResults>) {
        let Some(session) = self.sessions.get_mut(handle) else {
            tracing::warn!("start on unknown session {}", handle);
            return (PortalResponse::Cancelled, None);
        };
        if session.is_started() {
            tracing::warn!("session {} already started", handle);
            return (PortalResponse::Cancelled, None);
        }
        let Some(selection) = session.selection.clone() else {
            tracing::warn!("start on session {} without selected source", handle);
            return (PortalResponse::Cancelled, None);
        };

        if self.active_casts == 0 {
            if let Some(Err(e)) = self.hooks.run_before() {
                tracing::warn!("exec_before failed: {}", e);
            }
        }

        let cast_id = new_cast_id(&session.app_id);
        match launcher.start_cast(&cast_id, &selection.target, &selection.output) {
            Ok(node_id) => {
                tracing::info!("session {} streaming as {} on node {}", handle, cast_id, node_id);
                session.cast_id = Some(cast_id);
                self.active_casts += 1;
                let results = StartResults {
                    node_id,
                    source_type: SourceType::Monitor,
                    persist_mode: selection.persist_mode,
                    width: selection.output.width,
                    height: selection.output.height,
                };
                (PortalResponse::Success, Some(results))
            }
            Err(e) => {
                tracing::error!("failed to start cast for session {}: {}", handle, e);
                if self.active_casts == 0 {
                    self.run_after_hook();
                }
                (PortalResponse::Cancelled, None)
            }
        }
    }

    /// Close a session, stopping its cast. Returns whether the session existed.
    pub fn close_session(&mut self, handle: &str, launcher: &mut dyn CastLauncher) -> bool {
        let Some(session) = self.sessions.remove(handle) else {
            return false;
        };
        tracing::info!("close session {}", handle);

        if let Some(cast_id) = session.cast_id {
            launcher.stop_cast(&cast_id);
            self.active_casts = self.active_casts.saturating_sub(1);
            if self.active_casts == 0 {
                self.run_after_hook();
            }
        }
        true
    }

    fn run_after_hook(&self) {
        if let Some(Err(e)) = self.hooks.run_after() {
            tracing::warn!("exec_after failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cast::OutputId;

    #[derive(Default)]
    struct FakeLauncher {
        started: Vec<(String, CaptureTarget)>,
        stopped: Vec<String>,
        fail: bool,
    }

    impl CastLauncher for FakeLauncher {
        fn start_cast(
            &mut self,
            cast_id: &str,
            target: &CaptureTarget,
            _output: &OutputInfo,
        ) -> Result<u32, CastError> {
            if self.fail {
                return Err(CastError::Unsupported("no stream".into()));
            }
            self.started.push((cast_id.to_string(), *target));
            Ok(40 + self.started.len() as u32)
        }

        fn stop_cast(&mut self, cast_id: &str) {
            self.stopped.push(cast_id.to_string());
        }
    }

    struct Pick(Option<OutputId>);

    impl OutputChooser for Pick {
        fn choose(&mut self, _outputs: &[OutputInfo]) -> Option<OutputId> {
            self.0
        }
    }

    fn outputs() -> Vec<OutputInfo> {
        vec![OutputInfo {
            id: OutputId(3),
            name: "DP-1".into(),
            description: "Dell".into(),
            width: 2560,
            height: 1440,
            refresh_mhz: 144_000,
            transform: 0,
        }]
    }

    fn embedded() -> SelectSourcesOptions {
        SelectSourcesOptions {
            cursor_mode: Some(CursorMode::Embedded),
            persist_mode: PersistMode::WhileAppRunning,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_flow() {
        let mut portal = Portal::new(true, Hooks::default());
        let mut launcher = FakeLauncher::default();

        assert_eq!(portal.create_session("/s/1", "org.example.App"), PortalResponse::Success);
        assert_eq!(
            portal.select_sources("/s/1", &embedded(), &outputs(), &mut Pick(Some(OutputId(3)))),
            PortalResponse::Success
        );
        assert_eq!(
            portal.session("/s/1").unwrap().target(),
            Some(&CaptureTarget {
                output: OutputId(3),
                with_cursor: true
            })
        );

        let (response, results) = portal.start("/s/1", &mut launcher);
        assert_eq!(response, PortalResponse::Success);
        let results = results.unwrap();
        assert_eq!(results.node_id, 41);
        assert_eq!(results.persist_mode, PersistMode::WhileAppRunning);
        assert_eq!((results.width, results.height), (2560, 1440));
        assert!(launcher.started[0].0.starts_with("org.example.App-"));

        assert!(portal.close_session("/s/1", &mut launcher));
        assert_eq!(launcher.stopped.len(), 1);
        assert_eq!(portal.session_count(), 0);
        assert!(!portal.close_session("/s/1", &mut launcher));
    }

    #[test]
    fn test_no_capture_support() {
        let mut portal = Portal::new(false, Hooks::default());
        assert_eq!(portal.create_session("/s/1", "app"), PortalResponse::Cancelled);
    }

    #[test]
    fn test_window_sources_refused() {
        let mut portal = Portal::new(true, Hooks::default());
        portal.create_session("/s/1", "app");
        let options = SelectSourcesOptions {
            types: Some(SourceType::Window.bit()),
            ..Default::default()
        };
        assert_eq!(
            portal.select_sources("/s/1", &options, &outputs(), &mut Pick(Some(OutputId(3)))),
            PortalResponse::Cancelled
        );
    }

    #[test]
    fn test_metadata_cursor_refused() {
        let mut portal = Portal::new(true, Hooks::default());
        portal.create_session("/s/1", "app");
        let options = SelectSourcesOptions {
            cursor_mode: Some(CursorMode::Metadata),
            ..Default::default()
        };
        assert_eq!(
            portal.select_sources("/s/1", &options, &outputs(), &mut Pick(Some(OutputId(3)))),
            PortalResponse::Cancelled
        );
    }

    #[test]
    fn test_chooser_cancel() {
        let mut portal = Portal::new(true, Hooks::default());
        portal.create_session("/s/1", "app");
        assert_eq!(
            portal.select_sources("/s/1", &embedded(), &outputs(), &mut Pick(None)),
            PortalResponse::Cancelled
        );
        let (response, _) = portal.start("/s/1", &mut FakeLauncher::default());
        assert_eq!(response, PortalResponse::Cancelled);
    }

    #[test]
    fn test_hidden_cursor_by_default() {
        let mut portal = Portal::new(true, Hooks::default());
        portal.create_session("/s/1", "app");
        portal.select_sources(
            "/s/1",
            &SelectSourcesOptions::default(),
            &outputs(),
            &mut Pick(Some(OutputId(3))),
        );
        assert!(!portal.session("/s/1").unwrap().target().unwrap().with_cursor);
    }

    #[test]
    fn test_failed_start_is_cancelled() {
        let mut portal = Portal::new(true, Hooks::default());
        let mut launcher = FakeLauncher {
            fail: true,
            ..Default::default()
        };
        portal.create_session("/s/1", "app");
        portal.select_sources("/s/1", &embedded(), &outputs(), &mut Pick(Some(OutputId(3))));
        let (response, results) = portal.start("/s/1", &mut launcher);
        assert_eq!(response, PortalResponse::Cancelled);
        assert!(results.is_none());
        assert!(!portal.session("/s/1").unwrap().is_started());
    }

    #[test]
    fn test_duplicate_session_and_double_start() {
        let mut portal = Portal::new(true, Hooks::default());
        let mut launcher = FakeLauncher::default();
        assert_eq!(portal.create_session("/s/1", "app"), PortalResponse::Success);
        assert_eq!(portal.create_session("/s/1", "app"), PortalResponse::Cancelled);
        portal.select_sources("/s/1", &embedded(), &outputs(), &mut Pick(Some(OutputId(3))));
        assert_eq!(portal.start("/s/1", &mut launcher).0, PortalResponse::Success);
        assert_eq!(portal.start("/s/1", &mut launcher).0, PortalResponse::Cancelled);
        assert_eq!(launcher.started.len(), 1);
    }

    #[test]
    fn test_cast_id_format() {
        assert!(new_cast_id("").starts_with("wlcast-"));
        let id = new_cast_id("app");
        let millis: i64 = id.trim_start_matches("app-").parse().unwrap();
        assert!(millis > 0);
    }
}
