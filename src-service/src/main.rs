//! wlcast Screencast Service
//!
//! Opens a portal-style session, lets the configured chooser pick an output and
//! streams it to PipeWire until a termination signal arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wlcast::chooser::CommandChooser;
use wlcast::hooks::Hooks;
use wlcast::portal::Portal;
use wlcast::pw::Screencaster;
use wlcast_common::config::load_config;
use wlcast_common::{CursorMode, PortalResponse, SelectSourcesOptions};

const SESSION_HANDLE: &str = "/org/freedesktop/portal/desktop/session/wlcast/1";
const APP_ID: &str = "wlcast";

/// Global shutdown flag
static SHUTDOWN_FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

/// Get the global shutdown flag.
pub fn get_shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN_FLAG
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Request service shutdown.
pub fn request_shutdown() {
    info!("Shutdown requested");
    get_shutdown_flag().store(true, Ordering::SeqCst);
}

fn main() {
    // Initialize logging with RUST_LOG env var support
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("wlcast service starting (pid: {})...", std::process::id());

    setup_signal_handlers();

    let config = load_config().screencast;

    let mut screencaster = match Screencaster::new(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize screencast backend: {}", e);
            std::process::exit(1);
        }
    };

    let mut portal = Portal::new(
        screencaster.wayland().has_screencopy(),
        Hooks::new(config.exec_before.clone(), config.exec_after.clone()),
    );

    if !portal.create_session(SESSION_HANDLE, APP_ID).is_success() {
        error!("Compositor does not support screen capture");
        std::process::exit(1);
    }

    let outputs = screencaster.wayland().outputs();
    let options = SelectSourcesOptions {
        cursor_mode: Some(CursorMode::Embedded),
        ..Default::default()
    };
    let mut chooser = CommandChooser::from_config(&config);
    let response = portal.select_sources(SESSION_HANDLE, &options, &outputs, &mut chooser);
    if response != PortalResponse::Success {
        warn!("No output selected");
        portal.close_session(SESSION_HANDLE, &mut screencaster);
        std::process::exit(1);
    }

    let results = match portal.start(SESSION_HANDLE, &mut screencaster) {
        (PortalResponse::Success, Some(results)) => results,
        _ => {
            error!("Failed to start screencast");
            portal.close_session(SESSION_HANDLE, &mut screencaster);
            std::process::exit(1);
        }
    };

    info!(
        "Streaming {}x{} on PipeWire node {}",
        results.width, results.height, results.node_id
    );
    match serde_json::to_string(&results) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to serialize start results: {}", e),
    }

    let outcome = screencaster.run(get_shutdown_flag());
    portal.close_session(SESSION_HANDLE, &mut screencaster);

    match outcome {
        Ok(()) => info!("wlcast service stopped"),
        Err(e) => {
            error!("Screencast ended with error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Set up signal handlers for graceful shutdown.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    std::thread::spawn(|| {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create signal runtime: {}", e);
                return;
            }
        };

        rt.block_on(async {
            let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) else {
                error!("Failed to install signal handlers");
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP");
                }
            }

            request_shutdown();
        });
    });
}
