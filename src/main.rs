//! Line follower - camera line geometry analyzer and position broadcast server
//!
//! Module structure:
//! - `domain/` - Frames, contours, line geometry, position snapshots
//! - `services/` - Geometry analysis, publish debounce, control loop
//! - `io/` - Camera, contour finder, position server, status HTTP, console
//! - `infra/` - Configuration and metrics

use clap::Parser;
use line_follower::infra::{Config, Metrics, Overrides};
use line_follower::io::{
    console, start_status_server, ColorContourFinder, LogIndicator, PositionServer, StatusState,
    SyntheticCamera, SyntheticCameraConfig,
};
use line_follower::services::{
    ControlLoop, GeometryAnalyzer, LoopOptions, PositionStateMachine, Settings,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Line follower - publishes the tracked line's position to subscribers
#[derive(Parser, Debug)]
#[command(name = "line-follower", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Position server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Frame width used for analysis
    #[arg(short, long)]
    width: Option<u32>,

    /// Also publish when only the midline crossing changes
    #[arg(short, long)]
    midline: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "line-follower starting");

    let args = Args::parse();
    let overrides = Overrides { port: args.port, width: args.width, report_midline: args.midline };
    let config = Config::load_from_path(&args.config).with_overrides(&overrides);

    info!(
        config_file = %config.config_file(),
        width = %config.width(),
        fps = %config.fps(),
        bgr_color = ?config.bgr_color(),
        minimum_pixels = %config.minimum_pixels(),
        focus_line_pct = %config.focus_line_pct(),
        middle_percent = %config.middle_percent(),
        report_midline = %config.report_midline(),
        estimator = %config.estimator().as_str(),
        port = %config.port(),
        status_port = %config.status_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Binding the position server is the only fatal startup step
    let listener = match config.server_addr() {
        Ok(addr) => match PositionServer::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %addr, error = %e, "position_server_bind_failed");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %format!("{e:#}"), "position_server_bind_failed");
            std::process::exit(1);
        }
    };

    let server =
        Arc::new(PositionServer::new(config.start_id(), metrics.clone(), shutdown_rx.clone()));
    let serve_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_server.serve(listener).await {
            error!(error = %e, "position_server_error");
        }
    });

    let (adjust_tx, adjust_rx) = mpsc::channel(64);

    // Status HTTP server (if port > 0)
    let status_port = config.status_port();
    if status_port > 0 {
        let state = Arc::new(StatusState {
            metrics: metrics.clone(),
            server: server.clone(),
            adjustments: adjust_tx.clone(),
        });
        let status_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_status_server(status_port, state, status_shutdown).await {
                error!(error = %e, "status_server_error");
            }
        });
    }

    // Metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    if config.console() {
        if let Err(e) = console::spawn_console(adjust_tx.clone()) {
            error!(error = %e, "console_start_failed");
        }
    }
    drop(adjust_tx);

    let camera = SyntheticCamera::new(SyntheticCameraConfig {
        width: config.width(),
        height: config.camera_height(),
        fps: config.fps(),
        line_bgr: config.bgr_color(),
        ..Default::default()
    });
    let control = ControlLoop::new(
        camera,
        ColorContourFinder::new(config.bgr_color(), config.hsv_range()),
        LogIndicator::new(),
        GeometryAnalyzer::new(config.estimator().build()),
        PositionStateMachine::new(config.report_midline()),
        Settings::from_config(&config),
        LoopOptions::from_config(&config),
        server.clone(),
        metrics.clone(),
        adjust_rx,
    );
    let stop = control.stop_handle();
    let mut control_task = tokio::task::spawn_blocking(move || control.run());

    let result = tokio::select! {
        result = &mut control_task => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            stop.store(true, Ordering::Release);
            control_task.await
        }
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "control_loop_failed"),
        Err(e) => error!(error = %e, "control_loop_panicked"),
    }

    server.stop();
    let _ = shutdown_tx.send(true);
    metrics.report().log();

    info!("line-follower shutdown complete");
    Ok(())
}
