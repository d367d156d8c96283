//! Status HTTP endpoint
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - liveness
//! - `GET /position` - snapshot currently in the broadcast slot
//! - `GET /clients` - connected subscribers
//! - `POST /adjust/<command>` - queue an adjustment for the control loop

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::position_server::PositionServer;
use crate::services::control_loop::Adjustment;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {count}");
}

fn format_prometheus_metrics(summary: &MetricsSummary) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "line_follower_frames_total",
        "Frames analyzed",
        MetricType::Counter,
        summary.frames_total,
    );
    let _ = writeln!(output, "# HELP line_follower_frames_per_sec Frames analyzed per second");
    let _ = writeln!(output, "# TYPE line_follower_frames_per_sec gauge");
    let _ = writeln!(output, "line_follower_frames_per_sec {:.2}", summary.frames_per_sec);

    write_histogram(
        &mut output,
        "line_follower_frame_latency_us",
        "Frame processing latency in microseconds",
        &summary.lat_buckets,
        summary.lat_sum_us,
    );
    write_metric(
        &mut output,
        "line_follower_frame_latency_p99_us",
        "99th percentile frame latency",
        MetricType::Gauge,
        summary.lat_p99_us,
    );
    write_metric(
        &mut output,
        "line_follower_frame_latency_max_us",
        "Maximum frame latency in the current report interval",
        MetricType::Gauge,
        summary.max_frame_latency_us,
    );

    write_metric(
        &mut output,
        "line_follower_frame_errors_total",
        "Frames that failed and backed off",
        MetricType::Counter,
        summary.frame_errors_total,
    );
    write_metric(
        &mut output,
        "line_follower_lines_detected_total",
        "Frames with a usable line",
        MetricType::Counter,
        summary.lines_detected_total,
    );
    write_metric(
        &mut output,
        "line_follower_positions_published_total",
        "Snapshots written to the broadcast slot",
        MetricType::Counter,
        summary.positions_published_total,
    );
    write_metric(
        &mut output,
        "line_follower_clients_registered_total",
        "registerClient calls",
        MetricType::Counter,
        summary.clients_registered_total,
    );
    write_metric(
        &mut output,
        "line_follower_subscribers_active",
        "Connected position subscribers",
        MetricType::Gauge,
        summary.subscribers_active,
    );

    output
}

/// Shared handles the endpoint reads from and writes to
pub struct StatusState {
    pub metrics: Arc<Metrics>,
    pub server: Arc<PositionServer>,
    pub adjustments: mpsc::Sender<Adjustment>,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn respond_json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "application/json",
            format!(r#"{{"ok":false,"error":"{e}"}}"#),
        ),
    }
}

fn queue_adjustment(name: &str, state: &StatusState) -> Response<Full<Bytes>> {
    let Some(adjustment) = Adjustment::from_name(name) else {
        return respond(
            StatusCode::NOT_FOUND,
            "application/json",
            r#"{"ok":false,"error":"unknown_adjustment"}"#,
        );
    };

    match state.adjustments.try_send(adjustment) {
        Ok(()) => {
            info!(adjustment = %adjustment.as_str(), "adjustment_queued");
            respond(
                StatusCode::OK,
                "application/json",
                format!(r#"{{"ok":true,"adjustment":"{}"}}"#, adjustment.as_str()),
            )
        }
        Err(e) => {
            warn!(adjustment = %adjustment.as_str(), error = %e, "adjustment_rejected");
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "application/json",
                r#"{"ok":false,"error":"control_loop_unavailable"}"#,
            )
        }
    }
}

fn route(method: &Method, path: &str, state: &StatusState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics.snapshot());
            respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, body)
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/position") => respond_json(StatusCode::OK, &state.server.current()),
        (&Method::GET, "/clients") => respond_json(StatusCode::OK, &state.server.sessions()),
        (&Method::POST, path) if path.starts_with("/adjust/") => {
            queue_adjustment(&path["/adjust/".len()..], state)
        }
        (&Method::OPTIONS, path) if path.starts_with("/adjust/") => {
            let mut response = respond(StatusCode::OK, "text/plain", "");
            response
                .headers_mut()
                .insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST, OPTIONS"));
            response
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<StatusState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &state))
}

/// Serve the status endpoint on an already bound listener until shutdown
pub async fn serve_status(
    listener: TcpListener,
    state: Arc<StatusState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(addr = %listener.local_addr()?, "status_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "status_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "status_accept_error");
                    }
                }
            }
            result = shutdown.wait_for(|stop| *stop) => {
                if result.is_ok() {
                    info!("status_server_shutdown");
                }
                return Ok(());
            }
        }
    }
}

/// Bind `0.0.0.0:port` and serve the status endpoint
pub async fn start_status_server(
    port: u16,
    state: Arc<StatusState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve_status(listener, state, shutdown).await
}
