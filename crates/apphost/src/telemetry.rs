use prometheus::{TextEncoder, Encoder, Registry, IntCounterVec, IntGauge, opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use crate::config::Settings;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("reconcile_operations_total", "Reconciler operations by outcome"), &["op", "outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_STEPS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("reconcile_step_total", "Reconciler steps by result"), &["step", "result"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static GATEWAY_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("gateway_connections", "Open realtime connections").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static GATEWAY_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("gateway_frames_sent_total", "Frames sent to realtime clients"), &["feed"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Logs go to stderr; `RUST_LOG` wins over the configured level.
pub fn init_tracing(settings: &Settings) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env);
    let res = if settings.log_json { registry.with(base.json()).try_init() } else { registry.with(base.compact()).try_init() };
    if res.is_err() { tracing::debug!("tracing subscriber already installed"); }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}
