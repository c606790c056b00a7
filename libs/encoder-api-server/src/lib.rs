//! HTTP surface of the encoder: the Twirp-style lifecycle RPCs, a liveness
//! pulse and the prometheus scrape endpoint.

mod metrics;
mod rpc;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use encoder_engine::SubscriptionManager;

use crate::metrics::RpcMetrics;

pub use rpc::{CreateStreamRequest, CreateStreamResponse, DeleteStreamRequest, DeleteStreamResponse, TwirpError};

/// Path prefix of the lifecycle service.
pub const ENCODER_PATH_PREFIX: &str = "/twirp/decode.iot.encoder.Encoder";

#[derive(Clone)]
struct AppState {
    manager: Arc<SubscriptionManager>,
    registry: prometheus::Registry,
    rpc: RpcMetrics,
}

/// Build the router. RPC metrics are registered into `registry`, which is
/// also what `/metrics` renders.
pub fn router(manager: Arc<SubscriptionManager>, registry: prometheus::Registry) -> Result<Router, prometheus::Error> {
    let rpc = RpcMetrics::register(&registry)?;
    let state = AppState { manager, registry, rpc };

    let app = Router::new()
        .route(
            &format!("{ENCODER_PATH_PREFIX}/CreateStream"),
            post(rpc::handle_create_stream),
        )
        .route(
            &format!("{ENCODER_PATH_PREFIX}/DeleteStream"),
            post(rpc::handle_delete_stream),
        )
        .route("/pulse", get(handle_pulse))
        .route("/metrics", get(handle_metrics))
        .with_state(state);
    Ok(app)
}

/// Serve `app` on `listener` until `shutdown` fires, then stop accepting
/// and let open requests finish.
pub async fn run(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<(), String> {
    let addr = listener
        .local_addr()
        .map_err(|e| format!("api listener address: {e}"))?;
    tracing::info!(%addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    tracing::info!("api stopped");
    Ok(())
}

// --- GET /pulse ---

async fn handle_pulse() -> &'static str {
    "ok"
}

// --- GET /metrics ---

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    use prometheus::Encoder as _;

    let encoder = prometheus::TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut body) {
        Ok(()) => ([(header::CONTENT_TYPE, encoder.format_type().to_string())], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics encoding failed");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
