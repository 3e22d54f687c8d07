#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, FromRef, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use yochat_domain::BroadcastId;
use yochat_platform::{ChatApi, new_session_id};

use super::health::{self, HealthState};
use super::session::{SessionContext, run_session};

/// Body of the 400 response when no broadcast can be derived from the query.
pub const MISSING_BROADCAST_BODY: &str = "One of broadcastId or url should be provided.";

#[derive(Clone)]
pub struct AppState {
	pub api: Arc<dyn ChatApi>,
	/// Root of every session's cancellation.
	pub shutdown: CancellationToken,
	pub health: HealthState,
}

impl FromRef<AppState> for HealthState {
	fn from_ref(state: &AppState) -> Self {
		state.health.clone()
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchParams {
	pub broadcast_id: Option<String>,
	pub url: Option<String>,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/watch", get(watch))
		.route("/healthz", get(health::healthz))
		.route("/readyz", get(health::readyz))
		.with_state(state)
}

async fn watch(
	State(state): State<AppState>,
	ConnectInfo(remote): ConnectInfo<SocketAddr>,
	params: Result<Query<WatchParams>, QueryRejection>,
	ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
	let params = params.map(|Query(p)| p).unwrap_or_default();

	let broadcast_id = match BroadcastId::from_query(params.broadcast_id.as_deref(), params.url.as_deref()) {
		Ok(id) => id,
		Err(e) => {
			info!(%remote, error = %e, "watch request without a usable broadcast id");
			return (StatusCode::BAD_REQUEST, MISSING_BROADCAST_BODY).into_response();
		}
	};

	let ws = match ws {
		Ok(ws) => ws,
		Err(rejection) => {
			info!(%remote, %broadcast_id, error = %rejection, "watch request is not a websocket upgrade");
			return rejection.into_response();
		}
	};

	let session_id = new_session_id();
	info!(%remote, %session_id, %broadcast_id, "watch session accepted");

	let ctx = SessionContext {
		session_id: session_id.clone(),
		remote,
		broadcast_id,
		api: Arc::clone(&state.api),
		shutdown: state.shutdown.clone(),
	};

	ws.on_failed_upgrade(move |e| warn!(%session_id, error = %e, "websocket upgrade failed"))
		.on_upgrade(move |socket| run_session(socket, ctx))
}

/// Serve the router on `listener` until the shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	let shutdown = state.shutdown.clone();
	let app = router(state);

	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(async move { shutdown.cancelled().await })
		.await
		.context("watch listener failed")
}
