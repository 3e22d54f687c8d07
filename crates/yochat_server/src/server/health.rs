#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Flip once credentials and the upstream client are in place.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub async fn healthz() -> &'static str {
	"ok"
}

pub async fn readyz(State(health): State<HealthState>) -> Response {
	if health.is_ready() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}
