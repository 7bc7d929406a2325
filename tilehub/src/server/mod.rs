//! The dispatcher's HTTP surface.
//!
//! The logic is split into focused modules:
//! - [`handlers`] implement the concrete HTTP handlers and response helpers.
//! - [`routes`] composes handlers into an axum `Router`.
//! - [`singleflight`] owns per-fingerprint request coalescing.
//!
//! This module owns lifecycle concerns only: shared state, building the
//! router, listening on a socket and graceful shutdown.

pub mod handlers;
pub mod routes;
pub mod singleflight;

use crate::cache::TileCache;
use crate::config::DispatcherConfig;
use crate::generate::TileGenerator;
use crate::pool::{AdmissionGate, WorkerPool};
use crate::queue::JobQueue;
use crate::registry::Registry;
use crate::topology::RemoteNodes;
use anyhow::{Context, Result};
use axum::BoxError;
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use singleflight::SingleFlight;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::{ServiceBuilder, timeout::TimeoutLayer};
use tower_http::catch_panic::CatchPanicLayer;

/// Everything a request handler can reach.
///
/// `generator` and `pool` refer to the same worker pool on a full node;
/// tests swap `generator` for an in-memory fake, and a cache-only node has
/// neither. `queue` is only present on nodes with a database.
pub struct AppState {
	pub config: Arc<DispatcherConfig>,
	pub registry: Arc<Registry>,
	pub cache: Arc<TileCache>,
	pub generator: Option<Arc<dyn TileGenerator>>,
	pub pool: Option<Arc<WorkerPool>>,
	pub gate: AdmissionGate,
	pub single_flight: Arc<SingleFlight>,
	pub queue: Option<Arc<JobQueue>>,
	pub remotes: RemoteNodes,
}

impl AppState {
	/// State of a full node: the pool serves as the generator.
	pub fn with_pool(
		config: Arc<DispatcherConfig>,
		registry: Arc<Registry>,
		cache: Arc<TileCache>,
		pool: Arc<WorkerPool>,
		queue: Option<Arc<JobQueue>>,
	) -> Arc<AppState> {
		let gate = AdmissionGate::new(config.max_concurrent_tile_requests);
		let remotes = RemoteNodes::new(config.worker_timeout());
		Arc::new(AppState {
			registry,
			cache,
			generator: Some(Arc::clone(&pool) as Arc<dyn TileGenerator>),
			pool: Some(pool),
			gate,
			single_flight: SingleFlight::new(),
			queue,
			remotes,
			config,
		})
	}

	/// State of a cache-only node: no workers, no queue, no database.
	pub fn cache_only(config: Arc<DispatcherConfig>, registry: Arc<Registry>, cache: Arc<TileCache>) -> Arc<AppState> {
		let gate = AdmissionGate::new(config.max_concurrent_tile_requests);
		let remotes = RemoteNodes::new(config.worker_timeout());
		Arc::new(AppState {
			registry,
			cache,
			generator: None,
			pool: None,
			gate,
			single_flight: SingleFlight::new(),
			queue: None,
			remotes,
			config,
		})
	}
}

/// Thin lifecycle layer around the router.
///
/// Start/stop are idempotent: starting twice stops the previous instance,
/// stopping twice is a no-op. Graceful shutdown waits for in-flight requests
/// up to a bounded deadline.
pub struct DispatcherServer {
	bind: String,
	port: u16,
	state: Arc<AppState>,
	exit_signal: Option<oneshot::Sender<()>>,
	join: Option<tokio::task::JoinHandle<()>>,
}

impl DispatcherServer {
	pub fn new(state: Arc<AppState>, bind: impl Into<String>) -> DispatcherServer {
		DispatcherServer {
			bind: bind.into(),
			port: 0,
			state,
			exit_signal: None,
			join: None,
		}
	}

	pub async fn start(&mut self) -> Result<()> {
		if self.exit_signal.is_some() || self.join.is_some() {
			self.stop().await;
		}

		// Backpressure for generation lives in the admission gate; the global
		// layers only cap request wall time and contain handler panics.
		// HandleErrorLayer sits outermost so axum observes an infallible
		// service.
		let request_deadline = self.state.config.worker_timeout() + Duration::from_secs(5);
		let protection = ServiceBuilder::new()
			.layer(HandleErrorLayer::new(|_err: BoxError| async move {
				StatusCode::SERVICE_UNAVAILABLE
			}))
			.layer(TimeoutLayer::new(request_deadline));

		let router = routes::build_router(Arc::clone(&self.state))
			.layer(protection)
			// Don't let a panicking handler kill the process.
			.layer(CatchPanicLayer::new());

		log::info!("binding on {}", self.bind);
		let listener = TcpListener::bind(&self.bind)
			.await
			.with_context(|| format!("binding '{}'", self.bind))?;
		self.port = listener.local_addr()?.port();

		let (tx, rx) = oneshot::channel::<()>();
		let handle = tokio::spawn(async move {
			if let Err(err) = axum::serve(listener, router.into_make_service())
				.with_graceful_shutdown(async {
					rx.await.ok();
				})
				.await
			{
				log::error!("server task exited with error: {err}");
			}
		});

		self.exit_signal = Some(tx);
		self.join = Some(handle);
		log::info!("dispatcher is serving on port {}", self.port);
		Ok(())
	}

	pub async fn stop(&mut self) {
		if self.exit_signal.is_none() && self.join.is_none() {
			return;
		}
		log::info!("stopping server");

		if let Some(tx) = self.exit_signal.take() {
			let _ = tx.send(());
		}
		if let Some(handle) = self.join.take() {
			match tokio::time::timeout(std::time::Duration::from_secs(10), handle).await {
				Ok(Err(join_err)) => log::warn!("server task join error: {join_err}"),
				Ok(Ok(())) => {}
				Err(_) => log::warn!("server task did not shut down within the deadline; continuing"),
			}
		}
	}

	/// The actual listening port; useful when bound to port 0.
	pub fn port(&self) -> u16 {
		self.port
	}
}
