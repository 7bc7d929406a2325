//! HTTP handlers and small response helpers.
//!
//! The tile hot path lives in [`serve_tile`]: registry resolve, coordinate
//! validation, single-flight join, cache lookup, then generation through the
//! admission gate (local pool) or a remote node. Everything else is the
//! management surface: datasource CRUD, pyramid jobs and worker-pool
//! maintenance.

use super::AppState;
use super::singleflight::{Flight, TileOutcome};
use crate::generate::{GenerateError, TileGenerator};
use crate::registry::RegistryError;
use axum::{
	Json,
	body::Body,
	extract::{Path, Query, State},
	http::{StatusCode, header},
	response::Response,
};
use chrono::Utc;
use flate2::bufread::GzEncoder;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Read;
use std::sync::Arc;
use tilehub_core::{Datasource, JobDetail, JobStatus, TileAddress, TileCoord, TileFormat, TileReply};
use uuid::Uuid;

// --- tile hot path -----------------------------------------------------------

pub async fn serve_tile(
	State(state): State<Arc<AppState>>,
	Path((id, z, x, y_ext)): Path<(String, String, String, String)>,
) -> Response<Body> {
	let Ok(id) = Uuid::parse_str(&id) else {
		return error_404();
	};
	let Some(datasource) = state.registry.get(&id) else {
		log::debug!("tile request for unknown datasource {id}");
		return error_404();
	};

	let (Ok(z), Ok(x)) = (z.parse::<u8>(), x.parse::<u32>()) else {
		return error_404();
	};
	let Some((y, ext)) = y_ext.split_once('.') else {
		return error_404();
	};
	let Ok(y) = y.parse::<u32>() else {
		return error_404();
	};
	let Some(format) = TileFormat::from_extension(ext) else {
		return error_404();
	};

	if !datasource.accepts(format) || !datasource.zoom_in_range(z) {
		return error_404();
	}
	let Ok(coord) = TileCoord::new(z, x, y) else {
		return error_404();
	};
	if !datasource.bounds.contains_tile(&coord) {
		return empty_204();
	}

	let address = TileAddress::new(id, coord, format);
	match state.single_flight.join(address.fingerprint()) {
		Flight::Follower(receiver) => match receiver.await {
			Ok(outcome) => tile_response(&datasource, format, &outcome),
			// The leader vanished without completing; treat like a crash.
			Err(_) => error_500(),
		},
		Flight::Leader(ticket) => {
			// The generation outlives this request on purpose: if the leading
			// client disconnects, attached followers still get the outcome.
			let task_state = Arc::clone(&state);
			let task_datasource = Arc::clone(&datasource);
			let task_address = address.clone();
			let work = tokio::spawn(async move {
				let outcome = resolve_tile(&task_state, &task_datasource, &task_address).await;
				ticket.complete(&outcome);
				outcome
			});
			match work.await {
				Ok(outcome) => tile_response(&datasource, format, &outcome),
				Err(_) => error_500(),
			}
		}
	}
}

/// Leader work for one fingerprint: cache first, then generation.
async fn resolve_tile(state: &AppState, datasource: &Datasource, address: &TileAddress) -> TileOutcome {
	match state.cache.lookup(address).await {
		Ok(tilehub_core::CacheLookup::Present(bytes)) => return Ok(TileReply::Present(bytes)),
		Ok(tilehub_core::CacheLookup::Empty) => return Ok(TileReply::Empty),
		Ok(tilehub_core::CacheLookup::Absent) => {}
		Err(err) => {
			log::warn!("cache lookup for {address:?} failed: {err:#}");
			return Err(GenerateError::Worker(format!("cache lookup failed: {err}")));
		}
	}

	if datasource.use_cache_only {
		return Ok(TileReply::Empty);
	}

	if let Some(upstream) = &datasource.upstream {
		return state.remotes.node(upstream).generate(datasource, address).await;
	}

	let Some(generator) = &state.generator else {
		// Cache-only node: a miss is terminal.
		return Ok(TileReply::Empty);
	};

	let Some(_permit) = state.gate.try_admit() else {
		log::warn!("admission gate rejected {address:?}");
		return Err(GenerateError::Rejected);
	};
	generator.generate(datasource, address).await
}

fn tile_response(datasource: &Datasource, format: TileFormat, outcome: &TileOutcome) -> Response<Body> {
	match outcome {
		Ok(TileReply::Present(bytes)) => {
			if datasource.compress_tiles && format.is_vector() {
				// Vector tiles read from an archive are usually stored
				// pre-gzipped; those pass through untouched, but the response
				// must carry Content-Encoding either way.
				if is_gzipped(bytes) {
					tile_bytes_response(format, bytes.clone(), true)
				} else {
					match compress_gzip(bytes) {
						Ok(compressed) => tile_bytes_response(format, compressed, true),
						Err(err) => {
							log::error!("compressing tile payload failed: {err:#}");
							error_500()
						}
					}
				}
			} else {
				tile_bytes_response(format, bytes.clone(), false)
			}
		}
		Ok(TileReply::Empty) => empty_204(),
		Err(GenerateError::Rejected | GenerateError::Timeout) => error_503(),
		Err(GenerateError::Worker(_) | GenerateError::Crashed) => error_500(),
	}
}

fn tile_bytes_response(format: TileFormat, bytes: Vec<u8>, gzipped: bool) -> Response<Body> {
	let mut builder = Response::builder()
		.status(200)
		.header(header::CONTENT_TYPE, format.mime())
		.header(header::CACHE_CONTROL, "public, max-age=86400");
	if gzipped {
		builder = builder.header(header::CONTENT_ENCODING, "gzip");
	}
	builder
		.body(Body::from(bytes))
		.expect("failed to build tile response")
}

fn is_gzipped(bytes: &[u8]) -> bool {
	bytes.starts_with(&[0x1f, 0x8b])
}

fn compress_gzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut encoder = GzEncoder::new(bytes, flate2::Compression::fast());
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

// --- pyramid jobs ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PyramidRequest {
	pub datasource_id: Uuid,
}

/// Enqueue a pyramid build, idempotently per datasource: while a pyramid job
/// for the datasource is pending or running, the existing job id is returned.
pub async fn post_pyramid(State(state): State<Arc<AppState>>, Json(request): Json<PyramidRequest>) -> Response<Body> {
	let Some(datasource) = state.registry.get(&request.datasource_id) else {
		return error_404();
	};
	let Some(queue) = &state.queue else {
		return error_with(503, "this node has no job queue");
	};

	match queue.find_active_pyramid(datasource.id).await {
		Ok(Some(existing)) => accepted_pyramid(existing, true),
		Ok(None) => {
			let detail = JobDetail::PyramidBuild {
				datasource_id: datasource.id,
				minzoom: datasource.pyramid.minzoom.unwrap_or(datasource.minzoom),
				maxzoom: datasource.pyramid.maxzoom.unwrap_or(datasource.maxzoom),
			};
			match queue.enqueue(&detail, Utc::now()).await {
				Ok(job_id) => accepted_pyramid(job_id, false),
				Err(err) => {
					log::error!("enqueueing pyramid build failed: {err:#}");
					error_500()
				}
			}
		}
		Err(err) => {
			log::error!("pyramid idempotence check failed: {err:#}");
			error_500()
		}
	}
}

fn accepted_pyramid(pyramid_id: Uuid, already_running: bool) -> Response<Body> {
	json_response(
		StatusCode::ACCEPTED,
		json!({ "pyramid_id": pyramid_id, "already_running": already_running }),
	)
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
	pub status: Option<JobStatus>,
}

pub async fn list_pyramid_jobs(State(state): State<Arc<AppState>>, Query(query): Query<JobsQuery>) -> Response<Body> {
	let Some(queue) = &state.queue else {
		return error_with(503, "this node has no job queue");
	};
	match queue.list(query.status).await {
		Ok(jobs) => json_response(StatusCode::OK, json!(jobs)),
		Err(err) => {
			log::error!("listing jobs failed: {err:#}");
			error_500()
		}
	}
}

pub async fn cancel_pyramid_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Response<Body> {
	let Some(queue) = &state.queue else {
		return error_with(503, "this node has no job queue");
	};
	match queue.cancel(job_id).await {
		Ok(true) => json_response(StatusCode::OK, json!({ "status": "cancelled", "job_id": job_id })),
		Ok(false) => error_404(),
		Err(err) => {
			log::error!("cancelling job {job_id} failed: {err:#}");
			error_500()
		}
	}
}

// --- datasource CRUD ---------------------------------------------------------

pub async fn list_datasources(State(state): State<Arc<AppState>>) -> Json<Vec<Value>> {
	Json(
		state
			.registry
			.list()
			.iter()
			.map(|datasource| datasource.to_document())
			.collect(),
	)
}

pub async fn get_datasource(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response<Body> {
	match state.registry.get(&id) {
		Some(datasource) => json_response(StatusCode::OK, datasource.to_document()),
		None => error_404(),
	}
}

pub async fn create_datasource(State(state): State<Arc<AppState>>, Json(doc): Json<Value>) -> Response<Body> {
	match state.registry.create(&doc).await {
		Ok(id) => json_response(
			StatusCode::OK,
			json!({ "datasource_id": id, "message": "datasource created" }),
		),
		Err(err) => registry_error_response(err),
	}
}

pub async fn update_datasource(State(state): State<Arc<AppState>>, Json(doc): Json<Value>) -> Response<Body> {
	let Some(id) = doc.get("id").and_then(Value::as_str).and_then(|raw| Uuid::parse_str(raw).ok()) else {
		return json_response(
			StatusCode::UNPROCESSABLE_ENTITY,
			json!({ "detail": [{ "location": ["id"], "message": "a valid datasource id is required", "type": "missing" }] }),
		);
	};
	match state.registry.update(id, &doc).await {
		Ok(()) => json_response(StatusCode::OK, json!({ "datasource_id": id, "message": "datasource updated" })),
		Err(err) => registry_error_response(err),
	}
}

pub async fn delete_datasource(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response<Body> {
	match state.registry.delete(&id).await {
		Ok(()) => json_response(StatusCode::OK, json!({ "status": "ok", "message": "datasource deleted" })),
		Err(err) => registry_error_response(err),
	}
}

pub async fn load_files(State(state): State<Arc<AppState>>) -> Response<Body> {
	let report = state.registry.load_files().await;
	json_response(StatusCode::OK, json!(report))
}

pub async fn reload_files(State(state): State<Arc<AppState>>, Json(ids): Json<Vec<Uuid>>) -> Response<Body> {
	let report = state.registry.reload_files(&ids).await;
	json_response(StatusCode::OK, json!(report))
}

fn registry_error_response(err: RegistryError) -> Response<Body> {
	match err {
		RegistryError::NotFound => error_404(),
		RegistryError::Invalid(issues) => json_response(StatusCode::UNPROCESSABLE_ENTITY, json!({ "detail": issues })),
		RegistryError::Db(err) => {
			log::error!("registry persistence failed: {err:#}");
			error_500()
		}
	}
}

// --- worker pool maintenance -------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddWorkersRequest {
	pub count: usize,
}

pub async fn add_workers(State(state): State<Arc<AppState>>, Json(request): Json<AddWorkersRequest>) -> Response<Body> {
	let Some(pool) = &state.pool else {
		return error_with(503, "this node has no worker pool");
	};
	match pool.add_workers(request.count).await {
		Ok(()) => json_response(StatusCode::OK, json!({ "status": "ok", "added": request.count })),
		Err(err) => {
			log::error!("adding workers failed: {err:#}");
			error_500()
		}
	}
}

pub async fn reload_workers(State(state): State<Arc<AppState>>) -> Response<Body> {
	let Some(pool) = &state.pool else {
		return error_with(503, "this node has no worker pool");
	};
	match pool.reload_all().await {
		Ok(()) => json_response(StatusCode::OK, json!({ "status": "ok" })),
		Err(rejected) => error_with(409, &rejected.to_string()),
	}
}

pub async fn terminate_workers(State(state): State<Arc<AppState>>) -> Response<Body> {
	let Some(pool) = &state.pool else {
		return error_with(503, "this node has no worker pool");
	};
	pool.terminate_all().await;
	json_response(StatusCode::OK, json!({ "status": "ok" }))
}

pub async fn info_workers(State(state): State<Arc<AppState>>) -> Response<Body> {
	let info = state.pool.as_ref().map(|pool| pool.info()).unwrap_or_default();
	json_response(StatusCode::OK, json!(info))
}

// --- small helpers -----------------------------------------------------------

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(value.to_string()))
		.expect("failed to build json response")
}

fn error_with(status: u16, message: &str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(message.as_bytes().to_vec()))
		.expect("failed to build error response")
}

pub fn error_404() -> Response<Body> {
	error_with(404, "Not Found")
}

pub fn error_500() -> Response<Body> {
	error_with(500, "Internal Server Error")
}

fn error_503() -> Response<Body> {
	error_with(503, "Service Unavailable")
}

fn empty_204() -> Response<Body> {
	Response::builder()
		.status(204)
		.body(Body::empty())
		.expect("failed to build empty response")
}

// --- tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::TileCache;
	use crate::config::DispatcherConfig;
	use crate::pool::AdmissionGate;
	use crate::registry::Registry;
	use crate::server::routes::build_router;
	use crate::server::singleflight::SingleFlight;
	use crate::topology::RemoteNodes;
	use async_trait::async_trait;
	use axum::Router;
	use axum::http::Request;
	use std::path::Path as FsPath;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;
	use tokio::sync::Semaphore;
	use tower::ServiceExt as _;

	struct FakeGenerator {
		calls: AtomicUsize,
		hold: Option<Arc<Semaphore>>,
		outcome: TileOutcome,
	}

	impl FakeGenerator {
		fn replying(outcome: TileOutcome) -> Arc<FakeGenerator> {
			Arc::new(FakeGenerator {
				calls: AtomicUsize::new(0),
				hold: None,
				outcome,
			})
		}

		/// A generator that blocks until permits are added to `hold`.
		fn held(outcome: TileOutcome) -> (Arc<FakeGenerator>, Arc<Semaphore>) {
			let hold = Arc::new(Semaphore::new(0));
			let generator = Arc::new(FakeGenerator {
				calls: AtomicUsize::new(0),
				hold: Some(Arc::clone(&hold)),
				outcome,
			});
			(generator, hold)
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl TileGenerator for FakeGenerator {
		async fn generate(&self, _datasource: &Datasource, _address: &TileAddress) -> TileOutcome {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if let Some(hold) = &self.hold {
				let _permit = hold.acquire().await.unwrap();
			}
			self.outcome.clone()
		}
	}

	fn test_state(
		generator: Option<Arc<dyn TileGenerator>>,
		gate_limit: usize,
		cache_root: &FsPath,
	) -> Arc<AppState> {
		Arc::new(AppState {
			config: Arc::new(DispatcherConfig::default()),
			registry: Arc::new(Registry::new(None, "/nonexistent/vector", "/nonexistent/raster")),
			cache: Arc::new(TileCache::new(cache_root)),
			generator,
			pool: None,
			gate: AdmissionGate::new(gate_limit),
			single_flight: SingleFlight::new(),
			queue: None,
			remotes: RemoteNodes::new(Duration::from_secs(5)),
		})
	}

	async fn get(router: &Router, path: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
		let response = router
			.clone()
			.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
			.await
			.unwrap();
		let status = response.status();
		let headers = response.headers().clone();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, headers, bytes.to_vec())
	}

	async fn send_json(router: &Router, method: &str, path: &str, body: Value) -> (StatusCode, Value) {
		let request = Request::builder()
			.method(method)
			.uri(path)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();
		let response = router.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value = if bytes.is_empty() {
			Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap_or(Value::Null)
		};
		(status, value)
	}

	async fn insert_raster(state: &AppState, id: Uuid, bounds: Value) -> Uuid {
		state
			.registry
			.create(&json!({
				"id": id,
				"type": "raster",
				"file": "dem.tif",
				"minzoom": 0,
				"maxzoom": 14,
				"bounds": bounds
			}))
			.await
			.unwrap()
	}

	async fn wait_until(mut condition: impl FnMut() -> bool) {
		for _ in 0..2000 {
			if condition() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(2)).await;
		}
		panic!("condition not reached in time");
	}

	#[tokio::test]
	async fn cache_hit_never_touches_the_generator() {
		let dir = tempfile::tempdir().unwrap();
		let generator = FakeGenerator::replying(Ok(TileReply::Present(b"generated".to_vec())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
		let id = Uuid::new_v4();
		insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;

		let tile_dir = dir.path().join(id.to_string()).join("3").join("4");
		std::fs::create_dir_all(&tile_dir).unwrap();
		std::fs::write(tile_dir.join("5.png"), b"cached-bytes").unwrap();

		let router = build_router(Arc::clone(&state));
		let (status, headers, body) = get(&router, &format!("/api/tile/{id}/3/4/5.png")).await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(headers[header::CONTENT_TYPE.as_str()], "image/png");
		assert_eq!(body, b"cached-bytes");
		assert_eq!(generator.calls(), 0);
	}

	#[tokio::test]
	async fn concurrent_misses_coalesce_into_one_generation() {
		let dir = tempfile::tempdir().unwrap();
		let (generator, hold) = FakeGenerator::held(Ok(TileReply::Present(b"fresh".to_vec())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 128, dir.path());
		let id = Uuid::new_v4();
		insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;

		let fingerprint = TileAddress::new(id, TileCoord::new(3, 4, 5).unwrap(), TileFormat::Png).fingerprint();
		let router = build_router(Arc::clone(&state));

		let mut requests = Vec::new();
		for _ in 0..100 {
			let router = router.clone();
			let path = format!("/api/tile/{id}/3/4/5.png");
			requests.push(tokio::spawn(async move {
				let response = router
					.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
					.await
					.unwrap();
				let status = response.status();
				let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
				(status, bytes.to_vec())
			}));
		}

		// One leader inside the generator, the other 99 attached as followers.
		wait_until(|| generator.calls() == 1).await;
		{
			let single_flight = Arc::clone(&state.single_flight);
			wait_until(move || single_flight.waiters(fingerprint) == Some(99)).await;
		}

		hold.add_permits(1);

		for request in requests {
			let (status, body) = request.await.unwrap();
			assert_eq!(status, StatusCode::OK);
			assert_eq!(body, b"fresh");
		}
		assert_eq!(generator.calls(), 1);
		assert_eq!(state.single_flight.len(), 0);
	}

	#[tokio::test]
	async fn admission_gate_rejects_the_overflow_request() {
		let dir = tempfile::tempdir().unwrap();
		let (generator, hold) = FakeGenerator::held(Ok(TileReply::Present(b"slow".to_vec())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 2, dir.path());
		let id = Uuid::new_v4();
		insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;

		let router = build_router(Arc::clone(&state));
		let mut held_requests = Vec::new();
		for x in 0..2u32 {
			let router = router.clone();
			let path = format!("/api/tile/{id}/3/{x}/5.png");
			held_requests.push(tokio::spawn(async move {
				router
					.oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
					.await
					.unwrap()
					.status()
			}));
		}

		wait_until(|| generator.calls() == 2).await;

		let (status, _, _) = get(&router, &format!("/api/tile/{id}/3/2/5.png")).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

		hold.add_permits(16);
		for request in held_requests {
			assert_eq!(request.await.unwrap(), StatusCode::OK);
		}
	}

	#[tokio::test]
	async fn out_of_bounds_is_204_and_skips_the_generator() {
		let dir = tempfile::tempdir().unwrap();
		let generator = FakeGenerator::replying(Ok(TileReply::Present(b"never".to_vec())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
		let id = Uuid::new_v4();
		// Berlin-ish bounds; tile (10, 0, 0) is far away.
		insert_raster(&state, id, json!([13.0, 52.3, 13.8, 52.7])).await;

		let router = build_router(Arc::clone(&state));
		let (status, _, body) = get(&router, &format!("/api/tile/{id}/10/0/0.png")).await;

		assert_eq!(status, StatusCode::NO_CONTENT);
		assert!(body.is_empty());
		assert_eq!(generator.calls(), 0);
	}

	#[tokio::test]
	async fn use_cache_only_misses_are_terminal() {
		let dir = tempfile::tempdir().unwrap();
		let generator = FakeGenerator::replying(Ok(TileReply::Present(b"never".to_vec())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
		let id = state
			.registry
			.create(&json!({
				"type": "raster",
				"file": "dem.tif",
				"use_cache_only": true
			}))
			.await
			.unwrap();

		let router = build_router(Arc::clone(&state));
		let (status, _, _) = get(&router, &format!("/api/tile/{id}/3/4/5.png")).await;
		assert_eq!(status, StatusCode::NO_CONTENT);
		assert_eq!(generator.calls(), 0);
	}

	#[tokio::test]
	async fn tile_404_variants() {
		let dir = tempfile::tempdir().unwrap();
		let generator = FakeGenerator::replying(Ok(TileReply::Empty));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
		let id = Uuid::new_v4();
		insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;
		let router = build_router(Arc::clone(&state));

		// Unknown id.
		let unknown = Uuid::new_v4();
		assert_eq!(get(&router, &format!("/api/tile/{unknown}/3/4/5.png")).await.0, StatusCode::NOT_FOUND);
		// Malformed id.
		assert_eq!(get(&router, "/api/tile/not-a-uuid/3/4/5.png").await.0, StatusCode::NOT_FOUND);
		// Unknown extension.
		assert_eq!(get(&router, &format!("/api/tile/{id}/3/4/5.tiff")).await.0, StatusCode::NOT_FOUND);
		// Vector extension on a raster datasource.
		assert_eq!(get(&router, &format!("/api/tile/{id}/3/4/5.mvt")).await.0, StatusCode::NOT_FOUND);
		// Zoom above the descriptor's range.
		assert_eq!(get(&router, &format!("/api/tile/{id}/15/4/5.png")).await.0, StatusCode::NOT_FOUND);
		// Coordinate outside the grid of its zoom level.
		assert_eq!(get(&router, &format!("/api/tile/{id}/3/9/5.png")).await.0, StatusCode::NOT_FOUND);
		assert_eq!(generator.calls(), 0);
	}

	#[tokio::test]
	async fn generator_failures_map_to_status_codes() {
		for (outcome, expected) in [
			(Err(GenerateError::Timeout), StatusCode::SERVICE_UNAVAILABLE),
			(Err(GenerateError::Worker("boom".to_string())), StatusCode::INTERNAL_SERVER_ERROR),
			(Err(GenerateError::Crashed), StatusCode::INTERNAL_SERVER_ERROR),
			(Ok(TileReply::Empty), StatusCode::NO_CONTENT),
		] {
			let dir = tempfile::tempdir().unwrap();
			let generator = FakeGenerator::replying(outcome);
			let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
			let id = Uuid::new_v4();
			insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;

			let router = build_router(Arc::clone(&state));
			let (status, _, _) = get(&router, &format!("/api/tile/{id}/3/4/5.png")).await;
			assert_eq!(status, expected);
		}
	}

	#[tokio::test]
	async fn vector_tiles_are_gzipped_when_configured() {
		let dir = tempfile::tempdir().unwrap();
		let payload = b"not-really-mvt-but-bytes".to_vec();
		let generator = FakeGenerator::replying(Ok(TileReply::Present(payload.clone())));
		let state = test_state(Some(Arc::clone(&generator) as Arc<dyn TileGenerator>), 8, dir.path());
		let id = state
			.registry
			.create(&json!({
				"type": "vector",
				"compress_tiles": true,
				"layers": [{"name": "roads", "queries": [{"sql": "SELECT geom FROM roads"}]}]
			}))
			.await
			.unwrap();

		let router = build_router(Arc::clone(&state));
		let (status, headers, body) = get(&router, &format!("/api/tile/{id}/3/4/5.mvt")).await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(headers[header::CONTENT_TYPE.as_str()], "application/vnd.mapbox-vector-tile");
		assert_eq!(headers[header::CONTENT_ENCODING.as_str()], "gzip");

		let mut decoder = flate2::bufread::GzDecoder::new(body.as_slice());
		let mut decompressed = Vec::new();
		decoder.read_to_end(&mut decompressed).unwrap();
		assert_eq!(decompressed, payload);
	}

	#[tokio::test]
	async fn pre_gzipped_tiles_pass_through_with_the_encoding_header() {
		let dir = tempfile::tempdir().unwrap();
		let payload = b"vector-tile-payload".to_vec();
		let stored = compress_gzip(&payload).unwrap();
		let state = test_state(None, 8, dir.path());
		let id = state
			.registry
			.create(&json!({
				"type": "vector",
				"compress_tiles": true,
				"layers": [{"name": "roads", "queries": [{"sql": "SELECT geom FROM roads"}]}]
			}))
			.await
			.unwrap();

		// A cache hit of an archive-style row: the bytes are already gzipped.
		let tile_dir = dir.path().join(id.to_string()).join("3").join("4");
		std::fs::create_dir_all(&tile_dir).unwrap();
		std::fs::write(tile_dir.join("5.mvt"), &stored).unwrap();

		let router = build_router(Arc::clone(&state));
		let (status, headers, body) = get(&router, &format!("/api/tile/{id}/3/4/5.mvt")).await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(headers[header::CONTENT_ENCODING.as_str()], "gzip");
		// Passed through untouched, not compressed a second time.
		assert_eq!(body, stored);

		let mut decoder = flate2::bufread::GzDecoder::new(body.as_slice());
		let mut decompressed = Vec::new();
		decoder.read_to_end(&mut decompressed).unwrap();
		assert_eq!(decompressed, payload);
	}

	#[tokio::test]
	async fn datasource_crud_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let id = Uuid::new_v4();
		// A fully-specified document survives the round trip byte-for-byte.
		let document = json!({
			"id": id,
			"type": "vector",
			"store": "internal",
			"name": "osm",
			"minzoom": 0,
			"maxzoom": 14,
			"bounds": [5.0, 45.0, 15.0, 55.0],
			"layers": [{
				"name": "roads",
				"filter": "class = 'motorway'",
				"fields": ["class"],
				"geomField": "geom"
			}]
		});

		let (status, created) = send_json(&router, "POST", "/api/datasources", document.clone()).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(created["datasource_id"], json!(id));

		let (status, fetched) = send_json(&router, "GET", &format!("/api/datasources/{id}"), Value::Null).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(fetched, document);

		let (status, listed) = send_json(&router, "GET", "/api/datasources", Value::Null).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(listed, json!([document]));

		let mut updated = document.clone();
		updated["name"] = json!("osm-v2");
		let (status, _) = send_json(&router, "PUT", "/api/datasources", updated).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(state.registry.get(&id).unwrap().name.as_deref(), Some("osm-v2"));

		let (status, _) = send_json(&router, "DELETE", &format!("/api/datasources/{id}"), Value::Null).await;
		assert_eq!(status, StatusCode::OK);
		let (status, _) = send_json(&router, "GET", &format!("/api/datasources/{id}"), Value::Null).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn invalid_descriptor_answers_422_with_locations() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let (status, body) = send_json(
			&router,
			"POST",
			"/api/datasources",
			json!({"type": "raster", "file": "a.tif", "store": "cloud"}),
		)
		.await;

		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		assert_eq!(body["detail"][0]["location"], json!(["store"]));
		assert_eq!(body["detail"][0]["type"], json!("enum"));
	}

	#[tokio::test]
	async fn update_of_unknown_datasource_is_404() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let (status, _) = send_json(
			&router,
			"PUT",
			"/api/datasources",
			json!({"id": Uuid::new_v4(), "type": "raster", "file": "a.tif"}),
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn pyramid_for_unknown_datasource_is_404() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let (status, _) = send_json(
			&router,
			"POST",
			"/api/pyramid",
			json!({"datasource_id": Uuid::new_v4()}),
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn pyramid_without_a_queue_is_503() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let id = Uuid::new_v4();
		insert_raster(&state, id, json!([-180.0, -85.0, 180.0, 85.0])).await;
		let router = build_router(Arc::clone(&state));

		let (status, _) = send_json(&router, "POST", "/api/pyramid", json!({"datasource_id": id})).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn load_files_reports_counts() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let (status, report) = send_json(&router, "POST", "/api/datasources/load_files", Value::Null).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(report["load_vector_datasources"], json!(0));
		assert_eq!(report["load_raster_datasources"], json!(0));
		assert_eq!(report["errors"], json!([]));
	}

	#[tokio::test]
	async fn maintenance_without_a_pool() {
		let dir = tempfile::tempdir().unwrap();
		let state = test_state(None, 8, dir.path());
		let router = build_router(Arc::clone(&state));

		let (status, _) = send_json(&router, "POST", "/maintenance/add_workers", json!({"count": 2})).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		let (status, _) = send_json(&router, "POST", "/maintenance/reload_workers", Value::Null).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

		let (status, info) = send_json(&router, "GET", "/maintenance/info_workers", Value::Null).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(info, json!([]));
	}
}
