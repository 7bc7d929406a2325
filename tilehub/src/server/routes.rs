//! Router composition. Intentionally tiny and declarative: handlers live in
//! [`super::handlers`], lifecycle in [`super::DispatcherServer`].

use super::{AppState, handlers};
use axum::{
	Router,
	routing::{delete, get, post},
};
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/status", get(|| async { "ready!" }))
		.route("/api/tile/{id}/{z}/{x}/{y_ext}", get(handlers::serve_tile))
		.route(
			"/api/pyramid",
			post(handlers::post_pyramid).get(handlers::list_pyramid_jobs),
		)
		.route("/api/pyramid/{job_id}", delete(handlers::cancel_pyramid_job))
		.route(
			"/api/datasources",
			get(handlers::list_datasources)
				.post(handlers::create_datasource)
				.put(handlers::update_datasource),
		)
		.route("/api/datasources/load_files", post(handlers::load_files))
		.route("/api/datasources/reload_files", post(handlers::reload_files))
		.route(
			"/api/datasources/{id}",
			get(handlers::get_datasource).delete(handlers::delete_datasource),
		)
		.route(
			"/maintenance/add_workers",
			post(handlers::add_workers),
		)
		.route(
			"/maintenance/reload_workers",
			post(handlers::reload_workers).get(handlers::reload_workers),
		)
		.route(
			"/maintenance/terminate_workers",
			post(handlers::terminate_workers).get(handlers::terminate_workers),
		)
		.route("/maintenance/info_workers", get(handlers::info_workers))
		.with_state(state)
}
