//! The datasource registry: an in-memory index of validated descriptors,
//! reloadable from descriptor files and persisted to the `datasource` table.
//!
//! File ingress and API ingress share one validation path
//! (`tilehub_core::descriptor::validate_document`). When a database pool is
//! present, vector layers that name a `storeLayer` are additionally checked
//! against the spatial database's information schema.

use crate::db;
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tilehub_core::descriptor::validate_document;
use tilehub_core::{Datasource, DatasourceKind, StoreMode, ValidationIssue};
use uuid::Uuid;

#[derive(Debug)]
pub enum RegistryError {
	NotFound,
	Invalid(Vec<ValidationIssue>),
	Db(anyhow::Error),
}

impl fmt::Display for RegistryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RegistryError::NotFound => f.write_str("datasource not found"),
			RegistryError::Invalid(issues) => write!(f, "descriptor validation failed with {} issue(s)", issues.len()),
			RegistryError::Db(err) => write!(f, "registry persistence failed: {err}"),
		}
	}
}

impl std::error::Error for RegistryError {}

/// Result of a `load_files` / `reload_files` scan.
#[derive(Debug, Default, Serialize)]
pub struct LoadReport {
	pub load_vector_datasources: usize,
	pub load_raster_datasources: usize,
	pub errors: Vec<String>,
}

pub struct Registry {
	datasources: DashMap<Uuid, Arc<Datasource>>,
	pool: Option<PgPool>,
	vector_dir: PathBuf,
	raster_dir: PathBuf,
}

impl Registry {
	pub fn new(pool: Option<PgPool>, vector_dir: impl Into<PathBuf>, raster_dir: impl Into<PathBuf>) -> Registry {
		Registry {
			datasources: DashMap::new(),
			pool,
			vector_dir: vector_dir.into(),
			raster_dir: raster_dir.into(),
		}
	}

	pub fn get(&self, id: &Uuid) -> Option<Arc<Datasource>> {
		self.datasources.get(id).map(|entry| Arc::clone(entry.value()))
	}

	pub fn list(&self) -> Vec<Arc<Datasource>> {
		let mut all: Vec<Arc<Datasource>> = self.datasources.iter().map(|entry| Arc::clone(entry.value())).collect();
		all.sort_by_key(|datasource| datasource.id);
		all
	}

	pub async fn create(&self, doc: &Value) -> Result<Uuid, RegistryError> {
		let datasource = self.validated(doc, None).await?;
		let id = datasource.id;
		self.persist(&datasource).await.map_err(RegistryError::Db)?;
		self.datasources.insert(id, Arc::new(datasource));
		log::info!("created datasource {id}");
		Ok(id)
	}

	pub async fn update(&self, id: Uuid, doc: &Value) -> Result<(), RegistryError> {
		if !self.datasources.contains_key(&id) {
			return Err(RegistryError::NotFound);
		}
		let datasource = self.validated(doc, Some(id)).await?;
		self.persist(&datasource).await.map_err(RegistryError::Db)?;
		self.datasources.insert(id, Arc::new(datasource));
		log::info!("updated datasource {id}");
		Ok(())
	}

	pub async fn delete(&self, id: &Uuid) -> Result<(), RegistryError> {
		if self.datasources.remove(id).is_none() {
			return Err(RegistryError::NotFound);
		}
		if let Some(pool) = &self.pool {
			let identifier = id.to_string();
			db::with_retry("delete datasource", || {
				let pool = pool.clone();
				let identifier = identifier.clone();
				async move {
					sqlx::query("DELETE FROM datasource WHERE identifier = $1")
						.bind(identifier)
						.execute(&pool)
						.await
				}
			})
			.await
			.map_err(RegistryError::Db)?;
		}
		// Cached tiles of the deleted id are invalidated lazily: lookups by
		// an unknown id simply miss.
		log::info!("deleted datasource {id}");
		Ok(())
	}

	/// Scan the vector and raster descriptor directories and upsert every
	/// valid document found there.
	pub async fn load_files(&self) -> LoadReport {
		self.load_files_filtered(None).await
	}

	/// Same as [`load_files`](Registry::load_files), restricted to the given ids.
	pub async fn reload_files(&self, ids: &[Uuid]) -> LoadReport {
		let wanted: HashSet<Uuid> = ids.iter().copied().collect();
		self.load_files_filtered(Some(&wanted)).await
	}

	async fn load_files_filtered(&self, wanted: Option<&HashSet<Uuid>>) -> LoadReport {
		let mut report = LoadReport::default();
		let directories = [
			(self.vector_dir.clone(), DatasourceKind::Vector),
			(self.raster_dir.clone(), DatasourceKind::Raster),
		];
		for (directory, expected_kind) in directories {
			for path in list_descriptor_files(&directory, &mut report.errors).await {
				match self.ingest_file(&path, expected_kind, wanted).await {
					Ok(true) => match expected_kind {
						DatasourceKind::Vector => report.load_vector_datasources += 1,
						DatasourceKind::Raster => report.load_raster_datasources += 1,
					},
					Ok(false) => {}
					Err(message) => report.errors.push(format!("{}: {message}", path.display())),
				}
			}
		}
		log::info!(
			"loaded descriptor files: {} vector, {} raster, {} error(s)",
			report.load_vector_datasources,
			report.load_raster_datasources,
			report.errors.len()
		);
		report
	}

	/// Returns Ok(true) if the file was ingested, Ok(false) if it was skipped
	/// by the id filter.
	async fn ingest_file(
		&self,
		path: &Path,
		expected_kind: DatasourceKind,
		wanted: Option<&HashSet<Uuid>>,
	) -> Result<bool, String> {
		let text = tokio::fs::read_to_string(path).await.map_err(|err| err.to_string())?;
		let doc: Value = serde_json::from_str(&text).map_err(|err| err.to_string())?;

		let datasource = self
			.validated(&doc, None)
			.await
			.map_err(|err| match err {
				RegistryError::Invalid(issues) => issues
					.iter()
					.map(|issue| format!("{}: {}", issue.location.join("."), issue.message))
					.collect::<Vec<_>>()
					.join("; "),
				other => other.to_string(),
			})?;

		if datasource.kind() != expected_kind {
			return Err(format!(
				"expected a {} datasource in this directory, found {}",
				expected_kind.as_str(),
				datasource.kind().as_str()
			));
		}
		if let Some(wanted) = wanted {
			if !wanted.contains(&datasource.id) {
				return Ok(false);
			}
		}

		let id = datasource.id;
		self.persist(&datasource).await.map_err(|err| err.to_string())?;
		self.datasources.insert(id, Arc::new(datasource));
		Ok(true)
	}

	/// Hydrate the in-memory index from the `datasource` table.
	pub async fn load_db(&self) -> Result<usize> {
		let pool = match &self.pool {
			Some(pool) => pool,
			None => return Ok(0),
		};

		let rows = db::with_retry("load datasources", || {
			let pool = pool.clone();
			async move { sqlx::query("SELECT data FROM datasource").fetch_all(&pool).await }
		})
		.await?;

		let mut loaded = 0;
		for row in rows {
			let data: Value = row.try_get("data").context("reading datasource.data")?;
			match serde_json::from_value::<Datasource>(data) {
				Ok(datasource) => {
					self.datasources.insert(datasource.id, Arc::new(datasource));
					loaded += 1;
				}
				Err(err) => log::warn!("skipping invalid persisted datasource: {err}"),
			}
		}
		log::info!("hydrated {loaded} datasource(s) from the database");
		Ok(loaded)
	}

	async fn validated(&self, doc: &Value, force_id: Option<Uuid>) -> Result<Datasource, RegistryError> {
		let mut datasource = validate_document(doc).map_err(RegistryError::Invalid)?;
		if let Some(id) = force_id {
			datasource.id = id;
		}

		let issues = self.information_schema_issues(&datasource).await.map_err(RegistryError::Db)?;
		if !issues.is_empty() {
			return Err(RegistryError::Invalid(issues));
		}
		Ok(datasource)
	}

	/// Check `storeLayer` tables and their field lists against the spatial
	/// database. Skipped without a pool (`serve-cache`).
	async fn information_schema_issues(&self, datasource: &Datasource) -> Result<Vec<ValidationIssue>> {
		let pool = match &self.pool {
			Some(pool) => pool,
			None => return Ok(Vec::new()),
		};

		let mut issues = Vec::new();
		for (index, layer) in datasource.source.layers().iter().enumerate() {
			let table = match &layer.store_layer {
				Some(table) => table.clone(),
				None => continue,
			};

			let rows = db::with_retry("information schema lookup", || {
				let pool = pool.clone();
				let table = table.clone();
				async move {
					sqlx::query("SELECT column_name FROM information_schema.columns WHERE table_name = $1")
						.bind(table)
						.fetch_all(&pool)
						.await
				}
			})
			.await?;

			let at = |field: &str| vec!["layers".to_string(), index.to_string(), field.to_string()];

			if rows.is_empty() {
				issues.push(ValidationIssue::new(
					at("storeLayer"),
					format!("table '{table}' does not exist in the spatial database"),
					"reference",
				));
				continue;
			}

			let columns: HashSet<String> = rows
				.iter()
				.map(|row| row.try_get::<String, _>("column_name"))
				.collect::<Result<_, _>>()
				.context("reading information_schema.columns")?;

			for field in layer
				.fields
				.iter()
				.chain(layer.geom_field.as_ref())
				.filter(|field| !columns.contains(field.as_str()))
			{
				issues.push(ValidationIssue::new(
					at("fields"),
					format!("column '{field}' does not exist in table '{table}'"),
					"reference",
				));
			}
		}
		Ok(issues)
	}

	async fn persist(&self, datasource: &Datasource) -> Result<()> {
		let pool = match &self.pool {
			Some(pool) => pool,
			None => return Ok(()),
		};

		let document = datasource.to_document();
		let bounds: [f64; 4] = datasource.bounds.into();
		let identifier = datasource.id.to_string();

		db::with_retry("persist datasource", || {
			let pool = pool.clone();
			let identifier = identifier.clone();
			let document = document.clone();
			let datasource = datasource.clone();
			let bounds = serde_json::json!(bounds);
			async move {
				sqlx::query(
					"INSERT INTO datasource
						(identifier, data_type, host, port, store_type, mbtiles, name, description,
						 attribution, minzoom, maxzoom, bounds, center, data)
					 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
					 ON CONFLICT (identifier) DO UPDATE SET
						data_type = EXCLUDED.data_type,
						host = EXCLUDED.host,
						port = EXCLUDED.port,
						store_type = EXCLUDED.store_type,
						mbtiles = EXCLUDED.mbtiles,
						name = EXCLUDED.name,
						description = EXCLUDED.description,
						attribution = EXCLUDED.attribution,
						minzoom = EXCLUDED.minzoom,
						maxzoom = EXCLUDED.maxzoom,
						bounds = EXCLUDED.bounds,
						center = EXCLUDED.center,
						data = EXCLUDED.data",
				)
				.bind(identifier)
				.bind(datasource.kind().as_str())
				.bind(datasource.upstream.as_ref().map(|upstream| upstream.host.clone()))
				.bind(datasource.upstream.as_ref().map(|upstream| upstream.port as i32))
				.bind(datasource.store.as_str())
				.bind(datasource.store == StoreMode::MbTiles)
				.bind(datasource.name.clone())
				.bind(datasource.description.clone())
				.bind(datasource.attribution.clone())
				.bind(datasource.minzoom as i32)
				.bind(datasource.maxzoom as i32)
				.bind(bounds)
				.bind(datasource.center.map(|center| serde_json::json!(center)))
				.bind(document)
				.execute(&pool)
				.await
			}
		})
		.await?;
		Ok(())
	}
}

async fn list_descriptor_files(directory: &Path, errors: &mut Vec<String>) -> Vec<PathBuf> {
	let mut files = Vec::new();
	let mut entries = match tokio::fs::read_dir(directory).await {
		Ok(entries) => entries,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return files,
		Err(err) => {
			errors.push(format!("{}: {err}", directory.display()));
			return files;
		}
	};
	loop {
		match entries.next_entry().await {
			Ok(Some(entry)) => {
				let path = entry.path();
				if path.extension().is_some_and(|ext| ext == "json") {
					files.push(path);
				}
			}
			Ok(None) => break,
			Err(err) => {
				errors.push(format!("{}: {err}", directory.display()));
				break;
			}
		}
	}
	files.sort();
	files
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn memory_registry() -> Registry {
		Registry::new(None, "/nonexistent/vector", "/nonexistent/raster")
	}

	fn raster_doc(name: &str) -> Value {
		json!({
			"type": "raster",
			"name": name,
			"file": format!("{name}.tif")
		})
	}

	#[tokio::test]
	async fn create_get_list_delete() {
		let registry = memory_registry();
		let id = registry.create(&raster_doc("dem")).await.unwrap();

		let datasource = registry.get(&id).unwrap();
		assert_eq!(datasource.name.as_deref(), Some("dem"));
		assert_eq!(registry.list().len(), 1);

		registry.delete(&id).await.unwrap();
		assert!(registry.get(&id).is_none());
		assert!(matches!(
			registry.delete(&id).await.unwrap_err(),
			RegistryError::NotFound
		));
	}

	#[tokio::test]
	async fn create_rejects_invalid_documents() {
		let registry = memory_registry();
		let err = registry
			.create(&json!({"type": "raster", "store": "cloud", "file": "a.tif"}))
			.await
			.unwrap_err();
		match err {
			RegistryError::Invalid(issues) => {
				assert_eq!(issues.len(), 1);
				assert_eq!(issues[0].location, vec!["store"]);
			}
			other => panic!("unexpected error {other:?}"),
		}
	}

	#[tokio::test]
	async fn update_requires_existing_id() {
		let registry = memory_registry();
		let missing = Uuid::new_v4();
		assert!(matches!(
			registry.update(missing, &raster_doc("dem")).await.unwrap_err(),
			RegistryError::NotFound
		));

		let id = registry.create(&raster_doc("dem")).await.unwrap();
		registry.update(id, &raster_doc("dem-v2")).await.unwrap();
		assert_eq!(registry.get(&id).unwrap().name.as_deref(), Some("dem-v2"));
	}

	#[tokio::test]
	async fn load_files_scans_both_directories() {
		let dir = tempfile::tempdir().unwrap();
		let vector_dir = dir.path().join("vector");
		let raster_dir = dir.path().join("raster");
		std::fs::create_dir_all(&vector_dir).unwrap();
		std::fs::create_dir_all(&raster_dir).unwrap();

		std::fs::write(
			vector_dir.join("roads.json"),
			serde_json::to_string(&json!({
				"type": "vector",
				"name": "roads",
				"layers": [{"name": "roads", "queries": [{"sql": "SELECT geom FROM roads"}]}]
			}))
			.unwrap(),
		)
		.unwrap();
		std::fs::write(
			raster_dir.join("dem.json"),
			serde_json::to_string(&raster_doc("dem")).unwrap(),
		)
		.unwrap();
		// A raster descriptor in the vector directory must be reported.
		std::fs::write(
			vector_dir.join("misplaced.json"),
			serde_json::to_string(&raster_doc("misplaced")).unwrap(),
		)
		.unwrap();
		std::fs::write(vector_dir.join("broken.json"), "{").unwrap();

		let registry = Registry::new(None, &vector_dir, &raster_dir);
		let report = registry.load_files().await;

		assert_eq!(report.load_vector_datasources, 1);
		assert_eq!(report.load_raster_datasources, 1);
		assert_eq!(report.errors.len(), 2);
		assert_eq!(registry.list().len(), 2);
	}

	#[tokio::test]
	async fn reload_files_is_restricted_to_ids() {
		let dir = tempfile::tempdir().unwrap();
		let raster_dir = dir.path().join("raster");
		std::fs::create_dir_all(&raster_dir).unwrap();

		let kept = Uuid::new_v4();
		let skipped = Uuid::new_v4();
		for (id, name) in [(kept, "kept"), (skipped, "skipped")] {
			std::fs::write(
				raster_dir.join(format!("{name}.json")),
				serde_json::to_string(&json!({
					"id": id,
					"type": "raster",
					"name": name,
					"file": format!("{name}.tif")
				}))
				.unwrap(),
			)
			.unwrap();
		}

		let registry = Registry::new(None, dir.path().join("vector"), &raster_dir);
		let report = registry.reload_files(&[kept]).await;

		assert_eq!(report.load_raster_datasources, 1);
		assert!(registry.get(&kept).is_some());
		assert!(registry.get(&skipped).is_none());
	}
}
