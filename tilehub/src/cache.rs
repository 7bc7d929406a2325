//! Read-only tile cache.
//!
//! The disk artifact IS the cache: a per-datasource MBTiles archive
//! (`<root>/<id>.mbtiles`) and/or an on-disk tile tree
//! (`<root>/<id>/<z>/<x>/<y>.<ext>`). Lookup answers one of three states:
//! the tile bytes, "in the grid but empty" (a zero-length entry), or no
//! entry at all. Writes never go through this module; the generator owns
//! them and new tiles surface on the next lookup.

use anyhow::{Context, Result};
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use r2d2_sqlite::rusqlite::{OpenFlags, OptionalExtension};
use std::path::PathBuf;
use tilehub_core::{CacheLookup, TileAddress};
use uuid::Uuid;

pub struct TileCache {
	root: PathBuf,
	/// Lazily opened archive pools, one per datasource.
	archives: DashMap<Uuid, Pool<SqliteConnectionManager>>,
}

impl TileCache {
	pub fn new(root: impl Into<PathBuf>) -> TileCache {
		TileCache {
			root: root.into(),
			archives: DashMap::new(),
		}
	}

	/// Look one tile up. `Present` carries the stored bytes, `Empty` marks a
	/// zero-length entry, `Absent` means no archive row and no tree file.
	pub async fn lookup(&self, address: &TileAddress) -> Result<CacheLookup> {
		if let Some(found) = self.lookup_archive(address).await? {
			return Ok(found);
		}
		self.lookup_tree(address).await
	}

	async fn lookup_archive(&self, address: &TileAddress) -> Result<Option<CacheLookup>> {
		let pool = match self.archive_pool(address.datasource_id)? {
			Some(pool) => pool,
			None => return Ok(None),
		};

		let coord = address.coord;
		// SQLite access blocks; keep it off the async scheduler.
		let row: Option<Vec<u8>> = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
			let conn = pool.get()?;
			let mut stmt =
				conn.prepare_cached("SELECT tile_data FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?")?;
			// MBTiles stores rows in TMS order, flipped against XYZ.
			let flipped_y = (1u32 << coord.z) - 1 - coord.y;
			let data = stmt
				.query_row((coord.z as u32, coord.x, flipped_y), |row| row.get::<_, Vec<u8>>(0))
				.optional()?;
			Ok(data)
		})
		.await
		.context("archive lookup task failed")??;

		Ok(row.map(|bytes| {
			if bytes.is_empty() {
				CacheLookup::Empty
			} else {
				CacheLookup::Present(bytes)
			}
		}))
	}

	async fn lookup_tree(&self, address: &TileAddress) -> Result<CacheLookup> {
		let path = self.tree_path(address);
		match tokio::fs::read(&path).await {
			Ok(bytes) if bytes.is_empty() => Ok(CacheLookup::Empty),
			Ok(bytes) => Ok(CacheLookup::Present(bytes)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CacheLookup::Absent),
			Err(err) => Err(err).with_context(|| format!("reading cached tile '{}'", path.display())),
		}
	}

	fn archive_path(&self, datasource_id: Uuid) -> PathBuf {
		self.root.join(format!("{datasource_id}.mbtiles"))
	}

	fn tree_path(&self, address: &TileAddress) -> PathBuf {
		self
			.root
			.join(address.datasource_id.to_string())
			.join(address.coord.z.to_string())
			.join(address.coord.x.to_string())
			.join(format!("{}.{}", address.coord.y, address.format.extension()))
	}

	/// The memoized connection pool of a datasource's archive, or `None` if
	/// the archive file does not exist (yet).
	fn archive_pool(&self, datasource_id: Uuid) -> Result<Option<Pool<SqliteConnectionManager>>> {
		if let Some(pool) = self.archives.get(&datasource_id) {
			return Ok(Some(pool.clone()));
		}

		let path = self.archive_path(datasource_id);
		if !path.exists() {
			return Ok(None);
		}

		log::debug!("opening tile archive {}", path.display());
		let manager = SqliteConnectionManager::file(&path)
			.with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
		let pool = Pool::builder()
			.max_size(4)
			.build(manager)
			.with_context(|| format!("opening tile archive '{}'", path.display()))?;

		self.archives.insert(datasource_id, pool.clone());
		Ok(Some(pool))
	}
}
