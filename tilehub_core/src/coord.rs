//! Tile pyramid coordinates and cache addressing.
//!
//! [`TileCoord`] is a `(z, x, y)` triple in the usual XYZ scheme (y grows
//! southwards). [`TileAddress`] adds the datasource id and payload format and
//! is the full key of a cached tile; its [`fingerprint`](TileAddress::fingerprint)
//! is the key of the request-coalescing table.

use crate::{GeoBBox, TileFormat};
use anyhow::{Result, ensure};
use std::{
	f64::consts::PI,
	fmt::{self, Debug},
	hash::{Hash, Hasher},
};
use uuid::Uuid;

/// Highest zoom level the dispatcher will address.
pub const MAX_ZOOM: u8 = 22;

#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct TileCoord {
	pub z: u8,
	pub x: u32,
	pub y: u32,
}

impl TileCoord {
	pub fn new(z: u8, x: u32, y: u32) -> Result<TileCoord> {
		ensure!(z <= MAX_ZOOM, "zoom level ({z}) must be <= {MAX_ZOOM}");
		let max = 1u32 << z;
		ensure!(x < max, "x ({x}) must be < {max} at zoom {z}");
		ensure!(y < max, "y ({y}) must be < {max} at zoom {z}");
		Ok(TileCoord { z, x, y })
	}

	pub fn is_valid(&self) -> bool {
		if self.z > MAX_ZOOM {
			return false;
		}
		let max = 1u32 << self.z;
		self.x < max && self.y < max
	}

	/// Geographic bounds of this tile in WebMercator lon/lat.
	pub fn as_geo_bbox(&self) -> GeoBBox {
		let n = 2f64.powi(self.z as i32);
		let west = (self.x as f64) / n * 360.0 - 180.0;
		let east = ((self.x + 1) as f64) / n * 360.0 - 180.0;
		let north = tile_edge_to_lat(self.y as f64, n);
		let south = tile_edge_to_lat((self.y + 1) as f64, n);
		GeoBBox::new_unchecked(west, south, east, north)
	}

}

fn tile_edge_to_lat(y: f64, n: f64) -> f64 {
	(PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees()
}

impl Debug for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "TileCoord({}/{}/{})", self.z, self.x, self.y)
	}
}

impl fmt::Display for TileCoord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}/{}", self.z, self.x, self.y)
	}
}

/// The full address of one cached or requested tile.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TileAddress {
	pub datasource_id: Uuid,
	pub coord: TileCoord,
	pub format: TileFormat,
}

impl TileAddress {
	pub fn new(datasource_id: Uuid, coord: TileCoord, format: TileFormat) -> TileAddress {
		TileAddress {
			datasource_id,
			coord,
			format,
		}
	}

	/// Stable in-process hash of the normalized address.
	///
	/// Two concurrent requests for the same tile always produce the same
	/// fingerprint, which is what the single-flight table keys on.
	pub fn fingerprint(&self) -> u64 {
		// DefaultHasher::new() uses fixed keys, so the value is stable for
		// the lifetime of the process.
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		self.hash(&mut hasher);
		hasher.finish()
	}

	/// The request path of this tile on a dispatcher node.
	pub fn as_url_path(&self) -> String {
		format!(
			"/api/tile/{}/{}/{}/{}.{}",
			self.datasource_id,
			self.coord.z,
			self.coord.x,
			self.coord.y,
			self.format.extension()
		)
	}
}

impl Debug for TileAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"TileAddress({} {}/{}/{}.{})",
			self.datasource_id, self.coord.z, self.coord.x, self.coord.y, self.format
		)
	}
}
