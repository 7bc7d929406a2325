//! Geographic bounding boxes in lon/lat (WGS84) order `west, south, east, north`.
//!
//! The dispatcher uses bounds for two things: deciding whether a requested
//! tile lies inside a datasource's coverage (out-of-bounds requests never
//! reach a generator) and walking the tile grid of a zoom level during a
//! pyramid build.

use crate::TileCoord;
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Debug};

/// Latitude limit of the WebMercator projection.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 4]", try_from = "[f64; 4]")]
pub struct GeoBBox {
	pub west: f64,
	pub south: f64,
	pub east: f64,
	pub north: f64,
}

impl GeoBBox {
	/// The full WebMercator world.
	pub const WORLD: GeoBBox = GeoBBox {
		west: -180.0,
		south: -MAX_MERCATOR_LAT,
		east: 180.0,
		north: MAX_MERCATOR_LAT,
	};

	pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<GeoBBox> {
		ensure!(west <= east, "west ({west}) must be <= east ({east})");
		ensure!(south <= north, "south ({south}) must be <= north ({north})");
		ensure!(west >= -180.0 && east <= 180.0, "longitudes must be within [-180, 180]");
		ensure!(south >= -90.0 && north <= 90.0, "latitudes must be within [-90, 90]");
		Ok(GeoBBox {
			west,
			south,
			east,
			north,
		})
	}

	/// Construct without range checks. Only for values already known valid,
	/// e.g. the geo box of a valid tile coordinate.
	pub fn new_unchecked(west: f64, south: f64, east: f64, north: f64) -> GeoBBox {
		GeoBBox {
			west,
			south,
			east,
			north,
		}
	}

	pub fn intersects(&self, other: &GeoBBox) -> bool {
		self.west < other.east && other.west < self.east && self.south < other.north && other.south < self.north
	}

	/// Whether the given tile overlaps these bounds.
	pub fn contains_tile(&self, coord: &TileCoord) -> bool {
		self.intersects(&coord.as_geo_bbox())
	}

	/// The inclusive `(x_min, y_min, x_max, y_max)` tile range covering these
	/// bounds at zoom `z`. Used by pyramid builds to walk the grid.
	pub fn tile_range(&self, z: u8) -> (u32, u32, u32, u32) {
		let n = 2f64.powi(z as i32);
		let max_index = (n as u32) - 1;
		let x_min = lon_to_tile_x(self.west, n).min(max_index);
		let x_max = lon_to_tile_x(self.east, n).min(max_index);
		let y_min = lat_to_tile_y(self.north, n).min(max_index);
		let y_max = lat_to_tile_y(self.south, n).min(max_index);
		(x_min, y_min, x_max, y_max)
	}
}

fn lon_to_tile_x(lon: f64, n: f64) -> u32 {
	(((lon + 180.0) / 360.0 * n).floor().max(0.0)) as u32
}

fn lat_to_tile_y(lat: f64, n: f64) -> u32 {
	let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
	(((1.0 - lat.tan().asinh() / PI) / 2.0 * n).floor().max(0.0)) as u32
}

impl Default for GeoBBox {
	fn default() -> GeoBBox {
		GeoBBox::WORLD
	}
}

impl Debug for GeoBBox {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"GeoBBox[{}, {}, {}, {}]",
			self.west, self.south, self.east, self.north
		)
	}
}

impl From<GeoBBox> for [f64; 4] {
	fn from(bbox: GeoBBox) -> [f64; 4] {
		[bbox.west, bbox.south, bbox.east, bbox.north]
	}
}

impl TryFrom<[f64; 4]> for GeoBBox {
	type Error = anyhow::Error;

	fn try_from(values: [f64; 4]) -> Result<GeoBBox> {
		GeoBBox::new(values[0], values[1], values[2], values[3])
	}
}
