//! The closed set of tile payload formats served by the dispatcher.
//!
//! A format is addressed by its file extension in tile URLs
//! (`/api/tile/{id}/{z}/{x}/{y}.{ext}`) and determines the `Content-Type` of
//! the response. Raster datasources produce image formats, vector datasources
//! produce MVT/PBF payloads; [`TileFormat::compatible_with_raster`] is used by
//! the router to reject mismatched requests.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
	Png,
	Jpg,
	Webp,
	Mvt,
	Pbf,
}

impl Display for TileFormat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.extension())
	}
}

impl TileFormat {
	/// Parse a format from a bare file extension (no leading dot).
	pub fn from_extension(ext: &str) -> Option<TileFormat> {
		Some(match ext {
			"png" => TileFormat::Png,
			"jpg" | "jpeg" => TileFormat::Jpg,
			"webp" => TileFormat::Webp,
			"mvt" => TileFormat::Mvt,
			"pbf" => TileFormat::Pbf,
			_ => return None,
		})
	}

	pub fn extension(&self) -> &'static str {
		match self {
			TileFormat::Png => "png",
			TileFormat::Jpg => "jpg",
			TileFormat::Webp => "webp",
			TileFormat::Mvt => "mvt",
			TileFormat::Pbf => "pbf",
		}
	}

	pub fn mime(&self) -> &'static str {
		match self {
			TileFormat::Png => "image/png",
			TileFormat::Jpg => "image/jpeg",
			TileFormat::Webp => "image/webp",
			TileFormat::Mvt => "application/vnd.mapbox-vector-tile",
			TileFormat::Pbf => "application/x-protobuf",
		}
	}

	pub fn is_raster(&self) -> bool {
		matches!(self, TileFormat::Png | TileFormat::Jpg | TileFormat::Webp)
	}

	pub fn is_vector(&self) -> bool {
		!self.is_raster()
	}

	/// Whether this format can be served by a datasource of the given kind.
	pub fn compatible_with_raster(&self, raster: bool) -> bool {
		if raster { self.is_raster() } else { self.is_vector() }
	}
}
