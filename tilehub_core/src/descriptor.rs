//! Datasource descriptors: validated documents describing how tiles for one
//! named dataset are produced or fetched.
//!
//! A descriptor arrives as a JSON document (from the HTTP API or from a
//! descriptor file on disk) and is validated into a [`Datasource`] with a
//! tagged [`DatasourceSource`] variant. Validation never panics and never
//! stops at the first problem: it collects [`ValidationIssue`]s with a
//! location path so clients can pinpoint the offending field.
//!
//! The five source variants:
//! - `RasterSingle` — one raster file.
//! - `RasterMosaic` — several raster files merged by a pixel selection method.
//! - `VectorFiltered` — vector layers described by `(filter, fields, geomField)`.
//! - `VectorSql` — vector layers backed by raw SQL queries.
//! - `VectorRemoteTiles` — tiles fetched from a remote tile URL.

use crate::{GeoBBox, TileFormat, coord::MAX_ZOOM};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

/// One validation problem, addressable by its location path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
	pub location: Vec<String>,
	pub message: String,
	#[serde(rename = "type")]
	pub kind: String,
}

impl ValidationIssue {
	pub fn new(location: Vec<String>, message: impl Into<String>, kind: &str) -> ValidationIssue {
		ValidationIssue {
			location,
			message: message.into(),
			kind: kind.to_string(),
		}
	}
}

/// Wrapper so a list of issues can travel through error positions that
/// require `Display` (e.g. serde's `try_from`).
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ValidationIssue>);

impl fmt::Display for ValidationErrors {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let messages: Vec<String> = self
			.0
			.iter()
			.map(|issue| format!("{}: {}", issue.location.join("."), issue.message))
			.collect();
		f.write_str(&messages.join("; "))
	}
}

impl std::error::Error for ValidationErrors {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
	Raster,
	Vector,
}

impl DatasourceKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			DatasourceKind::Raster => "raster",
			DatasourceKind::Vector => "vector",
		}
	}

	fn parse(value: &str) -> Option<DatasourceKind> {
		match value {
			"raster" => Some(DatasourceKind::Raster),
			"vector" => Some(DatasourceKind::Vector),
			_ => None,
		}
	}
}

/// How tiles of a datasource are stored and answered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
	Internal,
	Tiles,
	TileJson,
	MbTiles,
}

impl StoreMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			StoreMode::Internal => "internal",
			StoreMode::Tiles => "tiles",
			StoreMode::TileJson => "tilejson",
			StoreMode::MbTiles => "mbtiles",
		}
	}

	fn parse(value: &str) -> Option<StoreMode> {
		match value {
			"internal" => Some(StoreMode::Internal),
			"tiles" => Some(StoreMode::Tiles),
			"tilejson" => Some(StoreMode::TileJson),
			"mbtiles" => Some(StoreMode::MbTiles),
			_ => None,
		}
	}
}

/// Pixel selection of a raster mosaic where source files overlap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelSelection {
	#[serde(rename = "FirstMethod")]
	First,
	#[serde(rename = "HighestMethod")]
	Highest,
	#[serde(rename = "LowestMethod")]
	Lowest,
	#[serde(rename = "MeanMethod")]
	Mean,
}

impl PixelSelection {
	pub fn as_str(&self) -> &'static str {
		match self {
			PixelSelection::First => "FirstMethod",
			PixelSelection::Highest => "HighestMethod",
			PixelSelection::Lowest => "LowestMethod",
			PixelSelection::Mean => "MeanMethod",
		}
	}

	fn parse(value: &str) -> Option<PixelSelection> {
		match value {
			"FirstMethod" => Some(PixelSelection::First),
			"HighestMethod" => Some(PixelSelection::Highest),
			"LowestMethod" => Some(PixelSelection::Lowest),
			"MeanMethod" => Some(PixelSelection::Mean),
			_ => None,
		}
	}
}

/// Sample encoding of raster source data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterEncoding {
	Byte,
	Uint16,
	Int16,
	Uint32,
	Int32,
	Float32,
	Float64,
}

impl RasterEncoding {
	pub fn as_str(&self) -> &'static str {
		match self {
			RasterEncoding::Byte => "byte",
			RasterEncoding::Uint16 => "uint16",
			RasterEncoding::Int16 => "int16",
			RasterEncoding::Uint32 => "uint32",
			RasterEncoding::Int32 => "int32",
			RasterEncoding::Float32 => "float32",
			RasterEncoding::Float64 => "float64",
		}
	}

	fn parse(value: &str) -> Option<RasterEncoding> {
		match value {
			"byte" => Some(RasterEncoding::Byte),
			"uint16" => Some(RasterEncoding::Uint16),
			"int16" => Some(RasterEncoding::Int16),
			"uint32" => Some(RasterEncoding::Uint32),
			"int32" => Some(RasterEncoding::Int32),
			"float32" => Some(RasterEncoding::Float32),
			"float64" => Some(RasterEncoding::Float64),
			_ => None,
		}
	}
}

/// Resampling used when a pyramid build scales raster data between zooms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
	Nearest,
	Bilinear,
	Cubic,
	Average,
}

/// The remote worker node owning the source files of a datasource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
	pub host: String,
	pub port: u16,
}

/// Pyramid build settings of a datasource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PyramidSettings {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub minzoom: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub maxzoom: Option<u8>,
	/// Number of generator processes a build may use.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub workers: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resampling: Option<Resampling>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tile_size: Option<u32>,
}

/// One SQL-backed query of a vector layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerQuery {
	pub sql: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub minzoom: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub maxzoom: Option<u8>,
}

/// One layer of a vector datasource.
///
/// A layer is described either by `(filter, fields, geomField)` or by raw
/// `queries[].sql`, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorLayer {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub fields: Vec<String>,
	#[serde(default, rename = "geomField", skip_serializing_if = "Option::is_none")]
	pub geom_field: Option<String>,
	/// Table in the spatial database backing this layer.
	#[serde(default, rename = "storeLayer", skip_serializing_if = "Option::is_none")]
	pub store_layer: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub queries: Vec<LayerQuery>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub minzoom: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub maxzoom: Option<u8>,
}

impl VectorLayer {
	fn is_filtered(&self) -> bool {
		self.filter.is_some() || !self.fields.is_empty() || self.geom_field.is_some()
	}
}

/// Kind-specific payload of a datasource.
#[derive(Clone, Debug, PartialEq)]
pub enum DatasourceSource {
	RasterSingle {
		file: String,
		encoding: Option<RasterEncoding>,
	},
	RasterMosaic {
		files: Vec<String>,
		pixel_selection: PixelSelection,
		encoding: Option<RasterEncoding>,
	},
	VectorFiltered {
		layers: Vec<VectorLayer>,
	},
	VectorSql {
		layers: Vec<VectorLayer>,
	},
	VectorRemoteTiles {
		url: String,
	},
}

impl DatasourceSource {
	pub fn is_raster(&self) -> bool {
		matches!(
			self,
			DatasourceSource::RasterSingle { .. } | DatasourceSource::RasterMosaic { .. }
		)
	}

	pub fn layers(&self) -> &[VectorLayer] {
		match self {
			DatasourceSource::VectorFiltered { layers } | DatasourceSource::VectorSql { layers } => layers,
			_ => &[],
		}
	}
}

/// A validated datasource descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorDoc", into = "DescriptorDoc")]
pub struct Datasource {
	pub id: Uuid,
	pub name: Option<String>,
	pub description: Option<String>,
	pub attribution: Option<String>,
	pub store: StoreMode,
	pub upstream: Option<Upstream>,
	pub minzoom: u8,
	pub maxzoom: u8,
	pub bounds: GeoBBox,
	pub center: Option<[f64; 3]>,
	pub use_cache_only: bool,
	pub compress_tiles: bool,
	pub pyramid: PyramidSettings,
	pub source: DatasourceSource,
}

impl Datasource {
	pub fn kind(&self) -> DatasourceKind {
		if self.source.is_raster() {
			DatasourceKind::Raster
		} else {
			DatasourceKind::Vector
		}
	}

	pub fn is_raster(&self) -> bool {
		self.source.is_raster()
	}

	/// Whether requests for this payload format are valid for this datasource.
	pub fn accepts(&self, format: TileFormat) -> bool {
		format.compatible_with_raster(self.is_raster())
	}

	pub fn zoom_in_range(&self, z: u8) -> bool {
		z >= self.minzoom && z <= self.maxzoom
	}

	/// The canonical JSON document of this descriptor.
	pub fn to_document(&self) -> Value {
		serde_json::to_value(self).expect("descriptor serialization is infallible")
	}
}

/// Validate a raw JSON document into a [`Datasource`].
///
/// All problems are collected; the returned issue list is never empty on
/// failure.
pub fn validate_document(value: &Value) -> Result<Datasource, Vec<ValidationIssue>> {
	let doc: DescriptorDoc = serde_json::from_value(value.clone())
		.map_err(|err| vec![ValidationIssue::new(vec!["body".to_string()], err.to_string(), "shape")])?;
	Datasource::try_from(doc).map_err(|errors| errors.0)
}

/// Raw wire shape of a descriptor document. Closed-set fields are kept as
/// strings so violations become addressable issues instead of opaque serde
/// errors.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorDoc {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	id: Option<Uuid>,
	#[serde(rename = "type")]
	kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	store: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	attribution: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	host: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	port: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	minzoom: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	maxzoom: Option<u8>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	bounds: Option<[f64; 4]>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	center: Option<[f64; 3]>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	use_cache_only: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	compress_tiles: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pyramid: Option<PyramidSettings>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	file: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	files: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	encoding: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pixel_selection_method: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	layers: Option<Vec<VectorLayer>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	url: Option<String>,
}

impl TryFrom<DescriptorDoc> for Datasource {
	type Error = ValidationErrors;

	fn try_from(doc: DescriptorDoc) -> Result<Datasource, ValidationErrors> {
		let mut issues = Vec::new();

		let kind = DatasourceKind::parse(&doc.kind).unwrap_or_else(|| {
			issues.push(ValidationIssue::new(
				vec!["type".to_string()],
				format!("unknown datasource type '{}', expected 'raster' or 'vector'", doc.kind),
				"enum",
			));
			DatasourceKind::Raster
		});

		let store = match &doc.store {
			None => StoreMode::Internal,
			Some(raw) => StoreMode::parse(raw).unwrap_or_else(|| {
				issues.push(ValidationIssue::new(
					vec!["store".to_string()],
					format!("unknown store mode '{raw}', expected one of internal, tiles, tilejson, mbtiles"),
					"enum",
				));
				StoreMode::Internal
			}),
		};

		let encoding = match &doc.encoding {
			None => None,
			Some(raw) => match RasterEncoding::parse(raw) {
				Some(encoding) => Some(encoding),
				None => {
					issues.push(ValidationIssue::new(
						vec!["encoding".to_string()],
						format!("unknown raster encoding '{raw}'"),
						"enum",
					));
					None
				}
			},
		};

		let upstream = match (doc.host.clone(), doc.port) {
			(Some(host), Some(port)) => Some(Upstream { host, port }),
			(None, None) => None,
			(Some(_), None) => {
				issues.push(ValidationIssue::new(
					vec!["port".to_string()],
					"host given without port",
					"missing",
				));
				None
			}
			(None, Some(_)) => {
				issues.push(ValidationIssue::new(
					vec!["host".to_string()],
					"port given without host",
					"missing",
				));
				None
			}
		};

		let minzoom = doc.minzoom.unwrap_or(0);
		let maxzoom = doc.maxzoom.unwrap_or(MAX_ZOOM);
		if minzoom > maxzoom {
			issues.push(ValidationIssue::new(
				vec!["minzoom".to_string()],
				format!("minzoom ({minzoom}) must be <= maxzoom ({maxzoom})"),
				"range",
			));
		}
		if maxzoom > MAX_ZOOM {
			issues.push(ValidationIssue::new(
				vec!["maxzoom".to_string()],
				format!("maxzoom ({maxzoom}) must be <= {MAX_ZOOM}"),
				"range",
			));
		}

		let bounds = match doc.bounds {
			None => GeoBBox::WORLD,
			Some(values) => match GeoBBox::try_from(values) {
				Ok(bounds) => bounds,
				Err(err) => {
					issues.push(ValidationIssue::new(vec!["bounds".to_string()], err.to_string(), "range"));
					GeoBBox::WORLD
				}
			},
		};

		let source = build_source(&doc, kind, encoding, &mut issues);

		if !issues.is_empty() {
			return Err(ValidationErrors(issues));
		}

		Ok(Datasource {
			id: doc.id.unwrap_or_else(Uuid::new_v4),
			name: doc.name,
			description: doc.description,
			attribution: doc.attribution,
			store,
			upstream,
			minzoom,
			maxzoom,
			bounds,
			center: doc.center,
			use_cache_only: doc.use_cache_only,
			compress_tiles: doc.compress_tiles,
			pyramid: doc.pyramid.unwrap_or_default(),
			source,
		})
	}
}

fn build_source(
	doc: &DescriptorDoc,
	kind: DatasourceKind,
	encoding: Option<RasterEncoding>,
	issues: &mut Vec<ValidationIssue>,
) -> DatasourceSource {
	// Used as a placeholder when issues make a real variant impossible; the
	// caller returns Err in that case.
	let fallback = DatasourceSource::RasterSingle {
		file: String::new(),
		encoding: None,
	};

	match kind {
		DatasourceKind::Raster => {
			if doc.layers.is_some() {
				issues.push(ValidationIssue::new(
					vec!["layers".to_string()],
					"raster datasources cannot declare vector layers",
					"conflict",
				));
			}
			match (&doc.file, &doc.files) {
				(Some(file), None) => DatasourceSource::RasterSingle {
					file: file.clone(),
					encoding,
				},
				(None, Some(files)) => {
					if files.is_empty() {
						issues.push(ValidationIssue::new(
							vec!["files".to_string()],
							"mosaic file list must not be empty",
							"missing",
						));
					}
					let pixel_selection = match &doc.pixel_selection_method {
						None => PixelSelection::First,
						Some(raw) => PixelSelection::parse(raw).unwrap_or_else(|| {
							issues.push(ValidationIssue::new(
								vec!["pixel_selection_method".to_string()],
								format!(
									"unknown pixel selection method '{raw}', expected one of \
									 FirstMethod, HighestMethod, LowestMethod, MeanMethod"
								),
								"enum",
							));
							PixelSelection::First
						}),
					};
					DatasourceSource::RasterMosaic {
						files: files.clone(),
						pixel_selection,
						encoding,
					}
				}
				(Some(_), Some(_)) => {
					issues.push(ValidationIssue::new(
						vec!["files".to_string()],
						"declare either 'file' or 'files', not both",
						"conflict",
					));
					fallback
				}
				(None, None) => {
					issues.push(ValidationIssue::new(
						vec!["file".to_string()],
						"raster datasources need 'file' or 'files'",
						"missing",
					));
					fallback
				}
			}
		}
		DatasourceKind::Vector => {
			if doc.file.is_some() || doc.files.is_some() {
				issues.push(ValidationIssue::new(
					vec!["file".to_string()],
					"vector datasources cannot declare raster files",
					"conflict",
				));
			}
			match (&doc.url, &doc.layers) {
				(Some(url), None) => DatasourceSource::VectorRemoteTiles { url: url.clone() },
				(Some(_), Some(_)) => {
					issues.push(ValidationIssue::new(
						vec!["url".to_string()],
						"declare either 'url' or 'layers', not both",
						"conflict",
					));
					fallback
				}
				(None, Some(layers)) => build_vector_layers(layers, issues),
				(None, None) => {
					issues.push(ValidationIssue::new(
						vec!["layers".to_string()],
						"vector datasources need 'layers' or 'url'",
						"missing",
					));
					fallback
				}
			}
		}
	}
}

fn build_vector_layers(layers: &[VectorLayer], issues: &mut Vec<ValidationIssue>) -> DatasourceSource {
	if layers.is_empty() {
		issues.push(ValidationIssue::new(
			vec!["layers".to_string()],
			"layer list must not be empty",
			"missing",
		));
	}

	let mut any_sql = false;
	let mut any_filtered = false;

	for (index, layer) in layers.iter().enumerate() {
		let at = |field: &str| vec!["layers".to_string(), index.to_string(), field.to_string()];

		match (layer.is_filtered(), !layer.queries.is_empty()) {
			(true, true) => {
				issues.push(ValidationIssue::new(
					at("queries"),
					"a layer carries either (filter, fields, geomField) or queries, not both",
					"conflict",
				));
			}
			(false, false) => {
				issues.push(ValidationIssue::new(
					at("filter"),
					"a layer needs (filter, fields, geomField) or queries",
					"missing",
				));
			}
			(true, false) => any_filtered = true,
			(false, true) => any_sql = true,
		}

		if let Some(filter) = &layer.filter {
			if layer.fields.is_empty() {
				issues.push(ValidationIssue::new(
					at("fields"),
					"a filter requires a non-empty field list",
					"missing",
				));
			}
			let known: HashSet<&str> = layer.fields.iter().map(String::as_str).collect();
			for field in filter_fields(filter) {
				if Some(field.as_str()) == layer.geom_field.as_deref() {
					continue;
				}
				if !known.contains(field.as_str()) {
					issues.push(ValidationIssue::new(
						at("filter"),
						format!("filter references field '{field}' which is not in 'fields'"),
						"reference",
					));
				}
			}
		}

		for (query_index, query) in layer.queries.iter().enumerate() {
			if query.sql.trim().is_empty() {
				issues.push(ValidationIssue::new(
					vec![
						"layers".to_string(),
						index.to_string(),
						"queries".to_string(),
						query_index.to_string(),
						"sql".to_string(),
					],
					"sql must not be empty",
					"missing",
				));
			}
		}
	}

	if any_sql && !any_filtered {
		DatasourceSource::VectorSql {
			layers: layers.to_vec(),
		}
	} else {
		DatasourceSource::VectorFiltered {
			layers: layers.to_vec(),
		}
	}
}

static FILTER_TOKEN: LazyLock<regex::Regex> =
	LazyLock::new(|| regex::Regex::new(r#"'[^']*'|"[^"]*"|[A-Za-z_][A-Za-z0-9_]*"#).unwrap());

const FILTER_KEYWORDS: &[&str] = &[
	"and", "or", "not", "in", "like", "ilike", "is", "null", "true", "false", "between",
];

/// Field names referenced by a filter expression. Quoted string literals and
/// boolean/SQL keywords are skipped.
pub fn filter_fields(filter: &str) -> Vec<String> {
	let mut fields = Vec::new();
	let mut seen = HashSet::new();
	for token in FILTER_TOKEN.find_iter(filter) {
		let token = token.as_str();
		if token.starts_with('\'') || token.starts_with('"') {
			continue;
		}
		if FILTER_KEYWORDS.contains(&token.to_ascii_lowercase().as_str()) {
			continue;
		}
		if seen.insert(token.to_string()) {
			fields.push(token.to_string());
		}
	}
	fields
}

impl From<Datasource> for DescriptorDoc {
	fn from(datasource: Datasource) -> DescriptorDoc {
		let mut doc = DescriptorDoc {
			id: Some(datasource.id),
			kind: datasource.kind().as_str().to_string(),
			store: Some(datasource.store.as_str().to_string()),
			name: datasource.name,
			description: datasource.description,
			attribution: datasource.attribution,
			host: None,
			port: None,
			minzoom: Some(datasource.minzoom),
			maxzoom: Some(datasource.maxzoom),
			bounds: Some(datasource.bounds.into()),
			center: datasource.center,
			use_cache_only: datasource.use_cache_only,
			compress_tiles: datasource.compress_tiles,
			pyramid: (datasource.pyramid != PyramidSettings::default()).then_some(datasource.pyramid),
			file: None,
			files: None,
			encoding: None,
			pixel_selection_method: None,
			layers: None,
			url: None,
		};

		if let Some(upstream) = datasource.upstream {
			doc.host = Some(upstream.host);
			doc.port = Some(upstream.port);
		}

		match datasource.source {
			DatasourceSource::RasterSingle { file, encoding } => {
				doc.file = Some(file);
				doc.encoding = encoding.map(|e| e.as_str().to_string());
			}
			DatasourceSource::RasterMosaic {
				files,
				pixel_selection,
				encoding,
			} => {
				doc.files = Some(files);
				doc.pixel_selection_method = Some(pixel_selection.as_str().to_string());
				doc.encoding = encoding.map(|e| e.as_str().to_string());
			}
			DatasourceSource::VectorFiltered { layers } | DatasourceSource::VectorSql { layers } => {
				doc.layers = Some(layers);
			}
			DatasourceSource::VectorRemoteTiles { url } => {
				doc.url = Some(url);
			}
		}

		doc
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;
	use serde_json::json;

	fn issue_locations(issues: &[ValidationIssue]) -> Vec<String> {
		issues.iter().map(|issue| issue.location.join(".")).collect()
	}

	#[test]
	fn raster_single_document() {
		let datasource = validate_document(&json!({
			"type": "raster",
			"name": "elevation",
			"file": "dem/srtm.tif",
			"encoding": "int16",
			"minzoom": 2,
			"maxzoom": 12
		}))
		.unwrap();

		assert_eq!(datasource.kind(), DatasourceKind::Raster);
		assert_eq!(datasource.store, StoreMode::Internal);
		assert!(datasource.accepts(TileFormat::Png));
		assert!(!datasource.accepts(TileFormat::Mvt));
		match &datasource.source {
			DatasourceSource::RasterSingle { file, encoding } => {
				assert_eq!(file, "dem/srtm.tif");
				assert_eq!(*encoding, Some(RasterEncoding::Int16));
			}
			other => panic!("unexpected source {other:?}"),
		}
	}

	#[test]
	fn raster_mosaic_with_pixel_selection() {
		let datasource = validate_document(&json!({
			"type": "raster",
			"files": ["a.tif", "b.tif"],
			"pixel_selection_method": "MeanMethod"
		}))
		.unwrap();

		match &datasource.source {
			DatasourceSource::RasterMosaic { pixel_selection, .. } => {
				assert_eq!(*pixel_selection, PixelSelection::Mean);
			}
			other => panic!("unexpected source {other:?}"),
		}
	}

	#[test]
	fn unknown_pixel_selection_is_an_issue() {
		let issues = validate_document(&json!({
			"type": "raster",
			"files": ["a.tif"],
			"pixel_selection_method": "MedianMethod"
		}))
		.unwrap_err();
		assert_eq!(issue_locations(&issues), vec!["pixel_selection_method"]);
	}

	#[test]
	fn unknown_store_is_an_issue() {
		let issues = validate_document(&json!({
			"type": "raster",
			"file": "a.tif",
			"store": "cloud"
		}))
		.unwrap_err();
		assert_eq!(issue_locations(&issues), vec!["store"]);
	}

	#[test]
	fn unknown_top_level_field_is_rejected() {
		let issues = validate_document(&json!({
			"type": "raster",
			"file": "a.tif",
			"surprise": 1
		}))
		.unwrap_err();
		assert_eq!(issues.len(), 1);
		assert!(issues[0].message.contains("surprise"), "{}", issues[0].message);
	}

	#[test]
	fn vector_layer_cannot_mix_filter_and_sql() {
		let issues = validate_document(&json!({
			"type": "vector",
			"layers": [{
				"name": "roads",
				"filter": "class = 'motorway'",
				"fields": ["class"],
				"geomField": "geom",
				"queries": [{"sql": "SELECT * FROM roads"}]
			}]
		}))
		.unwrap_err();
		assert_eq!(issue_locations(&issues), vec!["layers.0.queries"]);
	}

	#[test]
	fn filter_fields_must_be_declared() {
		let issues = validate_document(&json!({
			"type": "vector",
			"layers": [{
				"name": "roads",
				"filter": "class = 'motorway' AND lanes > 2",
				"fields": ["class"],
				"geomField": "geom"
			}]
		}))
		.unwrap_err();
		assert_eq!(issue_locations(&issues), vec!["layers.0.filter"]);
		assert!(issues[0].message.contains("lanes"));
	}

	#[test]
	fn geom_field_is_exempt_from_the_field_check() {
		let datasource = validate_document(&json!({
			"type": "vector",
			"layers": [{
				"name": "roads",
				"filter": "class = 'motorway' AND geom IS NOT NULL",
				"fields": ["class"],
				"geomField": "geom"
			}]
		}))
		.unwrap();
		assert_eq!(datasource.kind(), DatasourceKind::Vector);
	}

	#[test]
	fn vector_sql_layers() {
		let datasource = validate_document(&json!({
			"type": "vector",
			"layers": [{
				"name": "buildings",
				"queries": [{"sql": "SELECT geom, height FROM buildings", "minzoom": 13}]
			}]
		}))
		.unwrap();
		assert!(matches!(datasource.source, DatasourceSource::VectorSql { .. }));
	}

	#[test]
	fn remote_tiles_datasource() {
		let datasource = validate_document(&json!({
			"type": "vector",
			"store": "tiles",
			"url": "https://tiles.example.org/{z}/{x}/{y}.mvt"
		}))
		.unwrap();
		assert!(matches!(datasource.source, DatasourceSource::VectorRemoteTiles { .. }));
	}

	#[test]
	fn host_without_port_is_an_issue() {
		let issues = validate_document(&json!({
			"type": "raster",
			"file": "a.tif",
			"host": "node-3"
		}))
		.unwrap_err();
		assert_eq!(issue_locations(&issues), vec!["port"]);
	}

	#[test]
	fn multiple_issues_are_collected() {
		let issues = validate_document(&json!({
			"type": "vector",
			"store": "cloud",
			"minzoom": 9,
			"maxzoom": 4,
			"layers": []
		}))
		.unwrap_err();
		let locations = issue_locations(&issues);
		assert!(locations.contains(&"store".to_string()));
		assert!(locations.contains(&"minzoom".to_string()));
		assert!(locations.contains(&"layers".to_string()));
	}

	#[test]
	fn document_round_trip() {
		let original = json!({
			"type": "vector",
			"name": "osm",
			"compress_tiles": true,
			"bounds": [5.0, 45.0, 15.0, 55.0],
			"minzoom": 0,
			"maxzoom": 14,
			"layers": [{
				"name": "roads",
				"filter": "class = 'motorway'",
				"fields": ["class", "ref"],
				"geomField": "geom",
				"storeLayer": "osm_roads"
			}]
		});
		let datasource = validate_document(&original).unwrap();
		let document = datasource.to_document();
		let reparsed = validate_document(&document).unwrap();
		assert_eq!(reparsed, datasource);
	}

	#[test]
	fn filter_field_extraction() {
		assert_eq!(
			filter_fields("class = 'primary' AND lanes > 2 OR name LIKE 'A%'"),
			vec!["class", "lanes", "name"]
		);
		assert_eq!(filter_fields("x IS NOT NULL"), vec!["x"]);
		assert!(filter_fields("'just a string'").is_empty());
	}
}
