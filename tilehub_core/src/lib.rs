//! # tilehub_core
//!
//! Core types shared by the tilehub dispatcher and its tooling:
//!
//! - [`TileCoord`] / [`TileAddress`] — tile pyramid coordinates and the full
//!   cache key, including the fingerprint used for request coalescing.
//! - [`TileFormat`] — the closed set of payload formats and their media types.
//! - [`GeoBBox`] — geographic bounds with tile containment tests.
//! - [`descriptor`] — the tagged datasource descriptor model and its validation.
//! - [`job`] — the persisted job model of the pyramid build queue.
//! - [`reply`] — the ternary outcomes of cache lookups and tile generation.
//!
//! This crate is deliberately free of I/O: everything here can be constructed
//! and checked in plain unit tests.

pub mod bbox;
pub mod coord;
pub mod descriptor;
pub mod format;
pub mod job;
pub mod reply;

pub use bbox::GeoBBox;
pub use coord::{TileAddress, TileCoord};
pub use descriptor::{
	Datasource, DatasourceKind, DatasourceSource, PixelSelection, PyramidSettings, RasterEncoding, StoreMode, Upstream,
	ValidationIssue, VectorLayer,
};
pub use format::TileFormat;
pub use job::{JobDetail, JobStatus, QueueJob};
pub use reply::{CacheLookup, TileReply};
