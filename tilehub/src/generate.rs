//! The generator capability: produce one tile for one address.
//!
//! Both the local worker pool and remote nodes satisfy this trait, so the
//! request router never needs to know which one serves a call. Tests use an
//! in-memory fake.

use async_trait::async_trait;
use std::fmt;
use tilehub_core::{Datasource, TileAddress, TileReply};

/// Failure modes of a generation call, mapped onto HTTP by the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerateError {
	/// The admission gate had no free permit. 503.
	Rejected,
	/// The worker did not answer within `timeout_worker_response`. 503.
	Timeout,
	/// The backend answered with an error. 500.
	Worker(String),
	/// The worker process died mid-request. 500.
	Crashed,
}

impl fmt::Display for GenerateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			GenerateError::Rejected => f.write_str("generation rejected: too many concurrent tile requests"),
			GenerateError::Timeout => f.write_str("generation timed out"),
			GenerateError::Worker(message) => write!(f, "worker error: {message}"),
			GenerateError::Crashed => f.write_str("worker crashed mid-request"),
		}
	}
}

impl std::error::Error for GenerateError {}

#[async_trait]
pub trait TileGenerator: Send + Sync {
	async fn generate(&self, datasource: &Datasource, address: &TileAddress) -> Result<TileReply, GenerateError>;
}
