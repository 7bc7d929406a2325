//! Master/worker topology.
//!
//! A dispatcher started with a public `address` is a master: it owns queue
//! execution and is the public entry point. A dispatcher started without is
//! a worker node: it serves `/api/tile/...` for the datasources whose
//! `(host, port)` point at it.
//!
//! Masters never talk to each other; the queue table's row claim is the only
//! coordination point. Remote forwarding is plain HTTP against the remote
//! node's tile endpoint, under the same per-request timeout as local workers,
//! and the response body is passed through unchanged.

use crate::config::DispatcherConfig;
use crate::generate::{GenerateError, TileGenerator};
use async_trait::async_trait;
use std::time::Duration;
use tilehub_core::{Datasource, TileAddress, TileReply, Upstream};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRole {
	Master { address: String },
	WorkerNode,
}

impl NodeRole {
	pub fn from_config(config: &DispatcherConfig) -> NodeRole {
		match &config.address {
			Some(address) => NodeRole::Master {
				address: address.clone(),
			},
			None => NodeRole::WorkerNode,
		}
	}

	pub fn is_master(&self) -> bool {
		matches!(self, NodeRole::Master { .. })
	}
}

/// Factory for remote-node generators sharing one HTTP client.
#[derive(Clone)]
pub struct RemoteNodes {
	client: reqwest::Client,
	timeout: Duration,
}

impl RemoteNodes {
	pub fn new(timeout: Duration) -> RemoteNodes {
		RemoteNodes {
			client: reqwest::Client::new(),
			timeout,
		}
	}

	pub fn node(&self, upstream: &Upstream) -> RemoteNode {
		RemoteNode {
			client: self.client.clone(),
			timeout: self.timeout,
			host: upstream.host.clone(),
			port: upstream.port,
		}
	}
}

/// One remote dispatcher node, addressed by the `(host, port)` of a
/// datasource descriptor.
pub struct RemoteNode {
	client: reqwest::Client,
	timeout: Duration,
	host: String,
	port: u16,
}

impl RemoteNode {
	fn tile_url(&self, address: &TileAddress) -> String {
		format!("http://{}:{}{}", self.host, self.port, address.as_url_path())
	}
}

#[async_trait]
impl TileGenerator for RemoteNode {
	async fn generate(&self, datasource: &Datasource, address: &TileAddress) -> Result<TileReply, GenerateError> {
		let url = self.tile_url(address);
		log::debug!("forwarding {:?} of datasource {} to {}", address.coord, datasource.id, url);

		let response = self.client.get(&url).timeout(self.timeout).send().await;
		match response {
			Ok(response) if response.status().as_u16() == 204 => Ok(TileReply::Empty),
			Ok(response) if response.status().is_success() => {
				let bytes = response
					.bytes()
					.await
					.map_err(|err| GenerateError::Worker(err.to_string()))?;
				if bytes.is_empty() {
					Ok(TileReply::Empty)
				} else {
					Ok(TileReply::Present(bytes.to_vec()))
				}
			}
			Ok(response) => Err(GenerateError::Worker(format!(
				"remote node {}:{} answered {}",
				self.host,
				self.port,
				response.status()
			))),
			Err(err) if err.is_timeout() => Err(GenerateError::Timeout),
			Err(err) => Err(GenerateError::Worker(err.to_string())),
		}
	}
}
