//! Per-fingerprint request coalescing.
//!
//! The first request for a tile fingerprint becomes the leader and performs
//! the lookup/generation; every concurrent request for the same fingerprint
//! attaches as a follower and receives the leader's outcome. At most one
//! underlying generation call is ever in flight per fingerprint.
//!
//! The table is guarded by one short-held mutex; entry removal and waiter
//! completion happen under the same lock acquisition, so a follower can
//! never attach to an entry whose completion it will miss. If the leader's
//! future is dropped mid-work (client disconnect), a drop guard completes
//! the entry with a crash outcome so followers never hang.

use crate::generate::GenerateError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tilehub_core::TileReply;
use tokio::sync::oneshot;

pub type TileOutcome = Result<TileReply, GenerateError>;

#[derive(Default)]
pub struct SingleFlight {
	inflight: Mutex<HashMap<u64, Vec<oneshot::Sender<TileOutcome>>>>,
}

pub enum Flight {
	/// This request performs the work and must call [`LeaderTicket::complete`].
	Leader(LeaderTicket),
	/// Another request is already working on this fingerprint.
	Follower(oneshot::Receiver<TileOutcome>),
}

impl SingleFlight {
	pub fn new() -> Arc<SingleFlight> {
		Arc::new(SingleFlight::default())
	}

	/// Join the flight of a fingerprint: become the leader if none exists,
	/// otherwise attach as a follower (FIFO).
	pub fn join(self: &Arc<Self>, fingerprint: u64) -> Flight {
		let mut inflight = self.inflight.lock();
		match inflight.get_mut(&fingerprint) {
			Some(waiters) => {
				let (tx, rx) = oneshot::channel();
				waiters.push(tx);
				Flight::Follower(rx)
			}
			None => {
				inflight.insert(fingerprint, Vec::new());
				Flight::Leader(LeaderTicket {
					table: Arc::clone(self),
					fingerprint,
					completed: false,
				})
			}
		}
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.inflight.lock().len()
	}

	/// Followers currently attached to a fingerprint, `None` if no flight.
	#[cfg(test)]
	pub(crate) fn waiters(&self, fingerprint: u64) -> Option<usize> {
		self.inflight.lock().get(&fingerprint).map(|waiters| waiters.len())
	}

	fn finish(&self, fingerprint: u64, outcome: &TileOutcome) {
		let waiters = self.inflight.lock().remove(&fingerprint).unwrap_or_default();
		// Waiters were pushed in attach order; completing in the same order
		// keeps delivery FIFO per fingerprint.
		for waiter in waiters {
			// A follower whose client disconnected has dropped its receiver.
			let _ = waiter.send(outcome.clone());
		}
	}
}

pub struct LeaderTicket {
	table: Arc<SingleFlight>,
	fingerprint: u64,
	completed: bool,
}

impl LeaderTicket {
	/// Remove the entry and deliver `outcome` to every attached follower.
	pub fn complete(mut self, outcome: &TileOutcome) {
		self.completed = true;
		self.table.finish(self.fingerprint, outcome);
	}
}

impl Drop for LeaderTicket {
	fn drop(&mut self) {
		if !self.completed {
			self.table.finish(self.fingerprint, &Err(GenerateError::Crashed));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn followers_receive_the_leaders_outcome() {
		let table = SingleFlight::new();

		let leader = match table.join(42) {
			Flight::Leader(ticket) => ticket,
			Flight::Follower(_) => panic!("first join must lead"),
		};

		let mut followers = Vec::new();
		for _ in 0..10 {
			match table.join(42) {
				Flight::Leader(_) => panic!("only one leader per fingerprint"),
				Flight::Follower(rx) => followers.push(rx),
			}
		}

		leader.complete(&Ok(TileReply::Present(b"payload".to_vec())));

		for follower in followers {
			assert_eq!(follower.await.unwrap(), Ok(TileReply::Present(b"payload".to_vec())));
		}
		assert_eq!(table.len(), 0);
	}

	#[tokio::test]
	async fn distinct_fingerprints_lead_independently() {
		let table = SingleFlight::new();
		let first = table.join(1);
		let second = table.join(2);
		assert!(matches!(first, Flight::Leader(_)));
		assert!(matches!(second, Flight::Leader(_)));
	}

	#[tokio::test]
	async fn completion_releases_the_fingerprint() {
		let table = SingleFlight::new();
		match table.join(7) {
			Flight::Leader(ticket) => ticket.complete(&Ok(TileReply::Empty)),
			Flight::Follower(_) => unreachable!(),
		}
		// A later request for the same fingerprint leads again.
		assert!(matches!(table.join(7), Flight::Leader(_)));
	}

	#[tokio::test]
	async fn dropped_leader_fails_followers_instead_of_hanging() {
		let table = SingleFlight::new();
		let leader = table.join(9);
		let follower = match table.join(9) {
			Flight::Follower(rx) => rx,
			Flight::Leader(_) => unreachable!(),
		};

		drop(leader);

		assert_eq!(follower.await.unwrap(), Err(GenerateError::Crashed));
		assert_eq!(table.len(), 0);
	}

	#[tokio::test]
	async fn delivery_is_fifo_per_fingerprint() {
		use std::sync::atomic::{AtomicUsize, Ordering};

		let table = SingleFlight::new();
		let leader = match table.join(5) {
			Flight::Leader(ticket) => ticket,
			Flight::Follower(_) => unreachable!(),
		};

		let sequence = Arc::new(AtomicUsize::new(0));
		let mut tasks = Vec::new();
		for expected in 0..5 {
			let rx = match table.join(5) {
				Flight::Follower(rx) => rx,
				Flight::Leader(_) => unreachable!(),
			};
			let sequence = Arc::clone(&sequence);
			tasks.push(tokio::spawn(async move {
				rx.await.unwrap().unwrap();
				// oneshot sends complete synchronously in push order, so the
				// observed wake order matches the attach order.
				sequence.fetch_max(expected, Ordering::SeqCst)
			}));
		}

		leader.complete(&Ok(TileReply::Empty));
		for task in tasks {
			task.await.unwrap();
		}
		assert_eq!(sequence.load(Ordering::SeqCst), 4);
	}
}
