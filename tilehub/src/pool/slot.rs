//! One supervised generator process.
//!
//! A slot moves through `Starting → Ready → Draining → Exited`. Its
//! `generation` increments on every rolling reload, so operators can see at a
//! glance which processes survived the last reload. The in-flight counter is
//! what both load-aware dispatch and drain-waiting observe.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Child;
use tokio::sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
	Starting,
	Ready,
	Draining,
	Exited,
}

/// Snapshot of one slot, as returned by `/maintenance/info_workers`.
#[derive(Clone, Debug, Serialize)]
pub struct SlotInfo {
	pub pid: Option<u32>,
	pub state: SlotState,
	pub in_flight: usize,
	pub generation: u64,
}

pub struct WorkerSlot {
	pub slot_id: u64,
	pub port: u16,
	pub generation: u64,
	state: RwLock<SlotState>,
	in_flight: AtomicUsize,
	child: Mutex<Option<Child>>,
	pid: RwLock<Option<u32>>,
}

impl WorkerSlot {
	pub fn new(slot_id: u64, port: u16, generation: u64) -> WorkerSlot {
		WorkerSlot {
			slot_id,
			port,
			generation,
			state: RwLock::new(SlotState::Starting),
			in_flight: AtomicUsize::new(0),
			child: Mutex::new(None),
			pid: RwLock::new(None),
		}
	}

	pub fn state(&self) -> SlotState {
		*self.state.read()
	}

	pub fn set_state(&self, state: SlotState) {
		let mut current = self.state.write();
		if *current != state {
			log::debug!("worker slot {} (port {}): {:?} -> {:?}", self.slot_id, self.port, *current, state);
			*current = state;
		}
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::SeqCst)
	}

	/// Count a request against this slot for its whole lifetime.
	pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
		self.in_flight.fetch_add(1, Ordering::SeqCst);
		InFlightGuard {
			slot: Arc::clone(self),
		}
	}

	pub fn info(&self) -> SlotInfo {
		SlotInfo {
			pid: *self.pid.read(),
			state: self.state(),
			in_flight: self.in_flight(),
			generation: self.generation,
		}
	}

	pub async fn attach(&self, child: Child) {
		*self.pid.write() = child.id();
		*self.child.lock().await = Some(child);
	}

	/// Wait up to `deadline` for the process to exit on its own. Returns true
	/// if it did (or no process was attached).
	pub async fn wait_exit(&self, deadline: std::time::Duration) -> bool {
		let mut guard = self.child.lock().await;
		match guard.as_mut() {
			None => true,
			Some(child) => match tokio::time::timeout(deadline, child.wait()).await {
				Ok(_) => {
					guard.take();
					true
				}
				Err(_) => false,
			},
		}
	}

	/// Hard-kill the process and reap it.
	pub async fn kill(&self) {
		if let Some(mut child) = self.child.lock().await.take() {
			let _ = child.start_kill();
			let _ = child.wait().await;
		}
		self.set_state(SlotState::Exited);
	}
}

pub struct InFlightGuard {
	slot: Arc<WorkerSlot>,
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}
