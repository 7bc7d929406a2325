//! The admission gate: a counting semaphore bounding concurrent generation
//! requests across the whole process.
//!
//! The gate is independent of worker fan-out. Acquisition never queues:
//! a saturated gate rejects immediately, which the router turns into 503.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct AdmissionGate {
	permits: Arc<Semaphore>,
	limit: usize,
}

impl AdmissionGate {
	pub fn new(limit: usize) -> AdmissionGate {
		AdmissionGate {
			permits: Arc::new(Semaphore::new(limit)),
			limit,
		}
	}

	/// Try to admit one generation request. `None` means the ceiling is
	/// reached; the caller must fail fast rather than wait.
	pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
		Arc::clone(&self.permits).try_acquire_owned().ok()
	}

	pub fn limit(&self) -> usize {
		self.limit
	}

	pub fn available(&self) -> usize {
		self.permits.available_permits()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_beyond_the_ceiling() {
		let gate = AdmissionGate::new(2);
		let first = gate.try_admit().unwrap();
		let _second = gate.try_admit().unwrap();
		assert!(gate.try_admit().is_none());
		assert_eq!(gate.available(), 0);

		drop(first);
		assert!(gate.try_admit().is_some());
	}

	#[test]
	fn permits_return_on_drop() {
		let gate = AdmissionGate::new(1);
		{
			let _permit = gate.try_admit().unwrap();
			assert_eq!(gate.available(), 0);
		}
		assert_eq!(gate.available(), 1);
	}
}
