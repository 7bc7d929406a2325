//! The persisted job model of the dispatcher's work queue.
//!
//! Jobs live in the relational `queue` table; the status column stores the
//! integer discriminants below. These values are frozen — changing them would
//! reinterpret persisted rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Pending = 0,
	Running = 1,
	Succeeded = 2,
	Failed = 3,
	Cancelled = 4,
}

impl JobStatus {
	pub fn as_i32(&self) -> i32 {
		*self as i32
	}

	pub fn from_i32(value: i32) -> Option<JobStatus> {
		Some(match value {
			0 => JobStatus::Pending,
			1 => JobStatus::Running,
			2 => JobStatus::Succeeded,
			3 => JobStatus::Failed,
			4 => JobStatus::Cancelled,
			_ => return None,
		})
	}

	/// Whether a job in this status still occupies its datasource (used for
	/// the pyramid idempotence check).
	pub fn is_active(&self) -> bool {
		matches!(self, JobStatus::Pending | JobStatus::Running)
	}
}

/// The payload of a queued job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDetail {
	PyramidBuild {
		datasource_id: Uuid,
		minzoom: u8,
		maxzoom: u8,
	},
}

impl JobDetail {
	pub fn datasource_id(&self) -> Uuid {
		match self {
			JobDetail::PyramidBuild { datasource_id, .. } => *datasource_id,
		}
	}
}

/// One row of the `queue` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueJob {
	pub job_id: Uuid,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub scheduled_for: DateTime<Utc>,
	pub failed_attempts: i32,
	pub status: JobStatus,
	pub detail: JobDetail,
}

/// Base of the exponential retry backoff.
pub const RETRY_BASE: Duration = Duration::from_secs(30);
/// Upper bound of the retry backoff.
pub const RETRY_CAP: Duration = Duration::from_secs(3600);
/// After this many failed attempts a job transitions to `failed`.
pub const MAX_ATTEMPTS: i32 = 5;

/// Delay before the next attempt: `RETRY_BASE × 2^failed_attempts`, capped.
pub fn retry_delay(failed_attempts: i32) -> Duration {
	let shift = failed_attempts.clamp(0, 30) as u32;
	let delay = RETRY_BASE.saturating_mul(1u32 << shift.min(20));
	delay.min(RETRY_CAP)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_integers_are_frozen() {
		assert_eq!(JobStatus::Pending.as_i32(), 0);
		assert_eq!(JobStatus::Running.as_i32(), 1);
		assert_eq!(JobStatus::Succeeded.as_i32(), 2);
		assert_eq!(JobStatus::Failed.as_i32(), 3);
		assert_eq!(JobStatus::Cancelled.as_i32(), 4);
		for value in 0..5 {
			assert_eq!(JobStatus::from_i32(value).unwrap().as_i32(), value);
		}
		assert_eq!(JobStatus::from_i32(5), None);
	}

	#[test]
	fn active_statuses() {
		assert!(JobStatus::Pending.is_active());
		assert!(JobStatus::Running.is_active());
		assert!(!JobStatus::Succeeded.is_active());
		assert!(!JobStatus::Failed.is_active());
		assert!(!JobStatus::Cancelled.is_active());
	}

	#[test]
	fn retry_delay_doubles_and_caps() {
		assert_eq!(retry_delay(0), Duration::from_secs(30));
		assert_eq!(retry_delay(1), Duration::from_secs(60));
		assert_eq!(retry_delay(2), Duration::from_secs(120));
		assert_eq!(retry_delay(10), RETRY_CAP);
		assert_eq!(retry_delay(30), RETRY_CAP);
	}

	#[test]
	fn detail_round_trip() {
		let detail = JobDetail::PyramidBuild {
			datasource_id: Uuid::new_v4(),
			minzoom: 0,
			maxzoom: 8,
		};
		let json = serde_json::to_value(&detail).unwrap();
		assert_eq!(json["kind"], "pyramid_build");
		let back: JobDetail = serde_json::from_value(json).unwrap();
		assert_eq!(back, detail);
	}
}
