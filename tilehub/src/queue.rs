//! The durable job queue and the pyramid build runner.
//!
//! Jobs are rows in the `queue` table. Masters coordinate exclusively
//! through the row claim: `claim_due` flips `pending` rows to `running`
//! inside one statement using `FOR UPDATE SKIP LOCKED`, stamping the
//! claiming node's identity into the job detail, so no job ever runs on two
//! masters at once. A background ticker in every master wakes on the
//! configured poll interval, claims due jobs and executes them.
//!
//! Retry policy: a transient execution failure re-queues the job with
//! exponential backoff (`retry_delay`); after `MAX_ATTEMPTS` failed attempts
//! it is marked `failed`.

use crate::db;
use crate::generate::TileGenerator;
use crate::registry::Registry;
use crate::topology::RemoteNodes;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tilehub_core::job::{MAX_ATTEMPTS, retry_delay};
use tilehub_core::{Datasource, JobDetail, JobStatus, QueueJob, TileAddress, TileCoord, TileFormat};
use uuid::Uuid;

/// Tiles processed between two cancellation checks during a pyramid walk.
const CANCEL_CHECK_INTERVAL: u64 = 64;

pub struct JobQueue {
	pool: PgPool,
	/// Identity stamped into claimed jobs; the master's public address.
	identity: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
	Succeeded,
	Failed,
	Retry(Duration),
}

impl JobQueue {
	pub fn new(pool: PgPool, identity: impl Into<String>) -> Arc<JobQueue> {
		Arc::new(JobQueue {
			pool,
			identity: identity.into(),
		})
	}

	pub async fn enqueue(&self, detail: &JobDetail, scheduled_for: DateTime<Utc>) -> Result<Uuid> {
		let job_id = Uuid::new_v4();
		let detail = serde_json::to_value(detail).context("serializing job detail")?;
		db::with_retry("enqueue job", || {
			let pool = self.pool.clone();
			let detail = detail.clone();
			async move {
				sqlx::query(
					"INSERT INTO queue (job_id, created_at, updated_at, scheduled_for, failed_attempts, status, job_detail)
					 VALUES ($1, now(), now(), $2, 0, $3, $4)",
				)
				.bind(job_id.to_string())
				.bind(scheduled_for)
				.bind(JobStatus::Pending.as_i32())
				.bind(detail)
				.execute(&pool)
				.await
			}
		})
		.await?;
		log::info!("enqueued job {job_id} for {scheduled_for}");
		Ok(job_id)
	}

	/// Claim up to `limit` due jobs: atomically flip them from `pending` to
	/// `running` and return them. `SKIP LOCKED` keeps concurrent masters from
	/// claiming the same row.
	pub async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<QueueJob>> {
		let rows = db::with_retry("claim due jobs", || {
			let pool = self.pool.clone();
			let identity = self.identity.clone();
			async move {
				sqlx::query(
					"UPDATE queue
					 SET status = $1, updated_at = now(),
						 job_detail = jsonb_set(job_detail, '{claimed_by}', to_jsonb($2::text))
					 WHERE id IN (
						SELECT id FROM queue
						WHERE status = $3 AND scheduled_for <= $4
						ORDER BY scheduled_for
						LIMIT $5
						FOR UPDATE SKIP LOCKED
					 )
					 RETURNING job_id, created_at, updated_at, scheduled_for, failed_attempts, status, job_detail",
				)
				.bind(JobStatus::Running.as_i32())
				.bind(identity)
				.bind(JobStatus::Pending.as_i32())
				.bind(now)
				.bind(limit)
				.fetch_all(&pool)
				.await
			}
		})
		.await?;

		rows.iter().map(job_from_row).collect()
	}

	pub async fn complete(&self, job_id: Uuid, outcome: JobOutcome) -> Result<()> {
		let (sql, scheduled_for) = match &outcome {
			JobOutcome::Succeeded => (
				"UPDATE queue SET status = 2, updated_at = now() WHERE job_id = $1",
				None,
			),
			JobOutcome::Failed => (
				"UPDATE queue SET status = 3, failed_attempts = failed_attempts + 1, updated_at = now()
				 WHERE job_id = $1",
				None,
			),
			JobOutcome::Retry(after) => (
				"UPDATE queue SET status = 0, failed_attempts = failed_attempts + 1,
					 scheduled_for = $2, updated_at = now()
				 WHERE job_id = $1",
				Some(Utc::now() + chrono::Duration::from_std(*after).unwrap_or(chrono::Duration::zero())),
			),
		};

		db::with_retry("complete job", || {
			let pool = self.pool.clone();
			async move {
				let mut query = sqlx::query(sql).bind(job_id.to_string());
				if let Some(when) = scheduled_for {
					query = query.bind(when);
				}
				query.execute(&pool).await
			}
		})
		.await?;
		log::info!("job {job_id} completed with {outcome:?}");
		Ok(())
	}

	pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<QueueJob>> {
		let rows = db::with_retry("list jobs", || {
			let pool = self.pool.clone();
			async move {
				match status {
					Some(status) => {
						sqlx::query(
							"SELECT job_id, created_at, updated_at, scheduled_for, failed_attempts, status, job_detail
							 FROM queue WHERE status = $1 ORDER BY scheduled_for",
						)
						.bind(status.as_i32())
						.fetch_all(&pool)
						.await
					}
					None => {
						sqlx::query(
							"SELECT job_id, created_at, updated_at, scheduled_for, failed_attempts, status, job_detail
							 FROM queue ORDER BY scheduled_for",
						)
						.fetch_all(&pool)
						.await
					}
				}
			}
		})
		.await?;
		rows.iter().map(job_from_row).collect()
	}

	/// Flag a job as cancelled. A running job observes the flag at its next
	/// safe point; a pending job never starts.
	pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
		let result = db::with_retry("cancel job", || {
			let pool = self.pool.clone();
			async move {
				sqlx::query("UPDATE queue SET status = 4, updated_at = now() WHERE job_id = $1 AND status IN (0, 1)")
					.bind(job_id.to_string())
					.execute(&pool)
					.await
			}
		})
		.await?;
		Ok(result.rows_affected() > 0)
	}

	pub async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
		let status: Option<i32> = db::with_retry("read job status", || {
			let pool = self.pool.clone();
			async move {
				sqlx::query_scalar("SELECT status FROM queue WHERE job_id = $1")
					.bind(job_id.to_string())
					.fetch_optional(&pool)
					.await
			}
		})
		.await?;
		Ok(status == Some(JobStatus::Cancelled.as_i32()))
	}

	/// The active (pending or running) pyramid job of a datasource, if any.
	/// This is what makes `POST /api/pyramid` idempotent.
	pub async fn find_active_pyramid(&self, datasource_id: Uuid) -> Result<Option<Uuid>> {
		let job_id: Option<String> = db::with_retry("find active pyramid", || {
			let pool = self.pool.clone();
			async move {
				sqlx::query_scalar(
					"SELECT job_id FROM queue
					 WHERE status IN (0, 1)
						AND job_detail->>'kind' = 'pyramid_build'
						AND job_detail->>'datasource_id' = $1
					 ORDER BY created_at
					 LIMIT 1",
				)
				.bind(datasource_id.to_string())
				.fetch_optional(&pool)
				.await
			}
		})
		.await?;
		job_id
			.map(|raw| Uuid::parse_str(&raw).context("parsing persisted job_id"))
			.transpose()
	}

	/// Re-queue jobs this node claimed before a crash. Each transition back
	/// to `pending` counts as a failed attempt.
	pub async fn recover_own(&self) -> Result<u64> {
		let result = db::with_retry("recover claimed jobs", || {
			let pool = self.pool.clone();
			let identity = self.identity.clone();
			async move {
				sqlx::query(
					"UPDATE queue
					 SET status = 0, failed_attempts = failed_attempts + 1, updated_at = now()
					 WHERE status = 1 AND job_detail->>'claimed_by' = $1",
				)
				.bind(identity)
				.execute(&pool)
				.await
			}
		})
		.await?;
		let recovered = result.rows_affected();
		if recovered > 0 {
			log::warn!("re-queued {recovered} job(s) left running by a previous instance");
		}
		Ok(recovered)
	}
}

fn job_from_row(row: &PgRow) -> Result<QueueJob> {
	let raw_id: String = row.try_get("job_id")?;
	let status: i32 = row.try_get("status")?;
	let detail: serde_json::Value = row.try_get("job_detail")?;
	Ok(QueueJob {
		job_id: Uuid::parse_str(&raw_id).context("parsing persisted job_id")?,
		created_at: row.try_get("created_at")?,
		updated_at: row.try_get("updated_at")?,
		scheduled_for: row.try_get("scheduled_for")?,
		failed_attempts: row.try_get("failed_attempts")?,
		status: JobStatus::from_i32(status).ok_or_else(|| anyhow!("unknown job status {status}"))?,
		detail: serde_json::from_value(detail).context("parsing job detail")?,
	})
}

/// How one job execution ended, before it is mapped onto a queue outcome.
#[derive(Debug)]
enum JobFailure {
	/// Worth retrying: worker trouble, remote node down, DB hiccup.
	Transient(String),
	/// Retrying cannot help: the datasource is gone or misconfigured.
	Fatal(String),
	/// The job was cancelled at a safe point; its status is already set.
	Cancelled,
}

/// Executes claimed jobs against the local pool or remote nodes.
pub struct JobRunner {
	pub queue: Arc<JobQueue>,
	pub registry: Arc<Registry>,
	pub generator: Option<Arc<dyn TileGenerator>>,
	pub remotes: RemoteNodes,
}

impl JobRunner {
	pub async fn run_job(&self, job: QueueJob) {
		let job_id = job.job_id;
		let outcome = match self.execute(&job).await {
			Ok(()) => JobOutcome::Succeeded,
			Err(JobFailure::Cancelled) => {
				log::info!("job {job_id} was cancelled");
				return;
			}
			Err(JobFailure::Fatal(reason)) => {
				log::error!("job {job_id} failed fatally: {reason}");
				JobOutcome::Failed
			}
			Err(JobFailure::Transient(reason)) => {
				log::warn!("job {job_id} failed transiently: {reason}");
				outcome_after_transient_failure(job.failed_attempts)
			}
		};
		if let Err(err) = self.queue.complete(job_id, outcome).await {
			log::error!("could not record the outcome of job {job_id}: {err:#}");
		}
	}

	async fn execute(&self, job: &QueueJob) -> Result<(), JobFailure> {
		match &job.detail {
			JobDetail::PyramidBuild {
				datasource_id,
				minzoom,
				maxzoom,
			} => self.build_pyramid(job.job_id, *datasource_id, *minzoom, *maxzoom).await,
		}
	}

	/// Walk the tile grid of the datasource across the zoom range and drive
	/// the generator tile by tile, checking the cancel flag between batches.
	async fn build_pyramid(
		&self,
		job_id: Uuid,
		datasource_id: Uuid,
		minzoom: u8,
		maxzoom: u8,
	) -> Result<(), JobFailure> {
		let datasource = self
			.registry
			.get(&datasource_id)
			.ok_or_else(|| JobFailure::Fatal(format!("datasource {datasource_id} no longer exists")))?;

		let remote;
		let generator: &dyn TileGenerator = match &datasource.upstream {
			Some(upstream) => {
				remote = self.remotes.node(upstream);
				&remote
			}
			None => match &self.generator {
				Some(generator) => generator.as_ref(),
				None => return Err(JobFailure::Fatal("this node has no worker pool".to_string())),
			},
		};

		let format = pyramid_format(&datasource);
		let mut generated: u64 = 0;

		for z in minzoom..=maxzoom {
			let (x_min, y_min, x_max, y_max) = datasource.bounds.tile_range(z);
			log::info!(
				"pyramid {job_id}: zoom {z}, {} tile(s)",
				(x_max - x_min + 1) as u64 * (y_max - y_min + 1) as u64
			);

			for x in x_min..=x_max {
				for y in y_min..=y_max {
					if generated % CANCEL_CHECK_INTERVAL == 0 && self.cancelled(job_id).await? {
						return Err(JobFailure::Cancelled);
					}

					let coord = TileCoord::new(z, x, y)
						.map_err(|err| JobFailure::Fatal(format!("invalid pyramid coordinate: {err}")))?;
					let address = TileAddress::new(datasource_id, coord, format);

					generator
						.generate(&datasource, &address)
						.await
						.map_err(|err| JobFailure::Transient(format!("generating {address:?}: {err}")))?;
					generated += 1;
				}
			}
		}

		log::info!("pyramid {job_id} finished: {generated} tile(s) across zoom {minzoom}..={maxzoom}");
		Ok(())
	}

	async fn cancelled(&self, job_id: Uuid) -> Result<bool, JobFailure> {
		self
			.queue
			.is_cancelled(job_id)
			.await
			.map_err(|err| JobFailure::Transient(format!("reading cancel flag: {err}")))
	}
}

/// The payload format a pyramid build requests for each tile.
fn pyramid_format(datasource: &Datasource) -> TileFormat {
	if datasource.is_raster() {
		TileFormat::Png
	} else {
		TileFormat::Mvt
	}
}

fn outcome_after_transient_failure(failed_attempts: i32) -> JobOutcome {
	if failed_attempts + 1 >= MAX_ATTEMPTS {
		JobOutcome::Failed
	} else {
		JobOutcome::Retry(retry_delay(failed_attempts))
	}
}

/// Wake every `interval`, claim due jobs and execute each in its own task.
pub fn spawn_ticker(runner: Arc<JobRunner>, interval: Duration, claim_limit: i64) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(interval).await;
			let jobs = match runner.queue.claim_due(Utc::now(), claim_limit).await {
				Ok(jobs) => jobs,
				Err(err) => {
					log::warn!("claiming due jobs failed: {err:#}");
					continue;
				}
			};
			for job in jobs {
				let runner = Arc::clone(&runner);
				tokio::spawn(async move {
					runner.run_job(job).await;
				});
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tilehub_core::descriptor::validate_document;

	#[test]
	fn transient_failures_back_off_then_fail() {
		assert_eq!(
			outcome_after_transient_failure(0),
			JobOutcome::Retry(Duration::from_secs(30))
		);
		assert_eq!(
			outcome_after_transient_failure(1),
			JobOutcome::Retry(Duration::from_secs(60))
		);
		assert_eq!(outcome_after_transient_failure(MAX_ATTEMPTS - 1), JobOutcome::Failed);
		assert_eq!(outcome_after_transient_failure(MAX_ATTEMPTS + 3), JobOutcome::Failed);
	}

	#[test]
	fn pyramid_format_follows_the_kind() {
		let raster = validate_document(&json!({"type": "raster", "file": "a.tif"})).unwrap();
		let vector = validate_document(&json!({
			"type": "vector",
			"layers": [{"name": "roads", "queries": [{"sql": "SELECT geom FROM roads"}]}]
		}))
		.unwrap();
		assert_eq!(pyramid_format(&raster), TileFormat::Png);
		assert_eq!(pyramid_format(&vector), TileFormat::Mvt);
	}

	#[test]
	fn claimed_job_detail_tolerates_the_identity_stamp() {
		let detail: JobDetail = serde_json::from_value(json!({
			"kind": "pyramid_build",
			"datasource_id": Uuid::nil(),
			"minzoom": 0,
			"maxzoom": 4,
			"claimed_by": "10.0.0.5:8000"
		}))
		.unwrap();
		assert_eq!(detail.datasource_id(), Uuid::nil());
	}
}
