//! The worker pool: spawn, supervise, dispatch to and reload the generator
//! child processes of one dispatcher node.
//!
//! Each slot runs the configured backend runtime listening on a loopback
//! port. Supervision avoids platform signal semantics entirely: readiness is
//! probed over loopback HTTP (`GET /status`), graceful stop is requested over
//! loopback HTTP (`POST /shutdown`), and only a missed deadline leads to a
//! hard kill.
//!
//! Dispatch picks the ready slot with the least in-flight requests,
//! round-robin among ties. The admission gate (see [`gate`]) is enforced by
//! the router before a request ever reaches the pool.

pub mod gate;
pub mod slot;

pub use gate::AdmissionGate;
pub use slot::{SlotInfo, SlotState, WorkerSlot};

use crate::config::DispatcherConfig;
use crate::generate::{GenerateError, TileGenerator};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tilehub_core::{Datasource, TileAddress, TileReply};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::time::{Instant, sleep};

/// How long a fresh worker may take to answer its first readiness probe.
const STARTUP_WINDOW: Duration = Duration::from_secs(30);
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Spawn attempts per slot before giving up, with exponential backoff.
const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_BACKOFF: Duration = Duration::from_secs(1);
/// Poll interval while waiting for a draining slot to empty.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Deadline for a graceful exit before the hard kill.
const GRACEFUL_EXIT_DEADLINE: Duration = Duration::from_secs(5);

pub struct WorkerPool {
	config: Arc<DispatcherConfig>,
	client: reqwest::Client,
	slots: RwLock<Vec<Arc<WorkerSlot>>>,
	next_slot_id: AtomicU64,
	round_robin: AtomicUsize,
	reloading: AtomicBool,
	weak_self: Weak<WorkerPool>,
}

impl WorkerPool {
	fn new(config: Arc<DispatcherConfig>) -> Arc<WorkerPool> {
		Arc::new_cyclic(|weak_self| WorkerPool {
			client: reqwest::Client::new(),
			config,
			slots: RwLock::new(Vec::new()),
			next_slot_id: AtomicU64::new(0),
			round_robin: AtomicUsize::new(0),
			reloading: AtomicBool::new(false),
			weak_self: weak_self.clone(),
		})
	}

	/// Spawn `processes_workers` slots and wait until all are ready.
	pub async fn start(config: Arc<DispatcherConfig>) -> Result<Arc<WorkerPool>> {
		let pool = WorkerPool::new(config);
		let count = pool.config.processes_workers;
		pool.add_workers(count).await?;
		log::info!("worker pool started with {count} worker(s)");
		Ok(pool)
	}

	/// Grow the pool by `count` slots. New slots join routing once ready.
	pub async fn add_workers(&self, count: usize) -> Result<()> {
		for _ in 0..count {
			let slot = self.spawn_slot(0).await?;
			self.slots.write().push(slot);
		}
		Ok(())
	}

	/// Snapshot of all slots.
	pub fn info(&self) -> Vec<SlotInfo> {
		self.slots.read().iter().map(|slot| slot.info()).collect()
	}

	pub fn ready_workers(&self) -> usize {
		self
			.slots
			.read()
			.iter()
			.filter(|slot| slot.state() == SlotState::Ready)
			.count()
	}

	/// Rolling reload: drain and replace each slot sequentially.
	///
	/// A reload requested while another is in progress is rejected. A slot
	/// that cannot be drained within the configured budget keeps serving on
	/// its old generation; the reload continues with the next slot.
	pub async fn reload_all(&self) -> Result<(), ReloadRejected> {
		if self
			.reloading
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Err(ReloadRejected);
		}
		let _guard = ReloadFlag { pool: self };

		log::info!("rolling reload started");
		let snapshot: Vec<Arc<WorkerSlot>> = self.slots.read().clone();

		for old in snapshot {
			if old.state() != SlotState::Ready {
				continue;
			}
			old.set_state(SlotState::Draining);

			if !self.wait_drained(&old).await {
				log::warn!(
					"worker slot {} still has {} request(s) in flight after the drain budget; aborting its reload",
					old.slot_id,
					old.in_flight()
				);
				old.set_state(SlotState::Ready);
				continue;
			}

			self.stop_slot(&old).await;

			match self.spawn_slot(old.generation + 1).await {
				Ok(fresh) => self.replace_slot(&old, fresh),
				Err(err) => {
					log::error!("failed to respawn worker slot {}: {err:#}", old.slot_id);
					self.remove_slot(&old);
				}
			}
		}

		log::info!("rolling reload finished; {} worker(s) ready", self.ready_workers());
		Ok(())
	}

	/// Gracefully stop every slot concurrently, hard-killing on deadline.
	pub async fn terminate_all(&self) {
		let slots: Vec<Arc<WorkerSlot>> = self.slots.write().drain(..).collect();
		join_all(slots.iter().map(|slot| {
			slot.set_state(SlotState::Draining);
			self.stop_slot(slot)
		}))
		.await;
		log::info!("all workers terminated");
	}

	async fn wait_drained(&self, slot: &Arc<WorkerSlot>) -> bool {
		let deadline = Instant::now() + self.config.reload_drain_budget();
		while slot.in_flight() > 0 {
			if Instant::now() >= deadline {
				return false;
			}
			sleep(DRAIN_POLL_INTERVAL).await;
		}
		true
	}

	/// Ask the worker to stop over loopback HTTP, then enforce the deadline.
	async fn stop_slot(&self, slot: &Arc<WorkerSlot>) {
		let url = format!("http://127.0.0.1:{}/shutdown", slot.port);
		let _ = self
			.client
			.post(&url)
			.timeout(Duration::from_secs(2))
			.send()
			.await;
		if !slot.wait_exit(GRACEFUL_EXIT_DEADLINE).await {
			log::warn!("worker slot {} ignored the shutdown request; killing it", slot.slot_id);
		}
		slot.kill().await;
	}

	fn replace_slot(&self, old: &Arc<WorkerSlot>, fresh: Arc<WorkerSlot>) {
		let mut slots = self.slots.write();
		match slots.iter().position(|slot| slot.slot_id == old.slot_id) {
			Some(index) => slots[index] = fresh,
			None => slots.push(fresh),
		}
	}

	fn remove_slot(&self, old: &Arc<WorkerSlot>) {
		self.slots.write().retain(|slot| slot.slot_id != old.slot_id);
	}

	/// Spawn one slot with bounded retry; returns it in `Ready` state.
	async fn spawn_slot(&self, generation: u64) -> Result<Arc<WorkerSlot>> {
		let mut backoff = SPAWN_BACKOFF;
		let mut attempt = 0;
		loop {
			attempt += 1;
			match self.try_spawn(generation).await {
				Ok(slot) => return Ok(slot),
				Err(err) if attempt < SPAWN_ATTEMPTS => {
					log::warn!("worker spawn attempt {attempt} failed: {err:#}; retrying in {backoff:?}");
					sleep(backoff).await;
					backoff *= 2;
				}
				Err(err) => return Err(err),
			}
		}
	}

	async fn try_spawn(&self, generation: u64) -> Result<Arc<WorkerSlot>> {
		let port = free_loopback_port().await?;
		let slot_id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
		let program = self.config.backend.command();

		log::debug!("spawning worker slot {slot_id} ({program}) on port {port}");
		let child = Command::new(program)
			.arg("--port")
			.arg(port.to_string())
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.with_context(|| format!("spawning worker process '{program}'"))?;

		let slot = Arc::new(WorkerSlot::new(slot_id, port, generation));
		slot.attach(child).await;

		if let Err(err) = self.wait_ready(&slot).await {
			slot.kill().await;
			return Err(err);
		}
		slot.set_state(SlotState::Ready);
		log::info!("worker slot {slot_id} ready on port {port} (generation {generation})");
		Ok(slot)
	}

	async fn wait_ready(&self, slot: &Arc<WorkerSlot>) -> Result<()> {
		let url = format!("http://127.0.0.1:{}/status", slot.port);
		let deadline = Instant::now() + STARTUP_WINDOW;
		loop {
			match self.client.get(&url).timeout(STARTUP_PROBE_INTERVAL).send().await {
				Ok(response) if response.status().is_success() => return Ok(()),
				_ => {}
			}
			if Instant::now() >= deadline {
				bail!(
					"worker slot {} on port {} did not become ready within {:?}",
					slot.slot_id,
					slot.port,
					STARTUP_WINDOW
				);
			}
			sleep(STARTUP_PROBE_INTERVAL).await;
		}
	}

	fn choose_slot(&self) -> Option<Arc<WorkerSlot>> {
		let slots = self.slots.read();
		let ready: Vec<&Arc<WorkerSlot>> = slots.iter().filter(|slot| slot.state() == SlotState::Ready).collect();
		let in_flights: Vec<usize> = ready.iter().map(|slot| slot.in_flight()).collect();
		let index = pick_slot_index(&in_flights, self.round_robin.fetch_add(1, Ordering::Relaxed))?;
		Some(Arc::clone(ready[index]))
	}

	/// Forward one generation request to the best slot.
	pub async fn dispatch(&self, address: &TileAddress) -> Result<TileReply, GenerateError> {
		let slot = self
			.choose_slot()
			.ok_or_else(|| GenerateError::Worker("no ready worker".to_string()))?;
		let _in_flight = slot.begin_request();

		let url = format!("http://127.0.0.1:{}{}", slot.port, address.as_url_path());
		let response = self
			.client
			.get(&url)
			.timeout(self.config.worker_timeout())
			.send()
			.await;

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
				"backend answered {} for {address:?}",
				response.status()
			))),
			Err(err) if err.is_timeout() => Err(GenerateError::Timeout),
			Err(err) => {
				// The transport failed: if the process is gone this was a
				// crash mid-request and the slot must be respawned.
				if slot.wait_exit(Duration::ZERO).await {
					self.respawn_crashed(slot);
					Err(GenerateError::Crashed)
				} else {
					Err(GenerateError::Worker(err.to_string()))
				}
			}
		}
	}

	/// Respawn a crashed slot in the background; the failed request is NOT
	/// retried.
	fn respawn_crashed(&self, slot: Arc<WorkerSlot>) {
		slot.set_state(SlotState::Exited);
		log::warn!("worker slot {} crashed; respawning", slot.slot_id);
		let Some(pool) = self.weak_self.upgrade() else {
			return;
		};
		tokio::spawn(async move {
			slot.kill().await;
			match pool.spawn_slot(slot.generation).await {
				Ok(fresh) => pool.replace_slot(&slot, fresh),
				Err(err) => {
					log::error!("failed to respawn crashed worker slot {}: {err:#}", slot.slot_id);
					pool.remove_slot(&slot);
				}
			}
		});
	}
}

#[async_trait]
impl TileGenerator for WorkerPool {
	async fn generate(&self, datasource: &Datasource, address: &TileAddress) -> Result<TileReply, GenerateError> {
		log::trace!("pool generation for datasource {} at {:?}", datasource.id, address.coord);
		self.dispatch(address).await
	}
}

/// A rolling reload was requested while one was already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadRejected;

impl std::fmt::Display for ReloadRejected {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("a rolling reload is already in progress")
	}
}

impl std::error::Error for ReloadRejected {}

/// Clears the reload flag however `reload_all` returns.
struct ReloadFlag<'a> {
	pool: &'a WorkerPool,
}

impl Drop for ReloadFlag<'_> {
	fn drop(&mut self) {
		self.pool.reloading.store(false, Ordering::SeqCst);
	}
}

/// Least-in-flight selection with round-robin tie-break.
fn pick_slot_index(in_flights: &[usize], round_robin: usize) -> Option<usize> {
	let min = in_flights.iter().min().copied()?;
	let candidates: Vec<usize> = in_flights
		.iter()
		.enumerate()
		.filter(|(_, in_flight)| **in_flight == min)
		.map(|(index, _)| index)
		.collect();
	Some(candidates[round_robin % candidates.len()])
}

async fn free_loopback_port() -> Result<u16> {
	let listener = TcpListener::bind("127.0.0.1:0")
		.await
		.context("allocating a loopback port")?;
	Ok(listener.local_addr()?.port())
}

/// Fire a rolling reload at `reload_time` every `reload_periodicity_days`.
/// Returns `None` if no reload time is configured.
pub fn spawn_reload_schedule(pool: Arc<WorkerPool>) -> Option<tokio::task::JoinHandle<()>> {
	let (hours, minutes, seconds) = pool.config.reload_time_parts()?;
	let periodicity = Duration::from_secs(pool.config.reload_periodicity_days as u64 * 86_400);

	Some(tokio::spawn(async move {
		sleep(duration_until_wall_clock(hours, minutes, seconds)).await;
		loop {
			if let Err(err) = pool.reload_all().await {
				log::warn!("scheduled reload skipped: {err:#}");
			}
			sleep(periodicity).await;
		}
	}))
}

fn duration_until_wall_clock(hours: u8, minutes: u8, seconds: u8) -> Duration {
	let now = chrono::Local::now().naive_local();
	let target_time = chrono::NaiveTime::from_hms_opt(hours as u32, minutes as u32, seconds as u32)
		.expect("reload_time was validated");
	let mut next = now.date().and_time(target_time);
	if next <= now {
		next += chrono::Duration::days(1);
	}
	(next - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn least_in_flight_wins() {
		assert_eq!(pick_slot_index(&[3, 1, 2], 0), Some(1));
		assert_eq!(pick_slot_index(&[3, 1, 2], 7), Some(1));
	}

	#[test]
	fn round_robin_breaks_ties() {
		let picks: Vec<usize> = (0..4).map(|rr| pick_slot_index(&[0, 5, 0], rr).unwrap()).collect();
		assert_eq!(picks, vec![0, 2, 0, 2]);
	}

	#[test]
	fn empty_pool_picks_nothing() {
		assert_eq!(pick_slot_index(&[], 0), None);
	}

	#[tokio::test]
	async fn concurrent_reload_is_rejected() {
		let config = Arc::new(crate::config::DispatcherConfig::default());
		let pool = WorkerPool::new(config);

		pool.reloading.store(true, Ordering::SeqCst);
		assert_eq!(pool.reload_all().await.unwrap_err(), ReloadRejected);

		// The rejected call must not clear the running reload's flag.
		assert!(pool.reloading.load(Ordering::SeqCst));

		pool.reloading.store(false, Ordering::SeqCst);
		pool.reload_all().await.unwrap();
		assert!(!pool.reloading.load(Ordering::SeqCst));
	}

	#[test]
	fn next_wall_clock_is_within_a_day() {
		let wait = duration_until_wall_clock(0, 0, 0);
		assert!(wait <= Duration::from_secs(86_400));
	}
}
