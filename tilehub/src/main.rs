use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tilehub::cache::TileCache;
use tilehub::config::DispatcherConfig;
use tilehub::db::{self, DbSettings};
use tilehub::generate::TileGenerator;
use tilehub::pool::{WorkerPool, spawn_reload_schedule};
use tilehub::queue::{JobQueue, JobRunner, spawn_ticker};
use tilehub::registry::Registry;
use tilehub::server::{AppState, DispatcherServer};
use tilehub::topology::{NodeRole, RemoteNodes};

/// Jobs a master claims per queue tick.
const CLAIM_LIMIT: i64 = 4;

#[derive(Parser, Debug)]
#[command(
	author,
	version,
	about,
	propagate_version = true,
	disable_help_subcommand = true,
)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Start a dispatcher node: master with --address, worker node without
	Serve(ServeArgs),

	/// Start a cache-only node: no workers spawned, no database required
	ServeCache(ServeCacheArgs),

	/// Create the database tables and indexes
	Init,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
	/// Public bind address (HOST:PORT); makes this node the master
	#[arg(long)]
	address: Option<String>,

	#[command(flatten)]
	common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct ServeCacheArgs {
	#[command(flatten)]
	common: CommonArgs,
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
	/// Path to the dispatcher configuration file (JSON)
	#[arg(short, long, value_name = "FILE")]
	config: Option<PathBuf>,

	/// Root directory of the tile cache (MBTiles archives and tile trees)
	#[arg(long, value_name = "DIR", default_value = "tiles")]
	cache_dir: PathBuf,

	/// Directory holding `vector/` and `raster/` descriptor files
	#[arg(long, value_name = "DIR", default_value = "datasources")]
	datasource_dir: PathBuf,
}

impl CommonArgs {
	fn load_config(&self) -> Result<DispatcherConfig> {
		match &self.config {
			Some(path) => DispatcherConfig::from_path(path),
			None => Ok(DispatcherConfig::default()),
		}
	}

	fn vector_dir(&self) -> PathBuf {
		self.datasource_dir.join("vector")
	}

	fn raster_dir(&self) -> PathBuf {
		self.datasource_dir.join("raster")
	}
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	match cli.command {
		Commands::Serve(args) => run_serve(args),
		Commands::ServeCache(args) => run_serve_cache(args),
		Commands::Init => run_init(),
	}
}

fn init_logger(config: &DispatcherConfig) {
	env_logger::Builder::new()
		.filter_level(config.log_level.as_filter())
		.format_timestamp_millis()
		.init();
}

fn build_runtime(config: &DispatcherConfig) -> Result<tokio::runtime::Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(config.thread_workers)
		.max_blocking_threads(config.blocking_threads)
		.enable_all()
		.build()
		.context("building async runtime")
}

fn run_serve(args: ServeArgs) -> Result<()> {
	let mut config = args.common.load_config()?;
	if args.address.is_some() {
		config.address = args.address.clone();
		config.validate()?;
	}
	init_logger(&config);
	let config = Arc::new(config);

	let runtime = build_runtime(&config)?;
	runtime.block_on(serve(config, args.common))
}

async fn serve(config: Arc<DispatcherConfig>, common: CommonArgs) -> Result<()> {
	let role = NodeRole::from_config(&config);
	log::info!(
		"starting dispatcher as {}",
		if role.is_master() { "master" } else { "worker node" }
	);

	// No database, no dispatcher: serve-cache is the mode for that.
	let settings = DbSettings::from_env()?;
	let pool_db = db::connect(&settings).await?;

	let registry = Arc::new(Registry::new(
		Some(pool_db.clone()),
		common.vector_dir(),
		common.raster_dir(),
	));
	registry.load_db().await?;
	registry.load_files().await;

	let cache = Arc::new(TileCache::new(&common.cache_dir));
	let worker_pool = WorkerPool::start(Arc::clone(&config)).await?;

	let queue = if role.is_master() {
		let queue = JobQueue::new(pool_db.clone(), config.bind_address());
		queue.recover_own().await?;

		let runner = Arc::new(JobRunner {
			queue: Arc::clone(&queue),
			registry: Arc::clone(&registry),
			generator: Some(Arc::clone(&worker_pool) as Arc<dyn TileGenerator>),
			remotes: RemoteNodes::new(config.worker_timeout()),
		});
		spawn_ticker(runner, config.pull_job_interval(), CLAIM_LIMIT);
		Some(queue)
	} else {
		None
	};

	let state = AppState::with_pool(
		Arc::clone(&config),
		registry,
		cache,
		Arc::clone(&worker_pool),
		queue,
	);

	let mut server = DispatcherServer::new(state, config.bind_address());
	server.start().await?;
	spawn_reload_schedule(Arc::clone(&worker_pool));

	tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
	log::info!("shutdown requested");
	server.stop().await;
	worker_pool.terminate_all().await;
	Ok(())
}

fn run_serve_cache(args: ServeCacheArgs) -> Result<()> {
	let config = args.common.load_config()?;
	init_logger(&config);
	let config = Arc::new(config);

	let runtime = build_runtime(&config)?;
	runtime.block_on(async move {
		log::info!("starting cache-only dispatcher");

		let registry = Arc::new(Registry::new(None, args.common.vector_dir(), args.common.raster_dir()));
		registry.load_files().await;
		let cache = Arc::new(TileCache::new(&args.common.cache_dir));

		let state = AppState::cache_only(Arc::clone(&config), registry, cache);
		let mut server = DispatcherServer::new(state, config.bind_address());
		server.start().await?;

		tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
		log::info!("shutdown requested");
		server.stop().await;
		Ok(())
	})
}

fn run_init() -> Result<()> {
	let config = DispatcherConfig::default();
	init_logger(&config);

	let runtime = build_runtime(&config)?;
	runtime.block_on(async {
		let settings = DbSettings::from_env()?;
		let pool = db::connect(&settings).await?;
		db::init_schema(&pool).await
	})
}
