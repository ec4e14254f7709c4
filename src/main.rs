use anyhow::Result;
use gstreamer as gst;
use log::{error, info};
use mizva::api::{AppState, RestApi};
use mizva::config;
use mizva::db::repositories::cameras::CamerasRepository;
use mizva::db::repositories::events::EventsRepository;
use mizva::db::repositories::jobs::JobsRepository;
use mizva::db::repositories::settings::SettingsRepository;
use mizva::db::repositories::watchlist::WatchlistRepository;
use mizva::db::DatabaseService;
use mizva::ingest::{IngestContext, IngestSupervisor};
use mizva::jobs::{JobManager, JobRunner};
use mizva::media::gst_source::GstSourceOpener;
use mizva::media::SourceOpener;
use mizva::messaging::EventBroadcaster;
use mizva::recognition::onnx::OnnxFaceAnalyzer;
use mizva::recognition::{DetectionEngine, WatchlistGallery};
use mizva::services::{CameraRegistry, RuntimeSettings, WatchlistService};
use mizva::store::{EventStore, RetentionService, SnapshotCache, UploadStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Config file from the first argument or `MIZVA_CONFIG`
fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MIZVA_CONFIG").ok())
        .map(PathBuf::from)
}

async fn run_app() -> Result<()> {
    let config = config::load_config(config_path().as_deref())?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();
    info!("Starting Mizva face recognition service");

    // Initialize GStreamer
    gst::init()?;
    info!("GStreamer initialized successfully");

    let database = DatabaseService::new(&config.database).await?;
    let db_pool = database.pool.clone();

    for dir in [&config.storage.data_dir, &config.storage.uploads_dir] {
        std::fs::create_dir_all(dir)?;
    }

    let settings = Arc::new(
        RuntimeSettings::load(
            SettingsRepository::new(db_pool.clone()),
            &config.recognition,
            &config.retention,
        )
        .await?,
    );

    let analyzer = OnnxFaceAnalyzer::load(&config.recognition)?;
    let engine = DetectionEngine::new(Arc::new(analyzer));
    info!("Face models ready: {}", engine.model_name());

    let gallery = Arc::new(WatchlistGallery::default());
    let uploads = UploadStore::new(&config.storage);
    let watchlist = Arc::new(WatchlistService::new(
        WatchlistRepository::new(db_pool.clone()),
        gallery.clone(),
        engine.clone(),
        uploads.clone(),
    ));
    let enrolled = watchlist.reload_gallery().await?;
    info!("Watchlist loaded with {} embeddings", enrolled);

    let registry = Arc::new(CameraRegistry::new(
        CamerasRepository::new(db_pool.clone()),
        config.ingest.clone(),
        config.recognition.default_threshold,
    ));
    let snapshots = Arc::new(SnapshotCache::new());
    let broadcaster = Arc::new(EventBroadcaster::new(config.events.channel_capacity));
    let store = EventStore::new(
        EventsRepository::new(db_pool.clone()),
        &config.storage,
        settings.clone(),
    );
    let opener: Arc<dyn SourceOpener> = Arc::new(GstSourceOpener::new());

    let supervisor = Arc::new(IngestSupervisor::new(IngestContext {
        registry: registry.clone(),
        engine: engine.clone(),
        gallery: gallery.clone(),
        store: store.clone(),
        snapshots: snapshots.clone(),
        broadcaster: broadcaster.clone(),
        opener: opener.clone(),
        config: config.ingest.clone(),
    }));

    let runner = Arc::new(JobRunner::new(
        engine.clone(),
        gallery,
        opener,
        &config.storage.data_dir,
    ));
    let jobs = JobManager::start(JobsRepository::new(db_pool.clone()), runner, config.jobs.workers);
    jobs.recover().await?;

    let restarted = supervisor.restore().await?;
    info!("Camera registry restored, {} cameras running", restarted);

    let shutdown = CancellationToken::new();

    let retention = Arc::new(RetentionService::new(
        config.retention.clone(),
        EventsRepository::new(db_pool.clone()),
        &config.storage.data_dir,
        settings.clone(),
    ));
    retention.start(shutdown.clone()).await?;

    // Start the REST API
    let http_server = RestApi::new(
        &config.api,
        AppState {
            db_pool,
            registry,
            supervisor: supervisor.clone(),
            snapshots,
            broadcaster,
            store,
            uploads,
            settings,
            watchlist,
            engine,
            jobs: jobs.clone(),
            default_threshold: config.recognition.default_threshold,
            keep_alive: Duration::from_secs(config.events.keep_alive_secs),
        },
    );
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = http_server.run(server_shutdown).await {
            error!("API server failed: {}", e);
        }
    });
    info!("API server started");

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.cancel();
    supervisor.shutdown().await;
    info!("Camera workers stopped");
    jobs.shutdown().await;

    if let Err(e) = server.await {
        error!("API server task ended abnormally: {}", e);
    }

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_app()) {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
