use axum::Router;
use clap::Parser;
use orthotask::api::{self, AppState};
use orthotask::assets::AssetRetriever;
use orthotask::config::Config;
use orthotask::controller::TaskController;
use orthotask::persistence::{self, PersistenceManager};
use orthotask::uploads::UploadIngestor;
use orthotask::worker::{LocalNode, WorkerQueue};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "orthotask")]
#[command(about = "Processing task ingestion and asset service")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Data directory for task storage and the registry snapshot
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Registry snapshot interval in seconds
    #[arg(short, long, default_value = "60")]
    snapshot_interval: u64,

    /// Chunked upload session time-to-live in seconds
    #[arg(long, default_value = "86400")]
    upload_ttl: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("🚀 OrthoTask - task ingestion and asset service");
    info!("📁 Data directory: {:?}", args.data_dir);
    info!("⏱️  Snapshot interval: {}s", args.snapshot_interval);

    let mut config = Config::new(&args.data_dir);
    config.snapshot_interval_secs = args.snapshot_interval;
    config.upload_session_ttl_secs = args.upload_ttl;

    let persistence = PersistenceManager::new(config.clone());
    let store = match persistence.load_store() {
        Ok(store) => {
            info!("✅ Loaded {} task(s)", store.len());
            Arc::new(store)
        }
        Err(e) => {
            info!("⚠️  Failed to load registry: {}, starting fresh", e);
            Arc::new(orthotask::tasks::TaskStore::new())
        }
    };

    let ingestor = Arc::new(
        UploadIngestor::new(config.clone()).expect("failed to create upload temp directory"),
    );
    ingestor.clone().start_session_sweep();

    let queue = WorkerQueue::start(store.clone(), config.clone(), Arc::new(LocalNode));
    let controller = Arc::new(TaskController::new(
        config.clone(),
        store.clone(),
        ingestor,
        queue,
    ));
    let retriever = Arc::new(AssetRetriever::new(config));

    let snapshot_handle = persistence.start_background_snapshots(store.clone()).await;
    persistence::setup_shutdown_handler(persistence.clone(), store.clone()).await;

    let app = Router::new()
        .merge(api::routes(AppState {
            controller,
            retriever,
        }))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("🌐 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    snapshot_handle.abort();
}
