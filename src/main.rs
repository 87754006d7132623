use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use domus::blocks::BlockRegistry;
use domus::bus::AddressBus;
use domus::config::Settings;
use domus::gateway::{Gateway, InboundFrame, KnxDriver, NullDriver};
use domus::remanent::RemanentStore;
use domus::scheduler::Runtime;
use domus::server::{self, AppState};
use domus::telegram::TelegramBroadcaster;

#[derive(Parser, Debug)]
#[command(name = "domus", about = "KNX/IP home-automation logic runtime")]
struct Args {
    /// Path to the settings file
    #[arg(long, default_value = "domus.toml")]
    config: std::path::PathBuf,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    if let Some(listen) = args.listen {
        settings.http_listen = listen;
    }
    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::create_dir_all(settings.custom_blocks_dir())?;

    info!(data_dir = %settings.data_dir.display(), "starting domus");

    // Address store: sqlite on disk, concurrent map in memory.
    let broadcaster = Arc::new(TelegramBroadcaster::new(settings.telegram_ring));
    let bus = Arc::new(AddressBus::new(Arc::clone(&broadcaster)));
    let addr_db = domus::persist::AddressDb::open(settings.addresses_db_path())?;
    for addr in addr_db.load_all().await? {
        bus.seed(addr);
    }
    info!(addresses = bus.len(), "address bus loaded");

    // Block types: built-ins plus the user module directory.
    let mut registry = BlockRegistry::with_builtins();
    let report = registry.load_from_path(&settings.custom_blocks_dir());
    info!(
        custom = report.loaded.len(),
        failed = report.failed.len(),
        "block registry ready"
    );

    // The KNX/IP tunnelling driver is an external collaborator. Without a
    // configured gateway the runtime works standalone: external writes fail
    // visibly, internal wiring is unaffected.
    let (_knx_tx, knx_rx) = mpsc::channel::<InboundFrame>(256);
    let driver: Arc<dyn KnxDriver> = match &settings.knx_gateway {
        Some(gateway) => {
            warn!(gateway, "KNX/IP driver not bundled, running without external bus");
            Arc::new(NullDriver)
        }
        None => Arc::new(NullDriver),
    };
    let gateway = Gateway::new(Arc::clone(&bus), driver);

    let remanent = RemanentStore::load(settings.remanent_path());

    let (handle, scheduler_task) = Runtime::start(
        settings.runtime_config(),
        Arc::clone(&bus),
        gateway,
        registry,
        remanent,
        Some(addr_db),
        knx_rx,
    );

    let listener = tokio::net::TcpListener::bind(&settings.http_listen).await?;
    info!(listen = %settings.http_listen, "HTTP API listening");

    let state = AppState {
        handle: handle.clone(),
        bus: Arc::clone(&bus),
        custom_blocks_dir: settings.custom_blocks_dir(),
    };
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    server::serve(listener, state, shutdown).await?;

    // Graceful stop: drain, checkpoint remanents, close persistence.
    handle.shutdown().await?;
    scheduler_task.await?;
    info!("domus stopped");
    Ok(())
}
