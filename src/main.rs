use anyhow::{Context, Result};
use clap::Parser;
use grocery_cart_sync_lib::{
    db, logging, render, CartSyncConfig, CartSyncController, HttpCartApi, ModalityFilter,
    NoticeLevel, VERSION,
};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "grocery-cart-sync",
    version = VERSION,
    about = "Sync and show a grocery cart",
    long_about = None
)]
struct Cli {
    /// Show only ALL, PICKUP or DELIVERY items (persisted).
    #[arg(long)]
    filter: Option<ModalityFilter>,

    /// Import manual cart entries (`product_id[,quantity[,modality]]` per line).
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CartSyncConfig::from_env()?;
    let _log_guard = logging::init_logging(&config.log);

    info!("Starting grocery cart sync v{VERSION}");
    debug!(base_url = %config.base_url, "Using cart service");

    let db_state = match config.data_dir.as_deref() {
        Some(dir) => db::init(dir)?,
        None => db::init_in_memory()?,
    };
    let api = HttpCartApi::new(&config.base_url, config.request_timeout())?;
    let controller = CartSyncController::new(api, &config, db_state);

    let mut changes = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            debug!(?change, "Cart changed");
        }
    });
    let mut notices = controller.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice.level {
                NoticeLevel::Error => error!("{}", notice.message),
                NoticeLevel::Warning => warn!("{}", notice.message),
                NoticeLevel::Info | NoticeLevel::Success => info!("{}", notice.message),
            }
        }
    });

    if let Some(filter) = cli.filter {
        controller.set_filter(filter);
    }

    if let Err(e) = controller.fetch_remote_cart().await {
        warn!("Showing last saved cart: {e}");
    }

    if let Some(path) = cli.import {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report = controller.import_items(&text).await?;
        println!(
            "Imported {} item(s), skipped {} line(s)",
            report.imported,
            report.rejected.len()
        );
        for rejected in &report.rejected {
            println!("  line {}: {} ({})", rejected.line, rejected.content, rejected.reason);
        }
    }

    controller.settle().await;
    println!("{}", render::render_text(&controller.view()));
    Ok(())
}
