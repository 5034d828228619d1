use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use comfortd::config::AppConfig;
use comfortd::cycle::CycleRunner;
use comfortd::server::{self, ServerState};
use comfortd::site::load_site_config;
use comfortd::store::CycleStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,comfortd=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let once = args.iter().any(|a| a == "--once");
    let print_prompt = args.iter().any(|a| a == "--print-prompt");

    let config = AppConfig::load();
    let site = load_site_config(&config.site_config_path)?;
    tracing::info!(
        site = %site.site.id,
        devices = site.devices.len(),
        dry_run = config.dry_run,
        "comfortd starting"
    );

    let store = Arc::new(
        CycleStore::open(&config.database_path)
            .with_context(|| format!("Failed to open store at {}", config.database_path))?,
    );
    let last_record = Arc::new(RwLock::new(None));
    let cycle_minutes = config.cycle_minutes;
    let port = config.port;
    let runner = Arc::new(CycleRunner::new(
        config,
        site,
        store,
        Arc::clone(&last_record),
    ));

    if print_prompt {
        println!("{}", runner.render_prompt().await);
        return Ok(());
    }

    if once {
        let record = runner.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let server_state = ServerState { last_record };
    tokio::spawn(async move {
        if let Err(e) = server::serve(server_state, port).await {
            tracing::error!("HTTP server failed: {e:#}");
        }
    });

    // A cycle that outlives its tick must not overlap the next one.
    let cycle_running = Arc::new(AtomicBool::new(false));
    let mut interval = tokio::time::interval(Duration::from_secs(cycle_minutes * 60));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if cycle_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("previous cycle still running, skipping this tick");
            continue;
        }
        let runner = Arc::clone(&runner);
        let guard = RunningGuard(Arc::clone(&cycle_running));
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = runner.run_once().await {
                tracing::error!("cycle failed: {e:#}");
            }
        });
    }
}

/// Clears the in-flight flag when the cycle task ends, including on panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
