//! Durable backlog commands (status, purge, drain).

use std::sync::Arc;
use std::time::Duration;

use harvest_config_and_utils::{Clock, HarvestConfig, Paths, SystemClock};
use harvest_pipeline::HarvestOrchestrator;
use harvest_store::{
    DurableStore, FileSessionFlagStore, SessionFlagStore, LAST_EVENT_COUNT_KEY,
    SESSION_ACTIVE_KEY,
};
use tracing::info;

/// Print the session flag and durable row counts.
pub fn show_status(paths: &Paths) -> anyhow::Result<()> {
    let flag_path = paths.session_flag_file();
    if flag_path.exists() {
        let flags = FileSessionFlagStore::open(&flag_path)?;
        let active = flags.get_flag(SESSION_ACTIVE_KEY)?;
        let events = flags.get_counter(LAST_EVENT_COUNT_KEY)?;
        println!("Session");
        println!("  Active:      {}", active);
        println!("  Last count:  {}", events);
    } else {
        println!("No session recorded");
    }

    let store_path = paths.store_file();
    if !store_path.exists() {
        println!("No durable store at {}", store_path.display());
        return Ok(());
    }

    let counts = DurableStore::open(&store_path)?.counts()?;
    println!("Durable backlog");
    println!("  Live:        {}", counts.live);
    println!("  On-demand:   {}", counts.on_demand);
    println!("  Store:       {}", store_path.display());
    Ok(())
}

/// Delete durable rows older than `days`.
pub fn purge(paths: &Paths, days: u64) -> anyhow::Result<()> {
    let store_path = paths.store_file();
    if !store_path.exists() {
        println!("No durable store at {}", store_path.display());
        return Ok(());
    }

    let age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
    let store = DurableStore::open(&store_path)?;
    let removed = store.purge_older_than(age, SystemClock.now_millis())?;
    info!(removed, days, "Purge complete");
    println!("Removed {} rows older than {} days", removed, days);
    Ok(())
}

/// Deliver the durable backlog once, then close the session cleanly.
pub async fn drain(config: HarvestConfig, paths: Paths) -> anyhow::Result<()> {
    if !config.crash_safety {
        println!("Crash safety is disabled, there is no durable backlog to drain");
        return Ok(());
    }

    let pipeline = HarvestOrchestrator::from_config(&config, &paths, Arc::new(SystemClock))?;
    let delivered = pipeline.drain_backlog().await;
    pipeline.on_terminate().await;

    let remaining = pipeline.stats().durable_rows.unwrap_or(0);
    info!(delivered, remaining, "Drain complete");
    println!("Delivered {} events, {} left in the durable store", delivered, remaining);
    Ok(())
}
