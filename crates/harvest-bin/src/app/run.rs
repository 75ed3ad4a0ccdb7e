//! Foreground pipeline run with a synthetic event stream.

use std::sync::Arc;
use std::time::Duration;

use harvest_config_and_utils::{HarvestConfig, Paths, SystemClock};
use harvest_pipeline::HarvestOrchestrator;
use serde_json::{json, Map, Value};
use tracing::info;

const EVENT_TYPES: [&str; 4] = [
    "CONTENT_START",
    "CONTENT_HEARTBEAT",
    "CONTENT_PAUSE",
    "CONTENT_RESUME",
];

/// Attributes of the `n`th synthetic event.
fn synthetic_attributes(view_id: &str, n: u64, live_percent: u8) -> Map<String, Value> {
    let live = (n * 37 % 100) < u64::from(live_percent.min(100));
    let mut attributes = Map::new();
    attributes.insert("viewId".to_string(), json!(view_id));
    attributes.insert("contentIsLive".to_string(), json!(live));
    attributes.insert("contentPlayhead".to_string(), json!(n * 1000));
    attributes.insert("actionName".to_string(), json!(EVENT_TYPES[(n % 4) as usize]));
    attributes
}

/// Run until Ctrl-C, then terminate the pipeline cleanly.
pub async fn run_pipeline(
    config: HarvestConfig,
    paths: Paths,
    event_interval_ms: u64,
    live_percent: u8,
) -> anyhow::Result<()> {
    let pipeline = HarvestOrchestrator::from_config(&config, &paths, Arc::new(SystemClock))?;
    let view_id = uuid::Uuid::new_v4().to_string();

    info!(
        region = %config.region,
        device_class = ?config.device_class,
        crash_safety = config.crash_safety,
        view_id = %view_id,
        "Harvester started"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(event_interval_ms.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut n: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let attributes = synthetic_attributes(&view_id, n, live_percent);
                let event_type = EVENT_TYPES[(n % 4) as usize];
                pipeline.record_event(event_type, attributes);
                n += 1;
            }
            _ = &mut shutdown => {
                info!(events = n, "Interrupt received, shutting down");
                break;
            }
        }
    }

    pipeline.on_terminate().await;
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_live_share() {
        let live = (0..100)
            .filter(|n| synthetic_attributes("v", *n, 25)["contentIsLive"] == json!(true))
            .count();
        assert_eq!(live, 25);
    }

    #[test]
    fn test_synthetic_zero_live() {
        assert!((0..100).all(|n| synthetic_attributes("v", n, 0)["contentIsLive"] == json!(false)));
    }
}
