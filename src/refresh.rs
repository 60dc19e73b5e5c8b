use std::time::Duration;

use tracing::{info, warn};

use crate::cache::script::{RefreshOutcome, ScriptKey, WELL_KNOWN_SCRIPTS};
use crate::scripts::ScriptService;

/// Refresh cadence for well-known scripts. Half the fresh TTL, so a missed
/// run still lands inside the freshness window.
const REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub refreshed: usize,
    pub errors: usize,
}

/// Spawn the background refresher. Runs detached from request handling;
/// failures are logged and retried implicitly at the next tick.
pub fn spawn_refresher(scripts: ScriptService) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            interval.tick().await;
            run_refresh(&scripts).await;
        }
    });
}

/// One refresh pass over the well-known script table.
pub async fn run_refresh(scripts: &ScriptService) -> RefreshSummary {
    refresh_table(scripts, WELL_KNOWN_SCRIPTS).await
}

async fn refresh_table(scripts: &ScriptService, table: &[(&str, &str)]) -> RefreshSummary {
    let mut summary = RefreshSummary::default();

    for (name, url) in table {
        let key = ScriptKey::named(name);
        match scripts.refresh(&key, url).await {
            Ok(RefreshOutcome::Updated) => summary.updated += 1,
            Ok(RefreshOutcome::Refreshed) => summary.refreshed += 1,
            Err(e) => {
                warn!(script = %key, error = %e, "Scheduled refresh failed");
                summary.errors += 1;
            }
        }
    }

    info!(
        updated = summary.updated,
        refreshed = summary.refreshed,
        errors = summary.errors,
        "Scheduled script refresh complete"
    );
    summary
}
