use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use shared_config::AppConfig;

use crate::services::batch::{BatchService, ReferencePeriod};

const TICK: Duration = Duration::from_secs(3600);

/// Fires once per calendar month, on the first tick that sees it.
#[derive(Debug, Default)]
pub struct MonthlyTrigger {
    last_fired: Option<ReferencePeriod>,
}

impl MonthlyTrigger {
    pub fn due(&mut self, today: NaiveDate) -> bool {
        let current = ReferencePeriod::of(today);
        if self.last_fired == Some(current) {
            return false;
        }
        self.last_fired = Some(current);
        true
    }
}

/// Background task running the monthly batching job with the service-role key.
/// Re-running a month is harmless: units that already have a batch are skipped.
pub fn spawn_monthly_batching(config: Arc<AppConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if config.supabase_service_role_key.is_empty() {
            warn!("SUPABASE_SERVICE_ROLE_KEY not set; monthly TISS batching disabled");
            return;
        }

        let mut ticker = interval(TICK);
        let mut trigger = MonthlyTrigger::default();
        info!("Monthly TISS batching scheduler started");

        loop {
            ticker.tick().await;

            let today = Utc::now().date_naive();
            if !trigger.due(today) {
                debug!("Monthly batching already ran for {}", today.format("%m/%Y"));
                continue;
            }

            let service = BatchService::new(&config);
            let report = service
                .run_monthly_batching(today, None, &config.supabase_service_role_key)
                .await;

            if !report.errors.is_empty() {
                warn!(
                    "Monthly batching {:02}/{} finished with {} failed units",
                    report.reference_month,
                    report.reference_year,
                    report.errors.len()
                );
            }
        }
    })
}
