//! Recurring sweep that times out overdue commands.
//!
//! Runs independently of request handling; the transitions go through the
//! same conditional updates as claim/report, so racing a late claim or
//! report is safe.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::state::AppState;

pub fn spawn(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.expire_overdue(Utc::now()).await {
                Ok(outcome) if outcome.expired > 0 || outcome.failed > 0 => {
                    info!(
                        expired = outcome.expired,
                        failed = outcome.failed,
                        "watchdog transitioned overdue commands"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "watchdog sweep failed");
                }
            }
        }
    })
}
