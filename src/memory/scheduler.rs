// src/memory/scheduler.rs

//! Background sweep over tracked sessions for time-based forced
//! summarization. One long-lived task, cancellable at its sleep point.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MemoryConfig;
use crate::memory::session::SessionStore;
use crate::memory::summarization::SummarizationService;
use crate::memory::types::unix_now;

/// Spawns the sweeper. Per-session trigger evaluation handles its own
/// failures, so one bad session never halts the sweep; cancellation is
/// observed while sleeping and the loop exits cleanly.
pub fn spawn_summary_sweeper(
    summarizer: SummarizationService,
    sessions: Arc<SessionStore>,
    config: Arc<MemoryConfig>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Summary sweeper started (interval: {}s, time threshold: {}s)",
            config.summary_check_interval, config.summary_time_threshold
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Summary sweeper cancelled, exiting");
                    break;
                }
                _ = time::sleep(Duration::from_secs(config.summary_check_interval)) => {}
            }

            if !config.time_trigger_enabled() {
                debug!("Time-based summarization disabled, skipping sweep");
                continue;
            }

            let now = unix_now();
            let session_ids = sessions.tracked_sessions().await;
            debug!(
                "Sweeping {} tracked sessions for overdue summaries",
                session_ids.len()
            );

            let mut launched = 0usize;
            for session_id in session_ids {
                // One bad session must not abort the sweep over the rest.
                let evaluated = AssertUnwindSafe(summarizer.evaluate_time_trigger(&session_id, now))
                    .catch_unwind()
                    .await;
                match evaluated {
                    Ok(true) => launched += 1,
                    Ok(false) => {}
                    Err(_) => error!(
                        "Trigger evaluation panicked for session {}, continuing sweep",
                        session_id
                    ),
                }
            }
            if launched > 0 {
                info!("Summary sweep launched {} forced summarizations", launched);
            }
        }
    })
}
