//! Concurrent callers racing for one key, to make deduplication visible.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flightgroup::{AsyncGroup, Group, GroupConfig, Outcome, StatsSnapshot};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::app_config::StormConfig;

/// What a storm observed.
#[derive(Debug)]
pub struct StormReport {
    pub executions: u64,
    pub shared: usize,
    pub errors: usize,
    pub stats: StatsSnapshot,
}

impl StormReport {
    fn tally(
        outcomes: impl IntoIterator<Item = Outcome<u64, Infallible>>,
        executions: u64,
        stats: StatsSnapshot,
    ) -> Self {
        let mut shared = 0;
        let mut errors = 0;
        for outcome in outcomes {
            shared += usize::from(outcome.shared);
            errors += usize::from(outcome.result.is_err());
        }
        Self {
            executions,
            shared,
            errors,
            stats,
        }
    }

    pub fn log(&self, callers: usize) {
        info!(
            callers,
            executions = self.executions,
            shared = self.shared,
            errors = self.errors,
            joins = self.stats.joins,
            dedup_ratio = %format!("{:.2}", self.stats.dedup_ratio()),
            "storm finished"
        );
        if self.executions != 1 {
            warn!(
                executions = self.executions,
                "work ran more than once; callers did not overlap"
            );
        }
    }
}

/// Run the storm with one OS thread per caller.
#[instrument(name = "storm::threads", skip_all, fields(key = %storm.key))]
pub fn run_threads(group_config: GroupConfig, storm: &StormConfig) -> StormReport {
    let group: Group<String, u64, Infallible> = Group::with_config(group_config);
    let counter = Arc::new(AtomicU64::new(0));
    let delay = Duration::from_millis(storm.delay_ms);

    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..storm.callers)
            .map(|_| {
                let group = group.clone();
                let counter = Arc::clone(&counter);
                let key = storm.key.clone();
                scope.spawn(move || {
                    group.call(key, || {
                        std::thread::sleep(delay);
                        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                })
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    });

    StormReport::tally(outcomes, counter.load(Ordering::SeqCst), group.stats())
}

/// Run the storm with one tokio task per caller.
#[instrument(name = "storm::tasks", skip_all, fields(key = %storm.key))]
pub async fn run_tasks(group_config: GroupConfig, storm: &StormConfig) -> StormReport {
    let group: AsyncGroup<String, u64, Infallible> = AsyncGroup::with_config(group_config);
    let counter = Arc::new(AtomicU64::new(0));
    let delay = Duration::from_millis(storm.delay_ms);

    let mut set = JoinSet::new();
    for _ in 0..storm.callers {
        let group = group.clone();
        let counter = Arc::clone(&counter);
        let key = storm.key.clone();
        set.spawn(async move {
            group
                .call(key, move || async move {
                    tokio::time::sleep(delay).await;
                    Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
        });
    }

    let mut outcomes = Vec::with_capacity(storm.callers);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!(error = %e, "storm task failed"),
        }
    }

    StormReport::tally(outcomes, counter.load(Ordering::SeqCst), group.stats())
}
