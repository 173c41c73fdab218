// Deleting history: superseded entries on `do`, and stale entries on a
// background schedule.
//
// Deletion only ever removes a run from the start of the chain or from its
// tail, never from the middle, so surviving ids always form one contiguous
// range.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};
use workbench_common::types::{DeltaId, WorkflowId};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::error::{EngineError, StoreError};
use crate::store::{DocumentTx, Store};

/// Drop every entry past `head` in one set-based delete. Orphaned tabs and
/// steps are left for the caller to sweep once its own entry is in place.
pub(crate) fn trim_superseded(doc: &mut DocumentTx<'_>, head: Option<DeltaId>) -> Result<usize, StoreError> {
    let deleted = doc.delete_deltas_after(head)?;
    debug!(workflow_id = doc.workflow_id(), deleted, "trimmed superseded entries");
    Ok(deleted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub workflows_visited: usize,
    pub deltas_deleted: usize,
    pub tabs_deleted: usize,
    pub steps_deleted: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.workflows_visited += other.workflows_visited;
        self.deltas_deleted += other.deltas_deleted;
        self.tabs_deleted += other.tabs_deleted;
        self.steps_deleted += other.steps_deleted;
    }
}

/// Which entry ids of a chain are stale enough to delete.
///
/// `ages` must be in chain order. Returns the inclusive id ranges of the
/// stale prefix among applied entries and the stale suffix among undone ones.
pub fn stale_ranges(
    ages: &[(DeltaId, DateTime<Utc>)],
    head: Option<DeltaId>,
    cutoff: DateTime<Utc>,
) -> (Option<(DeltaId, DeltaId)>, Option<(DeltaId, DeltaId)>) {
    let applied_len = ages.partition_point(|(id, _)| Some(*id) <= head);
    let (applied, undone) = ages.split_at(applied_len);

    let prefix = applied.iter().take_while(|(_, at)| *at < cutoff).count();
    let suffix = undone.iter().rev().take_while(|(_, at)| *at < cutoff).count();

    let prefix_range = (prefix > 0).then(|| (applied[0].0, applied[prefix - 1].0));
    let suffix_range = (suffix > 0).then(|| (undone[undone.len() - suffix].0, undone[undone.len() - 1].0));
    (prefix_range, suffix_range)
}

/// Delete one workflow's stale entries, then its orphans.
pub(crate) fn reap_workflow(doc: &mut DocumentTx<'_>, cutoff: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    let head = doc.workflow().head_delta_id;
    let ages = doc.delta_ages()?;
    let (prefix, suffix) = stale_ranges(&ages, head, cutoff);

    let mut report = SweepReport { workflows_visited: 1, ..SweepReport::default() };
    if let Some((first, last)) = prefix {
        report.deltas_deleted += doc.delete_delta_range(first, last)?;
        if Some(last) == head {
            // The cursor's own entry is gone: it now sits before the chain.
            doc.set_head(None)?;
        }
    }
    if let Some((first, last)) = suffix {
        report.deltas_deleted += doc.delete_delta_range(first, last)?;
    }
    if report.deltas_deleted == 0 {
        return Ok(report);
    }

    doc.detach_chain_start()?;
    let orphans = doc.delete_orphans()?;
    report.tabs_deleted = orphans.tabs;
    report.steps_deleted = orphans.steps;
    Ok(report)
}

/// Periodic retention sweep over every workflow with stale history.
#[derive(Debug, Clone)]
pub struct Reaper {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl Reaper {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - chrono::Duration::days(i64::from(self.config.max_age_days))
    }

    /// One bounded batch. Safe to interrupt between workflows.
    pub fn sweep_blocking(&self) -> Result<SweepReport, StoreError> {
        let cutoff = self.cutoff();
        let candidates =
            self.store.find_workflows_with_stale_deltas(cutoff, self.config.max_workflows_per_cycle)?;

        let mut report = SweepReport::default();
        for workflow_id in candidates {
            match self.reap_one(workflow_id, cutoff) {
                Ok(one) => report.absorb(one),
                Err(StoreError::WorkflowNotFound(_)) => {
                    debug!(workflow_id, "workflow vanished before sweep; skipping");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(report)
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        let span = info_span!("engine.reaper.sweep", max_age_days = self.config.max_age_days);
        let reaper = self.clone();
        let report = async move { tokio::task::spawn_blocking(move || reaper.sweep_blocking()).await }
            .instrument(span)
            .await??;

        info!(
            workflows = report.workflows_visited,
            deltas = report.deltas_deleted,
            tabs = report.tabs_deleted,
            steps = report.steps_deleted,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval_secs` until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        warn!(error = %error, "retention sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("retention sweep stopping");
                    break;
                }
            }
        }
    }

    fn reap_one(&self, workflow_id: WorkflowId, cutoff: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        self.store.with_document_lock(workflow_id, |doc| reap_workflow(doc, cutoff))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn stale_prefix_stops_at_first_fresh_entry() {
        let ages = [(1, ts(1)), (2, ts(2)), (3, ts(50)), (4, ts(3))];
        assert_eq!(stale_ranges(&ages, Some(4), ts(10)), (Some((1, 2)), None));
    }

    #[test]
    fn stale_suffix_only_covers_undone_entries() {
        let ages = [(1, ts(50)), (2, ts(1)), (3, ts(50)), (4, ts(2)), (5, ts(3))];
        assert_eq!(stale_ranges(&ages, Some(2), ts(10)), (None, Some((4, 5))));
    }

    #[test]
    fn fully_stale_chain_splits_at_cursor() {
        let ages = [(1, ts(1)), (2, ts(2)), (3, ts(3))];
        assert_eq!(stale_ranges(&ages, Some(1), ts(10)), (Some((1, 1)), Some((2, 3))));
    }

    #[test]
    fn cursor_before_chain_treats_everything_as_undone() {
        let ages = [(7, ts(50)), (8, ts(1))];
        assert_eq!(stale_ranges(&ages, None, ts(10)), (None, Some((8, 8))));
    }

    #[test]
    fn nothing_stale_deletes_nothing() {
        let ages = [(1, ts(50)), (2, ts(60))];
        assert_eq!(stale_ranges(&ages, Some(2), ts(10)), (None, None));
        assert_eq!(stale_ranges(&[], None, ts(10)), (None, None));
    }
}
