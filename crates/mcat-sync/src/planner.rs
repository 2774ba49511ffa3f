use std::sync::Arc;

use chrono::{DateTime, Utc};
use mcat_adapters::{adapter_for_source, AdapterOptions, BusinessScope, RegistryBackend, SourceType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{ReconcileSummary, ReconciliationEngine, RunStatus};

/// One engine invocation: a source type and its business scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTask {
    pub source_type: SourceType,
    pub bk_biz_id: Option<i64>,
}

impl RefreshTask {
    pub fn new(source_type: SourceType, bk_biz_id: Option<i64>) -> Self {
        Self {
            source_type,
            bk_biz_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    pub enable_bkdata: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            enable_bkdata: true,
        }
    }
}

fn applies_to_business(source_type: SourceType, bk_biz_id: i64, options: &PlanOptions) -> bool {
    if source_type == SourceType::BkData && !options.enable_bkdata {
        return false;
    }
    match source_type.business_scope() {
        BusinessScope::PerBusiness => bk_biz_id > 0,
        BusinessScope::AllBusinesses | BusinessScope::PerBusinessWithGlobal => true,
    }
}

/// Tasks of one refresh round.
///
/// A full sweep over `biz_ids` is spread across `period` rounds. Round 0 also
/// refreshes the unscoped source types and the global business 0.
pub fn plan_round(
    biz_ids: &[i64],
    period: usize,
    offset: usize,
    options: &PlanOptions,
) -> Vec<RefreshTask> {
    let period = period.max(1);
    let mut tasks = Vec::new();

    if offset == 0 {
        for source_type in SourceType::ALL {
            match source_type.business_scope() {
                BusinessScope::AllBusinesses => tasks.push(RefreshTask::new(source_type, None)),
                BusinessScope::PerBusinessWithGlobal => {
                    tasks.push(RefreshTask::new(source_type, Some(0)))
                }
                BusinessScope::PerBusiness => {}
            }
        }
    }

    let per_round = biz_ids.len().div_ceil(period);
    let start = (offset * per_round).min(biz_ids.len());
    let end = ((offset + 1) * per_round).min(biz_ids.len());

    for &bk_biz_id in &biz_ids[start..end] {
        if bk_biz_id == 0 {
            continue;
        }
        for source_type in SourceType::ALL {
            let scoped = source_type.business_scope() != BusinessScope::AllBusinesses;
            if scoped && applies_to_business(source_type, bk_biz_id, options) {
                tasks.push(RefreshTask::new(source_type, Some(bk_biz_id)));
            }
        }
    }
    tasks
}

/// Offset of the round after `offset`, wrapping after `period - 1`.
pub fn next_offset(period: usize, offset: usize) -> usize {
    if offset + 1 >= period.max(1) {
        0
    } else {
        offset + 1
    }
}

/// Every source type applicable to one business.
pub fn plan_business(bk_biz_id: i64, options: &PlanOptions) -> Vec<RefreshTask> {
    SourceType::ALL
        .into_iter()
        .filter(|t| applies_to_business(*t, bk_biz_id, options))
        .map(|t| RefreshTask::new(t, Some(bk_biz_id)))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_id: Uuid,
    pub offset: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runs: Vec<ReconcileSummary>,
}

impl RoundSummary {
    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReconcileSummary> {
        self.runs
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Failed | RunStatus::SourceUnavailable))
    }
}

/// Executes refresh tasks one at a time, so no two runs of the same source
/// type and scope overlap within a process.
pub struct RefreshRunner {
    engine: Arc<ReconciliationEngine>,
    backend: Arc<dyn RegistryBackend>,
    adapter_options: AdapterOptions,
    plan_options: PlanOptions,
}

impl RefreshRunner {
    pub fn new(engine: Arc<ReconciliationEngine>, backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            engine,
            backend,
            adapter_options: AdapterOptions::default(),
            plan_options: PlanOptions::default(),
        }
    }

    pub fn with_options(mut self, adapter_options: AdapterOptions, plan_options: PlanOptions) -> Self {
        self.adapter_options = adapter_options;
        self.plan_options = plan_options;
        self
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn plan_options(&self) -> &PlanOptions {
        &self.plan_options
    }

    /// Run one task. Failures are folded into the returned summary.
    pub async fn run_task(&self, task: RefreshTask) -> ReconcileSummary {
        let Some(adapter) =
            adapter_for_source(task.source_type, self.backend.clone(), &self.adapter_options)
        else {
            info!(source_type = %task.source_type, "no adapter registered; skipping");
            return ReconcileSummary::skipped(
                task.source_type,
                task.bk_biz_id,
                "no adapter registered",
            );
        };

        match self.engine.run(adapter.as_ref(), task.bk_biz_id).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(
                    source_type = %task.source_type,
                    bk_biz_id = ?task.bk_biz_id,
                    error = %err,
                    "catalog refresh failed"
                );
                ReconcileSummary::from_error(task.source_type, task.bk_biz_id, &err)
            }
        }
    }

    pub async fn run_tasks(&self, tasks: Vec<RefreshTask>, offset: Option<usize>) -> RoundSummary {
        let round_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut runs = Vec::with_capacity(tasks.len());
        for task in tasks {
            runs.push(self.run_task(task).await);
        }
        let summary = RoundSummary {
            round_id,
            offset,
            started_at,
            finished_at: Utc::now(),
            runs,
        };
        info!(
            %round_id,
            runs = summary.runs.len(),
            failed = summary.failures().count(),
            skipped = summary.count(RunStatus::Skipped),
            "refresh round finished"
        );
        summary
    }

    pub async fn run_round(&self, biz_ids: &[i64], period: usize, offset: usize) -> RoundSummary {
        let tasks = plan_round(biz_ids, period, offset, &self.plan_options);
        self.run_tasks(tasks, Some(offset)).await
    }

    pub async fn refresh_business(&self, bk_biz_id: i64) -> RoundSummary {
        let tasks = plan_business(bk_biz_id, &self.plan_options);
        self.run_tasks(tasks, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcat_adapters::FixtureRegistryBackend;
    use mcat_storage::{InMemoryCacheStore, InMemoryQueryConfigs};
    use std::path::Path;

    fn count(tasks: &[RefreshTask], source_type: SourceType) -> usize {
        tasks.iter().filter(|t| t.source_type == source_type).count()
    }

    #[test]
    fn first_round_adds_unscoped_and_global_tasks() {
        let biz: Vec<i64> = (1..=12).collect();
        let tasks = plan_round(&biz, 6, 0, &PlanOptions::default());

        assert!(tasks.contains(&RefreshTask::new(SourceType::BaseAlarm, None)));
        assert!(tasks.contains(&RefreshTask::new(SourceType::BkMonitorLog, None)));
        assert!(tasks.contains(&RefreshTask::new(SourceType::CustomTimeSeries, Some(0))));
        assert!(!tasks.contains(&RefreshTask::new(SourceType::BkData, Some(0))));

        // ceil(12 / 6) = 2 businesses per round.
        assert_eq!(count(&tasks, SourceType::BkData), 2);
        assert_eq!(count(&tasks, SourceType::CustomTimeSeries), 3);
        assert!(tasks.iter().all(|t| t.bk_biz_id.map_or(true, |b| b <= 2)));
    }

    #[test]
    fn later_rounds_cover_their_slice_only() {
        let biz: Vec<i64> = (1..=12).collect();
        let tasks = plan_round(&biz, 6, 2, &PlanOptions::default());
        assert_eq!(count(&tasks, SourceType::BaseAlarm), 0);
        let mut scoped: Vec<i64> = tasks.iter().filter_map(|t| t.bk_biz_id).collect();
        scoped.sort_unstable();
        scoped.dedup();
        assert_eq!(scoped, vec![5, 6]);

        assert!(plan_round(&biz, 6, 7, &PlanOptions::default()).is_empty());
    }

    #[test]
    fn bkdata_can_be_disabled_and_needs_positive_ids() {
        let options = PlanOptions {
            enable_bkdata: false,
        };
        let tasks = plan_round(&[3, 4], 1, 0, &options);
        assert_eq!(count(&tasks, SourceType::BkData), 0);

        let tasks = plan_business(-5, &PlanOptions::default());
        assert_eq!(count(&tasks, SourceType::BkData), 0);
        assert_eq!(count(&tasks, SourceType::LogTimeSeries), 0);
        assert_eq!(count(&tasks, SourceType::CustomTimeSeries), 1);

        assert_eq!(plan_business(2, &PlanOptions::default()).len(), SourceType::ALL.len());
    }

    #[test]
    fn offsets_wrap() {
        assert_eq!(next_offset(6, 0), 1);
        assert_eq!(next_offset(6, 5), 0);
        assert_eq!(next_offset(6, 9), 0);
        assert_eq!(next_offset(0, 0), 0);
        assert_eq!(next_offset(1, 0), 0);
    }

    #[tokio::test]
    async fn business_refresh_isolates_failures_and_skips() {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let store = Arc::new(InMemoryCacheStore::new());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            Arc::new(InMemoryQueryConfigs::default()),
        ));
        let runner = RefreshRunner::new(engine, Arc::new(FixtureRegistryBackend::new(fixtures)));

        let round = runner.refresh_business(2).await;
        assert_eq!(round.runs.len(), SourceType::ALL.len());
        assert_eq!(round.count(RunStatus::Skipped), 7);

        let custom = round
            .runs
            .iter()
            .find(|r| r.source_type == SourceType::CustomTimeSeries)
            .unwrap();
        assert_eq!(custom.status, RunStatus::Completed);
        assert_eq!(custom.created, 4);

        let logs = round
            .runs
            .iter()
            .find(|r| r.source_type == SourceType::LogTimeSeries)
            .unwrap();
        assert_eq!(logs.status, RunStatus::Partial);
        assert_eq!(logs.created, 2);

        let bkdata = round
            .runs
            .iter()
            .find(|r| r.source_type == SourceType::BkData)
            .unwrap();
        assert_eq!(bkdata.created, 4);

        // A business without fixtures: listing fails, nothing aborts.
        let missing = runner.refresh_business(99).await;
        assert_eq!(missing.failures().count(), 3);
        assert_eq!(missing.runs.len(), SourceType::ALL.len());
    }
}
