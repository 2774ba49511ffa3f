use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mcat_adapters::{AdapterError, AdapterRunState, SourceAdapter, SourceType, TableAnchor};
use mcat_core::{
    readable_name, CacheRow, CacheRowDraft, IdentityKey, MetricDescriptor, PoolEntry,
    SourceNamespace,
};
use mcat_storage::{CacheColumn, CacheStore, StoreError, UsageFrequencySource};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::hasher::{ContentHasher, UsageFrequencyIndex};

/// Internal collector tables that produce nothing but noise in the catalog.
pub const NOISY_TABLES: &[&str] = &["bkunifylogbeat_task.base", "bkunifylogbeat_common.base"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSizes {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            create: 50,
            update: 500,
            delete: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistStage {
    UsageIndex,
    LoadPool,
    Create,
    Update,
    Delete,
}

impl fmt::Display for PersistStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UsageIndex => "usage index",
            Self::LoadPool => "pool load",
            Self::Create => "bulk create",
            Self::Update => "bulk update",
            Self::Delete => "bulk delete",
        })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{source_type} source unavailable: {source}")]
    SourceUnavailable {
        source_type: SourceType,
        #[source]
        source: AdapterError,
    },
    #[error("{stage} failed: {source}")]
    Persistence {
        stage: PersistStage,
        #[source]
        source: StoreError,
    },
}

fn persistence(stage: PersistStage) -> impl FnOnce(StoreError) -> ReconcileError {
    move |source| ReconcileError::Persistence { stage, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every table enumerated.
    Completed,
    /// Some tables failed; their rows were kept.
    Partial,
    /// Table listing failed; nothing was written.
    SourceUnavailable,
    /// A persistence batch failed; later batches were not attempted.
    Failed,
    /// No adapter is registered for the source type.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFailure {
    pub table_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub source_type: SourceType,
    pub bk_biz_id: Option<i64>,
    pub status: RunStatus,
    pub tables_seen: usize,
    pub tables_failed: Vec<TableFailure>,
    pub metrics_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub duplicates_removed: usize,
    pub duplicates_skipped: usize,
    pub protected: usize,
    pub retained: usize,
    pub truncated: usize,
    pub denylisted: usize,
    pub out_of_scope: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileSummary {
    pub fn new(run_id: Uuid, source_type: SourceType, bk_biz_id: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source_type,
            bk_biz_id,
            status: RunStatus::Completed,
            tables_seen: 0,
            tables_failed: Vec::new(),
            metrics_seen: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            duplicates_removed: 0,
            duplicates_skipped: 0,
            protected: 0,
            retained: 0,
            truncated: 0,
            denylisted: 0,
            out_of_scope: 0,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Summary of a run that ended before or during persistence.
    pub fn from_error(
        source_type: SourceType,
        bk_biz_id: Option<i64>,
        err: &ReconcileError,
    ) -> Self {
        let mut summary = Self::new(Uuid::new_v4(), source_type, bk_biz_id);
        summary.status = match err {
            ReconcileError::SourceUnavailable { .. } => RunStatus::SourceUnavailable,
            ReconcileError::Persistence { .. } => RunStatus::Failed,
        };
        summary.error = Some(err.to_string());
        summary
    }

    pub fn skipped(source_type: SourceType, bk_biz_id: Option<i64>, reason: &str) -> Self {
        let mut summary = Self::new(Uuid::new_v4(), source_type, bk_biz_id);
        summary.status = RunStatus::Skipped;
        summary.error = Some(reason.to_string());
        summary
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

type PoolKey = (SourceNamespace, IdentityKey);

/// Existing rows indexed by identity. Later duplicates of an identity are
/// set aside for deletion.
struct PoolIndex {
    by_key: HashMap<PoolKey, PoolEntry>,
    duplicates: Vec<i64>,
}

impl PoolIndex {
    fn build(pool: Vec<PoolEntry>) -> Self {
        let mut by_key = HashMap::with_capacity(pool.len());
        let mut duplicates = Vec::new();
        for entry in pool {
            let key = (entry.namespace, entry.identity.clone());
            if by_key.contains_key(&key) {
                warn!(
                    id = entry.id,
                    identity = %entry.identity,
                    "duplicate catalog row queued for deletion"
                );
                duplicates.push(entry.id);
            } else {
                by_key.insert(key, entry);
            }
        }
        Self { by_key, duplicates }
    }
}

/// Outcome of comparing one observed descriptor with the catalog.
enum Planned {
    Create(CacheRowDraft),
    Update(CacheRow),
    Unchanged,
}

/// Diffs one adapter's output against the catalog and applies the delta in
/// create, update, delete order.
///
/// Runs of the same source type and scope must not overlap; callers
/// serialize them.
pub struct ReconciliationEngine {
    store: Arc<dyn CacheStore>,
    usage: Arc<dyn UsageFrequencySource>,
    hasher: ContentHasher,
    batches: BatchSizes,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn CacheStore>, usage: Arc<dyn UsageFrequencySource>) -> Self {
        Self {
            store,
            usage,
            hasher: ContentHasher,
            batches: BatchSizes::default(),
        }
    }

    pub fn with_batch_sizes(mut self, batches: BatchSizes) -> Self {
        self.batches = batches;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        scope: Option<i64>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "reconcile",
            %run_id,
            source_type = %adapter.source_type(),
            bk_biz_id = ?scope
        );
        self.run_inner(run_id, adapter, scope).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        adapter: &dyn SourceAdapter,
        scope: Option<i64>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let clock = Instant::now();
        let source_type = adapter.source_type();
        let namespaces = adapter.namespaces();
        let mut summary = ReconcileSummary::new(run_id, source_type, scope);
        info!("starting catalog reconciliation");

        let usage = UsageFrequencyIndex::build(self.usage.as_ref(), namespaces)
            .await
            .map_err(persistence(PersistStage::UsageIndex))?;
        let pool = self
            .store
            .query_pool(namespaces, scope)
            .await
            .map_err(persistence(PersistStage::LoadPool))?;
        let mut index = PoolIndex::build(pool);
        summary.duplicates_removed = index.duplicates.len();

        let unavailable = |source: AdapterError| ReconcileError::SourceUnavailable {
            source_type,
            source,
        };
        let mut state = AdapterRunState::new(run_id, scope);
        adapter.prepare(&mut state).await.map_err(unavailable)?;
        let tables = adapter.list_tables(&state).await.map_err(unavailable)?;

        let mut seen: HashSet<PoolKey> = HashSet::new();
        let mut failed_anchors: Vec<TableAnchor> = Vec::new();
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();

        for table in &tables {
            summary.tables_seen += 1;
            let descriptors = match adapter.list_metrics(&state, table).await {
                Ok(descriptors) => descriptors,
                Err(err) => {
                    warn!(table_id = %table.table_id(), error = %err, "skipping table");
                    summary.tables_failed.push(TableFailure {
                        table_id: table.table_id(),
                        reason: err.to_string(),
                    });
                    failed_anchors.push(table.anchor());
                    continue;
                }
            };

            for mut descriptor in descriptors {
                summary.metrics_seen += 1;
                if descriptor.truncate_identity_fields() {
                    summary.truncated += 1;
                    debug!(metric_field = %descriptor.metric_field, "identity fields truncated");
                }
                if NOISY_TABLES.contains(&descriptor.result_table_id.as_str()) {
                    summary.denylisted += 1;
                    continue;
                }
                let foreign_business = scope.is_some_and(|biz| descriptor.bk_biz_id != biz);
                if foreign_business || !namespaces.contains(&descriptor.namespace()) {
                    summary.out_of_scope += 1;
                    continue;
                }
                descriptor.use_frequency = usage.frequency(&descriptor);

                let key = (descriptor.namespace(), descriptor.identity_key());
                if !seen.insert(key.clone()) {
                    summary.duplicates_skipped += 1;
                    warn!(
                        identity = %key.1,
                        table_id = %table.table_id(),
                        "metric observed twice in one run"
                    );
                    continue;
                }

                let existing = index.by_key.remove(&key);
                match self.plan(descriptor, existing.as_ref()) {
                    Planned::Create(draft) => {
                        debug!(identity = %key.1, "queued for creation");
                        to_create.push(draft);
                    }
                    Planned::Update(row) => {
                        debug!(identity = %key.1, "queued for update");
                        to_update.push(row);
                    }
                    Planned::Unchanged => summary.unchanged += 1,
                }
            }
        }

        let mut to_delete = std::mem::take(&mut index.duplicates);
        for entry in index.by_key.into_values() {
            if entry.is_curated() {
                summary.protected += 1;
            } else if failed_anchors
                .iter()
                .any(|a| a.covers(&entry.identity.result_table_id, &entry.identity.related_id))
            {
                summary.retained += 1;
            } else {
                to_delete.push(entry.id);
            }
        }
        to_delete.sort_unstable();

        self.persist(&mut summary, to_create, to_update, &to_delete)
            .await?;

        summary.status = if summary.tables_failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        summary.finished_at = Utc::now();
        info!(
            tables = summary.tables_seen,
            failed_tables = summary.tables_failed.len(),
            metrics = summary.metrics_seen,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            protected = summary.protected,
            retained = summary.retained,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "catalog reconciliation finished"
        );
        Ok(summary)
    }

    fn plan(&self, descriptor: MetricDescriptor, existing: Option<&PoolEntry>) -> Planned {
        let readable = readable_name(&descriptor);
        let fingerprint = self.hasher.fingerprint(&descriptor);
        match existing {
            None => Planned::Create(CacheRowDraft {
                descriptor,
                fingerprint,
                readable_name: readable,
                last_update: Utc::now(),
            }),
            Some(entry) if !entry.fingerprint.is_empty() && entry.fingerprint == fingerprint => {
                Planned::Unchanged
            }
            Some(entry) => Planned::Update(CacheRow {
                id: entry.id,
                descriptor,
                fingerprint,
                readable_name: readable,
                last_update: Utc::now(),
            }),
        }
    }

    async fn persist(
        &self,
        summary: &mut ReconcileSummary,
        to_create: Vec<CacheRowDraft>,
        to_update: Vec<CacheRow>,
        to_delete: &[i64],
    ) -> Result<(), ReconcileError> {
        if !to_create.is_empty() {
            info!(count = to_create.len(), "bulk creating catalog rows");
            summary.created = self
                .store
                .bulk_create(to_create, self.batches.create)
                .await
                .map_err(persistence(PersistStage::Create))?;
        }
        if !to_update.is_empty() {
            info!(count = to_update.len(), "bulk updating catalog rows");
            summary.updated = self
                .store
                .bulk_update(to_update, CacheColumn::NON_IDENTITY, self.batches.update)
                .await
                .map_err(persistence(PersistStage::Update))?;
        }
        if !to_delete.is_empty() {
            info!(count = to_delete.len(), "deleting catalog rows");
            summary.deleted = self
                .store
                .delete(to_delete, self.batches.delete)
                .await
                .map_err(persistence(PersistStage::Delete))?;
        }
        Ok(())
    }

    /// Upsert `descriptors` by identity without deleting anything. Used when
    /// new tables are published between scheduled runs.
    pub async fn append(
        &self,
        descriptors: Vec<MetricDescriptor>,
    ) -> Result<AppendSummary, ReconcileError> {
        let mut namespaces: Vec<SourceNamespace> =
            descriptors.iter().map(MetricDescriptor::namespace).collect();
        namespaces.sort();
        namespaces.dedup();

        let usage = UsageFrequencyIndex::build(self.usage.as_ref(), &namespaces)
            .await
            .map_err(persistence(PersistStage::UsageIndex))?;
        let pool = self
            .store
            .query_pool(&namespaces, None)
            .await
            .map_err(persistence(PersistStage::LoadPool))?;
        let mut index = PoolIndex::build(pool);

        let mut summary = AppendSummary::default();
        let mut seen: HashSet<PoolKey> = HashSet::new();
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();

        for mut descriptor in descriptors {
            descriptor.truncate_identity_fields();
            if NOISY_TABLES.contains(&descriptor.result_table_id.as_str()) {
                summary.skipped += 1;
                continue;
            }
            descriptor.use_frequency = usage.frequency(&descriptor);
            let key = (descriptor.namespace(), descriptor.identity_key());
            if !seen.insert(key.clone()) {
                summary.skipped += 1;
                continue;
            }
            let existing = index.by_key.remove(&key);
            match self.plan(descriptor, existing.as_ref()) {
                Planned::Create(draft) => to_create.push(draft),
                Planned::Update(row) => to_update.push(row),
                Planned::Unchanged => summary.unchanged += 1,
            }
        }

        if !to_create.is_empty() {
            summary.created = self
                .store
                .bulk_create(to_create, self.batches.create)
                .await
                .map_err(persistence(PersistStage::Create))?;
        }
        if !to_update.is_empty() {
            summary.updated = self
                .store
                .bulk_update(to_update, CacheColumn::NON_IDENTITY, self.batches.update)
                .await
                .map_err(persistence(PersistStage::Update))?;
        }
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "appended catalog rows"
        );
        Ok(summary)
    }
}
