//! Catalog persistence contracts, in-memory and Postgres stores, and the
//! registry HTTP client used by source adapters.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use mcat_core::{CacheRow, CacheRowDraft, PoolEntry, SourceNamespace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

mod http;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, unwrap_envelope, BackoffPolicy, FetchError,
    HttpClientConfig, RegistryClient, RetryDisposition,
};
pub use postgres::PgCacheStore;

pub const CRATE_NAME: &str = "mcat-storage";

/// Largest multi-row insert: 25 binds per catalog row must stay under
/// Postgres's 65535 bind parameters per statement.
pub const MAX_CREATE_BATCH: usize = 2000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row {id}: {details}")]
    CorruptRow { id: i64, details: String },
    #[error("{0}")]
    Message(String),
}

/// Non-identity columns of the catalog table that a bulk update may rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheColumn {
    ResultTableName,
    ResultTableLabel,
    ResultTableLabelName,
    MetricFieldName,
    RelatedName,
    DataLabel,
    CategoryDisplay,
    Unit,
    UnitConversion,
    Description,
    DataTarget,
    Dimensions,
    DefaultDimensions,
    CollectConfigIds,
    ExtendFields,
    UseFrequency,
    ReadableName,
    Fingerprint,
    LastUpdate,
}

impl CacheColumn {
    pub const NON_IDENTITY: &'static [CacheColumn] = &[
        CacheColumn::ResultTableName,
        CacheColumn::ResultTableLabel,
        CacheColumn::ResultTableLabelName,
        CacheColumn::MetricFieldName,
        CacheColumn::RelatedName,
        CacheColumn::DataLabel,
        CacheColumn::CategoryDisplay,
        CacheColumn::Unit,
        CacheColumn::UnitConversion,
        CacheColumn::Description,
        CacheColumn::DataTarget,
        CacheColumn::Dimensions,
        CacheColumn::DefaultDimensions,
        CacheColumn::CollectConfigIds,
        CacheColumn::ExtendFields,
        CacheColumn::UseFrequency,
        CacheColumn::ReadableName,
        CacheColumn::Fingerprint,
        CacheColumn::LastUpdate,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Self::ResultTableName => "result_table_name",
            Self::ResultTableLabel => "result_table_label",
            Self::ResultTableLabelName => "result_table_label_name",
            Self::MetricFieldName => "metric_field_name",
            Self::RelatedName => "related_name",
            Self::DataLabel => "data_label",
            Self::CategoryDisplay => "category_display",
            Self::Unit => "unit",
            Self::UnitConversion => "unit_conversion",
            Self::Description => "description",
            Self::DataTarget => "data_target",
            Self::Dimensions => "dimensions",
            Self::DefaultDimensions => "default_dimensions",
            Self::CollectConfigIds => "collect_config_ids",
            Self::ExtendFields => "extend_fields",
            Self::UseFrequency => "use_frequency",
            Self::ReadableName => "readable_name",
            Self::Fingerprint => "metric_md5",
            Self::LastUpdate => "last_update",
        }
    }

    /// Copy this column's value from `src` into `dst`.
    pub fn copy(&self, src: &CacheRow, dst: &mut CacheRow) {
        let (s, d) = (&src.descriptor, &mut dst.descriptor);
        match self {
            Self::ResultTableName => d.result_table_name = s.result_table_name.clone(),
            Self::ResultTableLabel => d.result_table_label = s.result_table_label.clone(),
            Self::ResultTableLabelName => {
                d.result_table_label_name = s.result_table_label_name.clone()
            }
            Self::MetricFieldName => d.metric_field_name = s.metric_field_name.clone(),
            Self::RelatedName => d.related_name = s.related_name.clone(),
            Self::DataLabel => d.data_label = s.data_label.clone(),
            Self::CategoryDisplay => d.category_display = s.category_display.clone(),
            Self::Unit => d.unit = s.unit.clone(),
            Self::UnitConversion => d.unit_conversion = s.unit_conversion,
            Self::Description => d.description = s.description.clone(),
            Self::DataTarget => d.data_target = s.data_target,
            Self::Dimensions => d.dimensions = s.dimensions.clone(),
            Self::DefaultDimensions => d.default_dimensions = s.default_dimensions.clone(),
            Self::CollectConfigIds => d.collect_config_ids = s.collect_config_ids.clone(),
            Self::ExtendFields => d.extend_fields = s.extend_fields.clone(),
            Self::UseFrequency => d.use_frequency = s.use_frequency,
            Self::ReadableName => dst.readable_name = src.readable_name.clone(),
            Self::Fingerprint => dst.fingerprint = src.fingerprint.clone(),
            Self::LastUpdate => dst.last_update = src.last_update,
        }
    }
}

/// Materialized metric catalog. Pure persistence: diffing lives in the
/// reconciliation engine.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Identity columns + fingerprint for every row in `namespaces`,
    /// optionally restricted to one business.
    async fn query_pool(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<PoolEntry>, StoreError>;

    /// Full rows, for inspection and reporting.
    async fn fetch_rows(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<CacheRow>, StoreError>;

    async fn bulk_create(
        &self,
        rows: Vec<CacheRowDraft>,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    async fn bulk_update(
        &self,
        rows: Vec<CacheRow>,
        columns: &[CacheColumn],
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    async fn delete(&self, ids: &[i64], batch_size: usize) -> Result<usize, StoreError>;
}

/// Read-only aggregation over the alert query-config store.
#[async_trait]
pub trait UsageFrequencySource: Send + Sync {
    /// `(metric_id, reference_count)` for every metric referenced by a query
    /// config in one of `namespaces`.
    async fn reference_counts(
        &self,
        namespaces: &[SourceNamespace],
    ) -> Result<Vec<(String, u64)>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTag {
    Metric,
    Dimension,
    Timestamp,
    Group,
}

impl FieldTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Dimension => "dimension",
            Self::Timestamp => "timestamp",
            Self::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metric" => Some(Self::Metric),
            "dimension" => Some(Self::Dimension),
            "timestamp" => Some(Self::Timestamp),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn is_tag_like(&self) -> bool {
        !matches!(self, Self::Metric)
    }
}

/// One flattened field (metric or tag) of a custom time-series result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultTableField {
    pub table_id: String,
    pub field_name: String,
    pub tag: FieldTag,
    pub field_type: String,
    pub description: String,
    pub is_disabled: bool,
}

#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn list_fields(&self, table_id: &str) -> Result<Vec<ResultTableField>, StoreError>;

    async fn create_fields(
        &self,
        fields: Vec<ResultTableField>,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    /// Rewrite `is_disabled` and `description` of existing fields, matched by
    /// `(table_id, field_name)`.
    async fn update_fields(
        &self,
        fields: Vec<ResultTableField>,
        batch_size: usize,
    ) -> Result<usize, StoreError>;
}

/// Batch call counters, mostly useful to assert batching in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub create_batches: usize,
    pub update_batches: usize,
    pub delete_batches: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, CacheRow>,
    stats: StoreStats,
}

#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    state: Mutex<MemoryState>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> StoreStats {
        self.state.lock().await.stats
    }

    pub async fn get(&self, id: i64) -> Option<CacheRow> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    /// Overwrite a row's stored fingerprint, e.g. to mark it curated.
    pub async fn set_fingerprint(&self, id: i64, fingerprint: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&id) {
            Some(row) => {
                row.fingerprint = fingerprint.to_string();
                true
            }
            None => false,
        }
    }

    /// Insert a row bypassing any uniqueness, as a legacy writer could.
    pub async fn insert_raw(&self, draft: CacheRowDraft) -> i64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.rows.insert(id, CacheRow::from_draft(id, draft));
        id
    }
}

fn in_scope(row: &CacheRow, namespaces: &[SourceNamespace], bk_biz_id: Option<i64>) -> bool {
    namespaces.contains(&row.descriptor.namespace())
        && bk_biz_id.map_or(true, |biz| row.descriptor.bk_biz_id == biz)
}

fn batch_count(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn query_pool(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<PoolEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| in_scope(row, namespaces, bk_biz_id))
            .map(PoolEntry::from)
            .collect())
    }

    async fn fetch_rows(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<CacheRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| in_scope(row, namespaces, bk_biz_id))
            .cloned()
            .collect())
    }

    async fn bulk_create(
        &self,
        rows: Vec<CacheRowDraft>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.stats.create_batches += batch_count(rows.len(), batch_size);
        let created = rows.len();
        for draft in rows {
            state.next_id += 1;
            let id = state.next_id;
            state.rows.insert(id, CacheRow::from_draft(id, draft));
        }
        Ok(created)
    }

    async fn bulk_update(
        &self,
        rows: Vec<CacheRow>,
        columns: &[CacheColumn],
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.stats.update_batches += batch_count(rows.len(), batch_size);
        let mut updated = 0;
        for row in rows {
            if let Some(existing) = state.rows.get_mut(&row.id) {
                for column in columns {
                    column.copy(&row, existing);
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete(&self, ids: &[i64], batch_size: usize) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.stats.delete_batches += batch_count(ids.len(), batch_size);
        Ok(ids
            .iter()
            .filter(|id| state.rows.remove(*id).is_some())
            .count())
    }
}

/// One query config referencing a metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfigRef {
    pub namespace: SourceNamespace,
    pub metric_id: String,
}

#[derive(Debug, Default)]
pub struct InMemoryQueryConfigs {
    refs: Vec<QueryConfigRef>,
}

impl InMemoryQueryConfigs {
    pub fn new(refs: Vec<QueryConfigRef>) -> Self {
        Self { refs }
    }
}

#[async_trait]
impl UsageFrequencySource for InMemoryQueryConfigs {
    async fn reference_counts(
        &self,
        namespaces: &[SourceNamespace],
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for r in self.refs.iter().filter(|r| namespaces.contains(&r.namespace)) {
            *counts.entry(r.metric_id.clone()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFieldStore {
    fields: Mutex<HashMap<(String, String), ResultTableField>>,
}

impl InMemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FieldStore for InMemoryFieldStore {
    async fn list_fields(&self, table_id: &str) -> Result<Vec<ResultTableField>, StoreError> {
        let fields = self.fields.lock().await;
        let mut out = fields
            .values()
            .filter(|f| f.table_id == table_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        Ok(out)
    }

    async fn create_fields(
        &self,
        new_fields: Vec<ResultTableField>,
        _batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut fields = self.fields.lock().await;
        let mut created = 0;
        for field in new_fields {
            let key = (field.table_id.clone(), field.field_name.clone());
            if fields.contains_key(&key) {
                return Err(StoreError::Message(format!(
                    "field {}.{} already exists",
                    key.0, key.1
                )));
            }
            fields.insert(key, field);
            created += 1;
        }
        Ok(created)
    }

    async fn update_fields(
        &self,
        changed: Vec<ResultTableField>,
        _batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut fields = self.fields.lock().await;
        let mut updated = 0;
        for field in changed {
            if let Some(existing) =
                fields.get_mut(&(field.table_id.clone(), field.field_name.clone()))
            {
                existing.is_disabled = field.is_disabled;
                existing.description = field.description;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mcat_core::{DataSourceLabel, DataTypeLabel, MetricDescriptor};

    const CUSTOM_TS: SourceNamespace =
        SourceNamespace::new(DataSourceLabel::Custom, DataTypeLabel::TimeSeries);
    const BKDATA_TS: SourceNamespace =
        SourceNamespace::new(DataSourceLabel::BkData, DataTypeLabel::TimeSeries);

    fn draft(ns: SourceNamespace, biz: i64, field: &str) -> CacheRowDraft {
        CacheRowDraft {
            descriptor: MetricDescriptor::new(ns, biz, "app.__default__", field),
            fingerprint: format!("fp-{field}"),
            readable_name: field.to_string(),
            last_update: Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn query_pool_filters_by_namespace_and_business() {
        let store = InMemoryCacheStore::new();
        store
            .bulk_create(
                vec![
                    draft(CUSTOM_TS, 2, "a"),
                    draft(CUSTOM_TS, 3, "b"),
                    draft(BKDATA_TS, 2, "c"),
                ],
                50,
            )
            .await
            .unwrap();

        let all_custom = store.query_pool(&[CUSTOM_TS], None).await.unwrap();
        assert_eq!(all_custom.len(), 2);

        let biz_two = store.query_pool(&[CUSTOM_TS, BKDATA_TS], Some(2)).await.unwrap();
        let fields = biz_two
            .iter()
            .map(|e| e.identity.metric_field.as_str())
            .collect::<Vec<_>>();
        assert_eq!(fields, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn bulk_update_only_touches_requested_columns() {
        let store = InMemoryCacheStore::new();
        store.bulk_create(vec![draft(CUSTOM_TS, 2, "a")], 50).await.unwrap();
        let mut row = store.fetch_rows(&[CUSTOM_TS], None).await.unwrap().remove(0);
        row.descriptor.unit = "percent".into();
        row.fingerprint = "changed".into();

        store
            .bulk_update(vec![row.clone()], &[CacheColumn::Unit], 500)
            .await
            .unwrap();
        let stored = store.get(row.id).await.unwrap();
        assert_eq!(stored.descriptor.unit, "percent");
        assert_eq!(stored.fingerprint, "fp-a");
    }

    #[tokio::test]
    async fn delete_counts_batches_and_ignores_missing_ids() {
        let store = InMemoryCacheStore::new();
        store
            .bulk_create((0..5).map(|i| draft(CUSTOM_TS, 2, &format!("m{i}"))).collect(), 2)
            .await
            .unwrap();
        let deleted = store.delete(&[1, 2, 3, 99], 2).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.len().await, 2);
        let stats = store.stats().await;
        assert_eq!(stats.create_batches, 3);
        assert_eq!(stats.delete_batches, 2);
    }

    #[tokio::test]
    async fn reference_counts_group_by_metric_id_within_namespaces() {
        let source = InMemoryQueryConfigs::new(vec![
            QueryConfigRef {
                namespace: CUSTOM_TS,
                metric_id: "custom.app.__default__.a".into(),
            },
            QueryConfigRef {
                namespace: CUSTOM_TS,
                metric_id: "custom.app.__default__.a".into(),
            },
            QueryConfigRef {
                namespace: BKDATA_TS,
                metric_id: "bk_data.rt.x".into(),
            },
        ]);
        let counts = source.reference_counts(&[CUSTOM_TS]).await.unwrap();
        assert_eq!(counts, vec![("custom.app.__default__.a".to_string(), 2)]);
    }

    #[tokio::test]
    async fn field_store_rejects_duplicate_creates() {
        let store = InMemoryFieldStore::new();
        let field = ResultTableField {
            table_id: "t".into(),
            field_name: "cpu".into(),
            tag: FieldTag::Metric,
            field_type: "float".into(),
            description: String::new(),
            is_disabled: false,
        };
        store.create_fields(vec![field.clone()], 100).await.unwrap();
        assert!(store.create_fields(vec![field], 100).await.is_err());
    }
}
