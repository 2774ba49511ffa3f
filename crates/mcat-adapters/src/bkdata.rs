use std::sync::Arc;

use async_trait::async_trait;
use mcat_core::{
    DataSourceLabel, DataTypeLabel, Dimension, DimensionType, MetricDescriptor, SourceNamespace,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data_target_for, decode, load_label_names, AdapterError, AdapterRunState, Endpoint, RawTable,
    RegistryBackend, SourceAdapter, SourceType, BKDATA_PAGE_SIZE,
};

const FILTERED_DIMENSIONS: &[&str] = &["time", "bk_supplier_id", "bk_cmdb_level", "timestamp"];
const NUMERIC_FIELD_TYPES: &[&str] = &["integer", "long", "float", "double", "int", "bigint"];
const UNIT_BACKFILL: &[(&str, &str)] = &[
    ("bk_apm_avg_duration", "ns"),
    ("bk_apm_max_duration", "ns"),
    ("bk_apm_sum_duration", "ns"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BkdataResultTable {
    pub bk_biz_id: i64,
    pub result_table_id: String,
    #[serde(default)]
    pub result_table_name: String,
    #[serde(default)]
    pub result_table_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<BkdataField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BkdataField {
    pub field_name: String,
    #[serde(default)]
    pub field_alias: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub is_dimension: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub unit_conversion: Option<f64>,
}

impl BkdataField {
    fn is_numeric(&self) -> bool {
        NUMERIC_FIELD_TYPES.contains(&self.field_type.as_str())
    }

    fn aliased_name(&self) -> String {
        if self.field_alias.is_empty() || self.field_alias == self.field_name {
            self.field_name.clone()
        } else {
            format!("{}({})", self.field_alias, self.field_name)
        }
    }

    fn dimension(&self) -> Dimension {
        let field_type = if self.is_numeric() {
            DimensionType::Number
        } else {
            DimensionType::String
        };
        let groupable =
            matches!(self.field_type.as_str(), "string" | "text") || self.is_dimension;
        Dimension::new(self.field_name.clone(), self.aliased_name())
            .with_type(field_type)
            .with_is_dimension(groupable)
    }
}

pub struct BkdataAdapter {
    backend: Arc<dyn RegistryBackend>,
    platform_biz_id: Option<i64>,
}

impl BkdataAdapter {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self {
            backend,
            platform_biz_id: None,
        }
    }

    pub fn with_platform_biz_id(mut self, platform_biz_id: Option<i64>) -> Self {
        self.platform_biz_id = platform_biz_id;
        self
    }
}

#[async_trait]
impl SourceAdapter for BkdataAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::BkData
    }

    async fn prepare(&self, state: &mut AdapterRunState) -> Result<(), AdapterError> {
        load_label_names(self.backend.as_ref(), state).await;
        Ok(())
    }

    async fn list_tables(&self, state: &AdapterRunState) -> Result<Vec<RawTable>, AdapterError> {
        let bk_biz_id = state
            .bk_biz_id
            .filter(|biz| *biz > 0)
            .ok_or(AdapterError::ScopeRequired(SourceType::BkData))?;

        if self.platform_biz_id == Some(bk_biz_id) {
            info!(bk_biz_id, "skipping the computation platform's own business");
            return Ok(Vec::new());
        }

        let mut tables = Vec::new();
        for page in 1.. {
            let endpoint = Endpoint::BkdataResultTables { bk_biz_id, page };
            let value = self.backend.fetch(state.run_id, &endpoint).await?;
            let batch: Vec<BkdataResultTable> = decode(&endpoint, value)?;
            let last = batch.len() < BKDATA_PAGE_SIZE;
            debug!(bk_biz_id, page, rows = batch.len(), "fetched result table page");
            tables.extend(batch.into_iter().map(RawTable::BkdataResultTable));
            if last {
                break;
            }
        }
        Ok(tables)
    }

    async fn list_metrics(
        &self,
        state: &AdapterRunState,
        table: &RawTable,
    ) -> Result<Vec<MetricDescriptor>, AdapterError> {
        let RawTable::BkdataResultTable(table) = table else {
            return Err(AdapterError::Message(format!(
                "bkdata adapter cannot read {}",
                table.table_id()
            )));
        };

        let dimensions: Vec<Dimension> = table
            .fields
            .iter()
            .filter(|f| !FILTERED_DIMENSIONS.contains(&f.field_name.as_str()))
            .map(BkdataField::dimension)
            .collect();

        let label = table
            .result_table_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("other_rt")
            .to_string();
        let namespace = SourceNamespace::new(DataSourceLabel::BkData, DataTypeLabel::TimeSeries);

        Ok(table
            .fields
            .iter()
            .filter(|f| f.is_numeric())
            .map(|field| {
                let mut d = MetricDescriptor::new(
                    namespace,
                    table.bk_biz_id,
                    table.result_table_id.clone(),
                    field.field_name.clone(),
                );
                d.result_table_name = table.result_table_name.clone();
                d.result_table_label_name = state.label_name(&label);
                d.result_table_label = label.clone();
                d.data_target = data_target_for(&label, DataSourceLabel::BkData);
                d.dimensions = dimensions.clone();
                d.metric_field_name = field.aliased_name();
                d.unit = field
                    .unit
                    .clone()
                    .filter(|u| !u.is_empty())
                    .or_else(|| {
                        UNIT_BACKFILL
                            .iter()
                            .find(|(name, _)| *name == field.field_name)
                            .map(|(_, unit)| (*unit).to_string())
                    })
                    .unwrap_or_default();
                d.unit_conversion = field.unit_conversion.unwrap_or(1.0);
                d
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_backend;
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct PagedTables {
        total: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistryBackend for PagedTables {
        async fn fetch(
            &self,
            _run_id: Uuid,
            endpoint: &Endpoint,
        ) -> Result<JsonValue, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Endpoint::BkdataResultTables { page, .. } = endpoint else {
                return Ok(json!([]));
            };
            let start = (page - 1) * BKDATA_PAGE_SIZE;
            let end = self.total.min(start + BKDATA_PAGE_SIZE);
            let rows: Vec<JsonValue> = (start..end)
                .map(|i| json!({"bk_biz_id": 2, "result_table_id": format!("2_rt_{i}")}))
                .collect();
            Ok(JsonValue::Array(rows))
        }
    }

    #[tokio::test]
    async fn numeric_fields_become_metrics_with_filtered_dimensions() {
        let adapter = BkdataAdapter::new(fixture_backend());
        let mut state = AdapterRunState::new(Uuid::new_v4(), Some(2));
        adapter.prepare(&mut state).await.expect("prepare");

        let tables = adapter.list_tables(&state).await.expect("tables");
        assert_eq!(tables.len(), 2);

        let metrics = adapter.list_metrics(&state, &tables[0]).await.expect("metrics");
        let names: Vec<_> = metrics.iter().map(|m| m.metric_field.as_str()).collect();
        assert_eq!(names, vec!["request_count", "bk_apm_avg_duration"]);

        let count = &metrics[0];
        assert_eq!(count.metric_field_name, "Requests(request_count)");
        assert_eq!(count.result_table_label, "other_rt");
        assert!(count.dimensions.iter().all(|d| d.id != "timestamp" && d.id != "time"));
        let service = count
            .dimensions
            .iter()
            .find(|d| d.id == "service")
            .expect("service dimension");
        assert!(service.is_dimension);
        assert_eq!(service.field_type, DimensionType::String);

        assert_eq!(metrics[1].unit, "ns");
        assert_eq!(metrics[1].metric_field_name, "bk_apm_avg_duration");

        let second = adapter.list_metrics(&state, &tables[1]).await.expect("metrics");
        assert_eq!(second[0].result_table_label, "applications");
        assert_eq!(second[0].unit, "ms");
    }

    #[tokio::test]
    async fn platform_business_and_unscoped_runs_are_rejected() {
        let adapter = BkdataAdapter::new(fixture_backend()).with_platform_biz_id(Some(2));
        let state = AdapterRunState::new(Uuid::new_v4(), Some(2));
        assert!(adapter.list_tables(&state).await.expect("tables").is_empty());

        let unscoped = AdapterRunState::new(Uuid::new_v4(), None);
        let err = adapter.list_tables(&unscoped).await.unwrap_err();
        assert!(matches!(err, AdapterError::ScopeRequired(SourceType::BkData)));
    }

    #[tokio::test]
    async fn result_tables_are_read_until_a_short_page() {
        let backend = Arc::new(PagedTables {
            total: BKDATA_PAGE_SIZE + 3,
            calls: AtomicUsize::new(0),
        });
        let adapter = BkdataAdapter::new(backend.clone());
        let state = AdapterRunState::new(Uuid::new_v4(), Some(2));

        let tables = adapter.list_tables(&state).await.expect("tables");
        assert_eq!(tables.len(), BKDATA_PAGE_SIZE + 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            tables.last().map(RawTable::table_id).as_deref(),
            Some("2_rt_5002")
        );
    }
}
