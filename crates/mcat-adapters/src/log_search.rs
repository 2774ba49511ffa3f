use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcat_core::{DataSourceLabel, DataTypeLabel, Dimension, MetricDescriptor, SourceNamespace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::{
    data_target_for, decode, load_label_names, AdapterError, AdapterRunState, Endpoint, RawTable,
    RegistryBackend, SourceAdapter, SourceType,
};

const BUILTIN_DIMENSIONS: &[&str] = &[
    "cloudId",
    "gseIndex",
    "iterationIndex",
    "container_id",
    "_iteration_idx",
];
const NUMERIC_FIELD_TYPES: &[&str] = &["integer", "long", "float", "double", "int", "bigint"];
const MAX_DIMENSIONS: usize = 1000;
const LOG_KEYWORD_FIELD: &str = "_index";
const DEFAULT_TIME_FIELD: &str = "dtEventTimeStamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogIndexSet {
    pub index_set_id: i64,
    #[serde(default)]
    pub index_set_name: String,
    #[serde(default)]
    pub bk_biz_id: i64,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub time_field: Option<String>,
    #[serde(default)]
    pub scenario_id: String,
    #[serde(default)]
    pub scenario_name: String,
    #[serde(default)]
    pub storage_cluster_id: Option<i64>,
    #[serde(default)]
    pub indices: Vec<LogIndex>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogIndex {
    pub result_table_id: String,
    #[serde(default)]
    pub result_table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogIndexField {
    pub field_name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub es_doc_values: bool,
}

#[derive(Debug, Deserialize)]
struct IndexFieldsResponse {
    #[serde(default)]
    fields: Vec<LogIndexField>,
}

impl LogIndexSet {
    fn category(&self) -> &str {
        self.category_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or("other_rt")
    }

    /// Fill registry gaps once, at enumeration time.
    fn with_defaults(mut self, bk_biz_id: i64) -> Self {
        self.bk_biz_id = bk_biz_id;
        self.category_id = Some(self.category().to_string());
        if self.time_field.as_deref().map_or(true, str::is_empty) {
            self.time_field = Some(DEFAULT_TIME_FIELD.to_string());
        }
        self
    }

    fn joined_indices(&self) -> (String, String) {
        let ids: Vec<&str> = self
            .indices
            .iter()
            .map(|i| i.result_table_id.as_str())
            .collect();
        let names: Vec<&str> = self
            .indices
            .iter()
            .map(|i| {
                if i.result_table_name.is_empty() {
                    i.result_table_id.as_str()
                } else {
                    i.result_table_name.as_str()
                }
            })
            .collect();
        (ids.join(","), names.join(","))
    }
}

impl LogIndexField {
    fn is_metric(&self) -> bool {
        self.es_doc_values
            && NUMERIC_FIELD_TYPES.contains(&self.field_type.as_str())
            && !BUILTIN_DIMENSIONS.contains(&self.field_name.as_str())
    }

    fn display_name(&self) -> &str {
        if self.description.is_empty() {
            &self.field_name
        } else {
            &self.description
        }
    }
}

pub struct LogSearchAdapter {
    backend: Arc<dyn RegistryBackend>,
}

impl LogSearchAdapter {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }

    async fn load_cluster_names(&self, state: &mut AdapterRunState) {
        #[derive(Deserialize)]
        struct Cluster {
            cluster_config: ClusterConfig,
        }
        #[derive(Deserialize)]
        struct ClusterConfig {
            cluster_id: i64,
            #[serde(default)]
            cluster_name: String,
        }

        let endpoint = Endpoint::StorageClusters;
        let clusters = match self.backend.fetch(state.run_id, &endpoint).await {
            Ok(value) => decode::<Vec<Cluster>>(&endpoint, value),
            Err(err) => Err(err),
        };
        match clusters {
            Ok(clusters) => {
                state.cluster_names = clusters
                    .into_iter()
                    .map(|c| {
                        let config = c.cluster_config;
                        (config.cluster_id.to_string(), config.cluster_name)
                    })
                    .collect();
            }
            Err(err) => {
                warn!(error = %err, "storage clusters unavailable; cluster names left blank");
                state.cluster_names.clear();
            }
        }
    }

    fn base_descriptor(
        &self,
        state: &AdapterRunState,
        set: &LogIndexSet,
        kind: DataTypeLabel,
        metric_field: &str,
        metric_field_name: &str,
    ) -> MetricDescriptor {
        let (table_ids, table_names) = set.joined_indices();
        let category = set.category();
        let namespace = SourceNamespace::new(DataSourceLabel::BkLogSearch, kind);

        let mut d = MetricDescriptor::new(namespace, set.bk_biz_id, table_ids, metric_field);
        d.result_table_name = table_names;
        d.metric_field_name = metric_field_name.to_string();
        d.related_id = set.index_set_id.to_string();
        d.related_name = set.index_set_name.clone();
        d.category_display = set.index_set_name.clone();
        d.result_table_label = category.to_string();
        d.result_table_label_name = state.label_name(category);
        d.data_target = data_target_for(category, DataSourceLabel::BkLogSearch);
        d.extend_fields = BTreeMap::from([
            ("index_set_id".to_string(), json!(set.index_set_id)),
            (
                "time_field".to_string(),
                json!(set.time_field.clone().unwrap_or_default()),
            ),
            ("scenario_name".to_string(), json!(set.scenario_name)),
            ("scenario_id".to_string(), json!(set.scenario_id)),
            (
                "storage_cluster_id".to_string(),
                set.storage_cluster_id.map_or(JsonValue::Null, |id| json!(id)),
            ),
            (
                "storage_cluster_name".to_string(),
                json!(state.cluster_name(set.storage_cluster_id)),
            ),
        ]);
        d
    }
}

#[async_trait]
impl SourceAdapter for LogSearchAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::LogTimeSeries
    }

    async fn prepare(&self, state: &mut AdapterRunState) -> Result<(), AdapterError> {
        load_label_names(self.backend.as_ref(), state).await;
        self.load_cluster_names(state).await;
        Ok(())
    }

    async fn list_tables(&self, state: &AdapterRunState) -> Result<Vec<RawTable>, AdapterError> {
        let bk_biz_id = state
            .bk_biz_id
            .ok_or(AdapterError::ScopeRequired(SourceType::LogTimeSeries))?;
        let endpoint = Endpoint::LogIndexSets { bk_biz_id };
        let value = self.backend.fetch(state.run_id, &endpoint).await?;
        let sets: Vec<LogIndexSet> = decode(&endpoint, value)?;
        Ok(sets
            .into_iter()
            .map(|s| RawTable::LogIndexSet(s.with_defaults(bk_biz_id)))
            .collect())
    }

    async fn list_metrics(
        &self,
        state: &AdapterRunState,
        table: &RawTable,
    ) -> Result<Vec<MetricDescriptor>, AdapterError> {
        let RawTable::LogIndexSet(set) = table else {
            return Err(AdapterError::Message(format!(
                "log search adapter cannot read {}",
                table.table_id()
            )));
        };

        let endpoint = Endpoint::LogIndexFields {
            bk_biz_id: set.bk_biz_id,
            index_set_id: set.index_set_id,
        };
        let value = self.backend.fetch(state.run_id, &endpoint).await?;
        let fields = decode::<IndexFieldsResponse>(&endpoint, value)?.fields;

        let dimensions: Vec<Dimension> = fields
            .iter()
            .filter(|f| !matches!(f.field_type.as_str(), "date" | "text"))
            .take(MAX_DIMENSIONS)
            .map(|f| {
                Dimension::new(f.field_name.clone(), f.display_name())
                    .with_is_dimension(f.es_doc_values)
            })
            .collect();

        let mut metrics: Vec<MetricDescriptor> = fields
            .iter()
            .filter(|f| f.is_metric())
            .map(|f| {
                self.base_descriptor(
                    state,
                    set,
                    DataTypeLabel::TimeSeries,
                    &f.field_name,
                    f.display_name(),
                )
            })
            .collect();
        metrics.push(self.base_descriptor(
            state,
            set,
            DataTypeLabel::Log,
            LOG_KEYWORD_FIELD,
            &set.index_set_name,
        ));

        for metric in &mut metrics {
            metric.dimensions = dimensions
                .iter()
                .filter(|d| d.id != metric.metric_field)
                .cloned()
                .collect();
        }
        Ok(metrics)
    }
}
