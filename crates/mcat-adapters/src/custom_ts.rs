use std::sync::Arc;

use async_trait::async_trait;
use mcat_core::{
    DataSourceLabel, DataTarget, DataTypeLabel, Dimension, MetricDescriptor, SourceNamespace,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{
    data_target_for, decode, load_label_names, AdapterError, AdapterRunState, Endpoint, RawTable,
    RegistryBackend, SourceAdapter, SourceType,
};

/// Built-in process tables are catalogued under the collector namespace,
/// not as custom time series.
const BUILTIN_PROCESS_TABLES: &[&str] = &["process.perf", "process.port"];

const TARGET_DIMENSIONS: &[&str] = &["bk_target_ip", "bk_target_service_instance_id"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesGroup {
    pub time_series_group_id: i64,
    #[serde(default)]
    pub time_series_group_name: String,
    #[serde(default)]
    pub bk_data_id: i64,
    #[serde(default)]
    pub bk_biz_id: i64,
    pub table_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub data_label: String,
    #[serde(default)]
    pub metric_info_list: Vec<MetricInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub tag_list: Vec<TagInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub field_name: String,
    #[serde(default)]
    pub description: String,
}

impl TimeSeriesGroup {
    /// Tables holding one metric per measurement collapse to
    /// `<db>.__default__`. Legacy single-table layouts (`<db>.base` holding
    /// several metrics, or one metric not named `base`) keep their id.
    pub fn is_split_measurement(&self) -> bool {
        if BUILTIN_PROCESS_TABLES.contains(&self.table_id.as_str()) {
            return false;
        }
        let legacy = self.table_id.ends_with(".base")
            && (self.metric_info_list.len() != 1
                || self.metric_info_list[0].field_name != "base");
        !legacy
    }

    pub fn catalog_table_id(&self) -> String {
        if self.is_split_measurement() {
            let db = self.table_id.split('.').next().unwrap_or_default();
            format!("{db}.__default__")
        } else {
            self.table_id.clone()
        }
    }
}

pub struct CustomTimeSeriesAdapter {
    backend: Arc<dyn RegistryBackend>,
}

impl CustomTimeSeriesAdapter {
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self { backend }
    }

    fn describe(
        &self,
        state: &AdapterRunState,
        group: &TimeSeriesGroup,
        metric: &MetricInfo,
    ) -> MetricDescriptor {
        let namespace = SourceNamespace::new(DataSourceLabel::Custom, DataTypeLabel::TimeSeries);
        let mut descriptor = MetricDescriptor::new(
            namespace,
            group.bk_biz_id,
            group.catalog_table_id(),
            metric.field_name.clone(),
        );
        descriptor.result_table_name = group.time_series_group_name.clone();
        descriptor.result_table_label = group.label.clone();
        descriptor.result_table_label_name = state.label_name(&group.label);
        descriptor.related_id = group.time_series_group_id.to_string();
        descriptor.related_name = group.time_series_group_name.clone();
        descriptor.data_label = group.data_label.clone();
        descriptor
            .extend_fields
            .insert("bk_data_id".to_string(), json!(group.bk_data_id));

        descriptor.metric_field_name = if metric.description.is_empty() {
            metric.field_name.clone()
        } else {
            metric.description.clone()
        };
        descriptor.unit = metric.unit.clone();
        descriptor.dimensions = metric
            .tag_list
            .iter()
            .map(|tag| {
                let name = if tag.description.is_empty() {
                    &tag.field_name
                } else {
                    &tag.description
                };
                Dimension::new(tag.field_name.clone(), name.clone())
            })
            .collect();

        let targeted = metric
            .tag_list
            .iter()
            .any(|tag| TARGET_DIMENSIONS.contains(&tag.field_name.as_str()));
        descriptor.data_target = if targeted {
            data_target_for(&group.label, DataSourceLabel::BkMonitor)
        } else {
            DataTarget::NoneTarget
        };
        descriptor
    }
}

#[async_trait]
impl SourceAdapter for CustomTimeSeriesAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::CustomTimeSeries
    }

    async fn prepare(&self, state: &mut AdapterRunState) -> Result<(), AdapterError> {
        load_label_names(self.backend.as_ref(), state).await;
        Ok(())
    }

    async fn list_tables(&self, state: &AdapterRunState) -> Result<Vec<RawTable>, AdapterError> {
        let endpoint = Endpoint::TimeSeriesGroups {
            bk_biz_id: state.bk_biz_id,
        };
        let value = self.backend.fetch(state.run_id, &endpoint).await?;
        let groups: Vec<TimeSeriesGroup> = decode(&endpoint, value)?;

        Ok(groups
            .into_iter()
            .filter(|g| state.bk_biz_id.map_or(true, |biz| g.bk_biz_id == biz))
            .filter(|g| {
                let builtin = BUILTIN_PROCESS_TABLES.contains(&g.table_id.as_str());
                if builtin {
                    debug!(table_id = %g.table_id, "skipping built-in process table");
                }
                !builtin
            })
            .map(RawTable::TimeSeriesGroup)
            .collect())
    }

    async fn list_metrics(
        &self,
        state: &AdapterRunState,
        table: &RawTable,
    ) -> Result<Vec<MetricDescriptor>, AdapterError> {
        let RawTable::TimeSeriesGroup(group) = table else {
            return Err(AdapterError::Message(format!(
                "custom time series adapter cannot read {}",
                table.table_id()
            )));
        };

        Ok(group
            .metric_info_list
            .iter()
            .filter(|m| !m.field_name.is_empty())
            .map(|m| self.describe(state, group, m))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture_backend;
    use uuid::Uuid;

    fn group(table_id: &str, fields: &[&str]) -> TimeSeriesGroup {
        TimeSeriesGroup {
            time_series_group_id: 1,
            time_series_group_name: "g".into(),
            bk_data_id: 0,
            bk_biz_id: 2,
            table_id: table_id.into(),
            label: "other_rt".into(),
            data_label: String::new(),
            metric_info_list: fields
                .iter()
                .map(|f| MetricInfo {
                    field_name: (*f).into(),
                    description: String::new(),
                    unit: String::new(),
                    tag_list: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn split_measurement_rules() {
        assert_eq!(
            group("2_bkmonitor_time_series_1.__default__", &["a", "b"]).catalog_table_id(),
            "2_bkmonitor_time_series_1.__default__"
        );
        assert_eq!(group("db.cpu", &["usage"]).catalog_table_id(), "db.__default__");
        assert_eq!(group("db.base", &["base"]).catalog_table_id(), "db.__default__");
        assert_eq!(group("db.base", &["a", "b"]).catalog_table_id(), "db.base");
        assert_eq!(group("db.base", &["usage"]).catalog_table_id(), "db.base");
        assert!(!group("process.perf", &["cpu"]).is_split_measurement());
    }

    #[tokio::test]
    async fn fixture_groups_become_custom_descriptors() {
        let adapter = CustomTimeSeriesAdapter::new(fixture_backend());
        let mut state = AdapterRunState::new(Uuid::new_v4(), Some(2));
        adapter.prepare(&mut state).await.expect("prepare");

        let tables = adapter.list_tables(&state).await.expect("tables");
        assert!(!tables.is_empty());
        assert!(tables.iter().all(|t| !t.table_id().starts_with("process.")));

        let mut descriptors = Vec::new();
        for table in &tables {
            descriptors.extend(adapter.list_metrics(&state, table).await.expect("metrics"));
        }

        let cpu = descriptors
            .iter()
            .find(|d| d.metric_field == "cpu_load")
            .expect("cpu_load metric");
        assert_eq!(cpu.result_table_id, "2_bkmonitor_time_series_1500001.__default__");
        assert_eq!(cpu.related_id, "11");
        assert_eq!(cpu.related_name, "app_metrics");
        assert_eq!(cpu.metric_field_name, "CPU load");
        assert_eq!(cpu.result_table_label_name, "Service Module");
        assert_eq!(cpu.data_target, DataTarget::ServiceTarget);
        assert_eq!(cpu.extend_fields["bk_data_id"], json!(1500001));

        let queue = descriptors
            .iter()
            .find(|d| d.metric_field == "queue_depth")
            .expect("queue_depth metric");
        assert_eq!(queue.metric_field_name, "queue_depth");
        assert_eq!(queue.data_target, DataTarget::NoneTarget);
        assert!(descriptors.iter().all(|d| !d.metric_field.is_empty()));
    }
}
