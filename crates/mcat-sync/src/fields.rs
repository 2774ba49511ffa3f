use std::collections::{BTreeMap, BTreeSet};

use mcat_storage::{FieldStore, FieldTag, ResultTableField, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::engine::BatchSizes;

const METRIC_FIELD_TYPE: &str = "float";
const TAG_FIELD_TYPE: &str = "string";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTagInfo {
    #[serde(default)]
    pub field_name: String,
    #[serde(default)]
    pub description: String,
}

/// One metric reported by a custom time-series group, with its tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetricInfo {
    pub field_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub tag_list: Vec<FieldTagInfo>,
    /// Tag names mapped to sampled values. Carries no descriptions; when
    /// present it replaces `tag_list`.
    #[serde(default)]
    pub tag_value_list: Option<BTreeMap<String, JsonValue>>,
}

fn default_active() -> bool {
    true
}

impl FieldMetricInfo {
    pub fn new(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            is_active: true,
            tag_list: Vec::new(),
            tag_value_list: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRefreshSummary {
    pub metrics_created: usize,
    pub metrics_updated: usize,
    pub tags_created: usize,
    pub tags_updated: usize,
}

/// Sync the field rows of one result table with the metric and tag info a
/// collector reported. Fields are only created or updated here, never
/// removed.
pub async fn refresh_rt_fields(
    store: &dyn FieldStore,
    table_id: &str,
    metric_info: &[FieldMetricInfo],
    batches: BatchSizes,
) -> Result<FieldRefreshSummary, StoreError> {
    let existing: BTreeMap<String, ResultTableField> = store
        .list_fields(table_id)
        .await?
        .into_iter()
        .map(|f| (f.field_name.clone(), f))
        .collect();

    let mut metric_states: BTreeMap<&str, bool> = BTreeMap::new();
    let mut tag_descriptions: BTreeMap<&str, &str> = BTreeMap::new();
    let mut described_tags: BTreeSet<&str> = BTreeSet::new();

    for info in metric_info {
        if info.field_name.is_empty() {
            continue;
        }
        metric_states
            .entry(info.field_name.as_str())
            .or_insert(info.is_active);

        match &info.tag_value_list {
            Some(values) => {
                for name in values.keys() {
                    tag_descriptions.entry(name.as_str()).or_insert("");
                }
            }
            None => {
                for tag in &info.tag_list {
                    if tag.field_name.is_empty() {
                        continue;
                    }
                    // First description wins.
                    if described_tags.insert(tag.field_name.as_str()) {
                        tag_descriptions.insert(tag.field_name.as_str(), tag.description.as_str());
                    }
                }
            }
        }
    }

    let mut to_create = Vec::new();
    let mut to_update = Vec::new();
    let mut summary = FieldRefreshSummary::default();

    for (&name, &active) in &metric_states {
        match existing.get(name) {
            None => {
                to_create.push(ResultTableField {
                    table_id: table_id.to_string(),
                    field_name: name.to_string(),
                    tag: FieldTag::Metric,
                    field_type: METRIC_FIELD_TYPE.to_string(),
                    description: String::new(),
                    is_disabled: !active,
                });
                summary.metrics_created += 1;
            }
            Some(field) if field.tag == FieldTag::Metric && field.is_disabled == active => {
                let mut changed = field.clone();
                changed.is_disabled = !active;
                to_update.push(changed);
                summary.metrics_updated += 1;
            }
            Some(_) => {}
        }
    }

    for (&name, &description) in &tag_descriptions {
        if metric_states.contains_key(name) && !existing.contains_key(name) {
            continue;
        }
        match existing.get(name) {
            None => {
                to_create.push(ResultTableField {
                    table_id: table_id.to_string(),
                    field_name: name.to_string(),
                    tag: FieldTag::Dimension,
                    field_type: TAG_FIELD_TYPE.to_string(),
                    description: description.to_string(),
                    is_disabled: false,
                });
                summary.tags_created += 1;
            }
            Some(field)
                if field.tag.is_tag_like()
                    && described_tags.contains(name)
                    && field.description != description =>
            {
                let mut changed = field.clone();
                changed.description = description.to_string();
                to_update.push(changed);
                summary.tags_updated += 1;
            }
            Some(_) => {}
        }
    }

    if !to_create.is_empty() {
        store.create_fields(to_create, batches.create).await?;
    }
    if !to_update.is_empty() {
        store.update_fields(to_update, batches.update).await?;
    }

    info!(
        table_id,
        metrics_created = summary.metrics_created,
        metrics_updated = summary.metrics_updated,
        tags_created = summary.tags_created,
        tags_updated = summary.tags_updated,
        "result table fields refreshed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcat_storage::InMemoryFieldStore;
    use serde_json::json;

    const TABLE: &str = "2_bkmonitor_time_series_1500001.__default__";

    fn tag(name: &str, description: &str) -> FieldTagInfo {
        FieldTagInfo {
            field_name: name.into(),
            description: description.into(),
        }
    }

    async fn field(store: &InMemoryFieldStore, name: &str) -> ResultTableField {
        store
            .list_fields(TABLE)
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.field_name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn creates_metrics_and_tags_with_first_description() {
        let store = InMemoryFieldStore::new();
        let mut cpu = FieldMetricInfo::new("cpu_load");
        cpu.tag_list = vec![tag("region", "Region"), tag("host", "")];
        let mut mem = FieldMetricInfo::new("mem_used");
        mem.is_active = false;
        mem.tag_list = vec![tag("region", "Another region"), tag("cpu_load", "clash")];

        let summary = refresh_rt_fields(&store, TABLE, &[cpu, mem], BatchSizes::default())
            .await
            .unwrap();
        assert_eq!(summary.metrics_created, 2);
        assert_eq!(summary.tags_created, 2);

        let fields = store.list_fields(TABLE).await.unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(field(&store, "region").await.description, "Region");
        assert_eq!(field(&store, "region").await.field_type, "string");
        assert_eq!(field(&store, "cpu_load").await.tag, FieldTag::Metric);
        assert!(field(&store, "mem_used").await.is_disabled);
        assert!(!field(&store, "cpu_load").await.is_disabled);
    }

    #[tokio::test]
    async fn second_refresh_only_touches_changed_fields() {
        let store = InMemoryFieldStore::new();
        let mut cpu = FieldMetricInfo::new("cpu_load");
        cpu.tag_list = vec![tag("region", "Region")];
        refresh_rt_fields(&store, TABLE, &[cpu.clone()], BatchSizes::default())
            .await
            .unwrap();

        let again = refresh_rt_fields(&store, TABLE, &[cpu.clone()], BatchSizes::default())
            .await
            .unwrap();
        assert_eq!(again, FieldRefreshSummary::default());

        cpu.is_active = false;
        cpu.tag_list = vec![tag("region", "Deployment region")];
        let changed = refresh_rt_fields(&store, TABLE, &[cpu], BatchSizes::default())
            .await
            .unwrap();
        assert_eq!(changed.metrics_updated, 1);
        assert_eq!(changed.tags_updated, 1);
        assert!(field(&store, "cpu_load").await.is_disabled);
        assert_eq!(field(&store, "region").await.description, "Deployment region");
    }

    #[tokio::test]
    async fn tag_value_list_never_overwrites_descriptions() {
        let store = InMemoryFieldStore::new();
        let mut cpu = FieldMetricInfo::new("cpu_load");
        cpu.tag_list = vec![tag("region", "Region")];
        refresh_rt_fields(&store, TABLE, &[cpu], BatchSizes::default())
            .await
            .unwrap();

        let mut sampled = FieldMetricInfo::new("cpu_load");
        sampled.tag_value_list = Some(BTreeMap::from([
            ("region".to_string(), json!(["eu", "us"])),
            ("zone".to_string(), json!(["a"])),
        ]));
        let summary = refresh_rt_fields(&store, TABLE, &[sampled], BatchSizes::default())
            .await
            .unwrap();
        assert_eq!(summary.tags_updated, 0);
        assert_eq!(summary.tags_created, 1);
        assert_eq!(field(&store, "region").await.description, "Region");
        assert_eq!(field(&store, "zone").await.description, "");
    }

    #[test]
    fn metric_info_defaults_to_active() {
        let info: FieldMetricInfo =
            serde_json::from_value(json!({ "field_name": "cpu_load" })).unwrap();
        assert!(info.is_active);
        assert!(info.tag_list.is_empty());
        assert!(info.tag_value_list.is_none());
    }
}
