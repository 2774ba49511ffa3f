//! Core domain model for the metric catalog.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "mcat-core";

/// Fingerprint value marking a manually curated row. Such rows are never
/// deleted by reconciliation, and the content hasher never produces it.
pub const SENTINEL_FINGERPRINT: &str = "0";

/// Upper bound (in characters) for every identity column.
pub const MAX_IDENTITY_FIELD_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceLabel {
    BkMonitor,
    BkData,
    Custom,
    BkLogSearch,
    BkFta,
}

impl DataSourceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BkMonitor => "bk_monitor",
            Self::BkData => "bk_data",
            Self::Custom => "custom",
            Self::BkLogSearch => "bk_log_search",
            Self::BkFta => "bk_fta",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bk_monitor" => Some(Self::BkMonitor),
            "bk_data" => Some(Self::BkData),
            "custom" => Some(Self::Custom),
            "bk_log_search" => Some(Self::BkLogSearch),
            "bk_fta" => Some(Self::BkFta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeLabel {
    TimeSeries,
    Event,
    Log,
    Alert,
}

impl DataTypeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeSeries => "time_series",
            Self::Event => "event",
            Self::Log => "log",
            Self::Alert => "alert",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "time_series" => Some(Self::TimeSeries),
            "event" => Some(Self::Event),
            "log" => Some(Self::Log),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }
}

/// `(data_source_label, data_type_label)` pair. Identity keys are unique
/// only inside one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceNamespace {
    pub data_source_label: DataSourceLabel,
    pub data_type_label: DataTypeLabel,
}

impl SourceNamespace {
    pub const fn new(data_source_label: DataSourceLabel, data_type_label: DataTypeLabel) -> Self {
        Self {
            data_source_label,
            data_type_label,
        }
    }
}

impl fmt::Display for SourceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            self.data_source_label.as_str(),
            self.data_type_label.as_str()
        )
    }
}

/// What kind of monitoring target a metric can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataTarget {
    HostTarget,
    ServiceTarget,
    DeviceTarget,
    #[default]
    NoneTarget,
}

impl DataTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostTarget => "host_target",
            Self::ServiceTarget => "service_target",
            Self::DeviceTarget => "device_target",
            Self::NoneTarget => "none_target",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "host_target" => Some(Self::HostTarget),
            "service_target" => Some(Self::ServiceTarget),
            "device_target" => Some(Self::DeviceTarget),
            "none_target" => Some(Self::NoneTarget),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    #[default]
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: DimensionType,
    #[serde(default = "default_is_dimension")]
    pub is_dimension: bool,
}

fn default_is_dimension() -> bool {
    true
}

impl Dimension {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            field_type: DimensionType::String,
            is_dimension: true,
        }
    }

    pub fn with_type(mut self, field_type: DimensionType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn with_is_dimension(mut self, is_dimension: bool) -> Self {
        self.is_dimension = is_dimension;
        self
    }
}

/// Business-unique identity of a catalog row inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub bk_biz_id: i64,
    pub result_table_id: String,
    pub metric_field: String,
    pub related_id: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.bk_biz_id, self.result_table_id, self.metric_field, self.related_id
        )
    }
}

/// Normalized record describing one queryable metric, as produced by a
/// source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub bk_biz_id: i64,
    pub data_source_label: DataSourceLabel,
    pub data_type_label: DataTypeLabel,
    pub result_table_id: String,
    pub result_table_name: String,
    pub result_table_label: String,
    pub result_table_label_name: String,
    pub metric_field: String,
    pub metric_field_name: String,
    pub related_id: String,
    pub related_name: String,
    pub data_label: String,
    pub category_display: String,
    pub unit: String,
    pub unit_conversion: f64,
    pub description: String,
    pub data_target: DataTarget,
    pub dimensions: Vec<Dimension>,
    pub default_dimensions: Vec<String>,
    pub collect_config_ids: Vec<i64>,
    pub extend_fields: BTreeMap<String, JsonValue>,
    pub use_frequency: u64,
}

impl MetricDescriptor {
    pub fn new(
        namespace: SourceNamespace,
        bk_biz_id: i64,
        result_table_id: impl Into<String>,
        metric_field: impl Into<String>,
    ) -> Self {
        let result_table_id = result_table_id.into();
        let metric_field = metric_field.into();
        Self {
            bk_biz_id,
            data_source_label: namespace.data_source_label,
            data_type_label: namespace.data_type_label,
            result_table_name: result_table_id.clone(),
            result_table_id,
            result_table_label: String::new(),
            result_table_label_name: String::new(),
            metric_field_name: metric_field.clone(),
            metric_field,
            related_id: String::new(),
            related_name: String::new(),
            data_label: String::new(),
            category_display: String::new(),
            unit: String::new(),
            unit_conversion: 1.0,
            description: String::new(),
            data_target: DataTarget::NoneTarget,
            dimensions: Vec::new(),
            default_dimensions: Vec::new(),
            collect_config_ids: Vec::new(),
            extend_fields: BTreeMap::new(),
            use_frequency: 0,
        }
    }

    pub fn namespace(&self) -> SourceNamespace {
        SourceNamespace::new(self.data_source_label, self.data_type_label)
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            bk_biz_id: self.bk_biz_id,
            result_table_id: self.result_table_id.clone(),
            metric_field: self.metric_field.clone(),
            related_id: self.related_id.clone(),
        }
    }

    /// Key used by alert query configs to reference this metric.
    pub fn usage_key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.data_source_label.as_str(),
            self.result_table_id,
            self.metric_field
        )
    }

    /// Clamp identity columns to [`MAX_IDENTITY_FIELD_LEN`]. Returns whether
    /// anything was cut.
    pub fn truncate_identity_fields(&mut self) -> bool {
        let mut truncated = false;
        for field in [
            &mut self.result_table_id,
            &mut self.metric_field,
            &mut self.related_id,
        ] {
            truncated |= truncate_chars(field, MAX_IDENTITY_FIELD_LEN);
        }
        truncated
    }
}

fn truncate_chars(value: &mut String, max_chars: usize) -> bool {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            value.truncate(byte_idx);
            true
        }
        None => false,
    }
}

/// Human readable, query-language style name of a metric, e.g.
/// `custom:my_app:requests_total`.
pub fn readable_name(descriptor: &MetricDescriptor) -> String {
    let source = descriptor.data_source_label.as_str();
    if descriptor.data_source_label == DataSourceLabel::BkLogSearch {
        return format!("{}:{}:{}", source, descriptor.related_id, descriptor.metric_field);
    }

    let table = if descriptor.data_label.trim().is_empty() {
        descriptor
            .result_table_id
            .trim_end_matches(".__default__")
            .to_string()
    } else {
        descriptor.data_label.trim().to_string()
    };
    let table = table.replace('.', ":");
    if table.is_empty() {
        format!("{}:{}", source, descriptor.metric_field)
    } else {
        format!("{}:{}:{}", source, table, descriptor.metric_field)
    }
}

/// Catalog row that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRowDraft {
    pub descriptor: MetricDescriptor,
    pub fingerprint: String,
    pub readable_name: String,
    pub last_update: DateTime<Utc>,
}

/// Persisted catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub id: i64,
    pub descriptor: MetricDescriptor,
    pub fingerprint: String,
    pub readable_name: String,
    pub last_update: DateTime<Utc>,
}

impl CacheRow {
    pub fn from_draft(id: i64, draft: CacheRowDraft) -> Self {
        Self {
            id,
            descriptor: draft.descriptor,
            fingerprint: draft.fingerprint,
            readable_name: draft.readable_name,
            last_update: draft.last_update,
        }
    }

    pub fn is_curated(&self) -> bool {
        self.fingerprint == SENTINEL_FINGERPRINT
    }
}

/// Narrow projection of a catalog row: identity columns plus fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: i64,
    pub namespace: SourceNamespace,
    pub identity: IdentityKey,
    pub fingerprint: String,
}

impl PoolEntry {
    pub fn is_curated(&self) -> bool {
        self.fingerprint == SENTINEL_FINGERPRINT
    }
}

impl From<&CacheRow> for PoolEntry {
    fn from(row: &CacheRow) -> Self {
        Self {
            id: row.id,
            namespace: row.descriptor.namespace(),
            identity: row.descriptor.identity_key(),
            fingerprint: row.fingerprint.clone(),
        }
    }
}
