//! Source adapter contracts, the source-type registry, and the concrete
//! adapters that turn external registries into metric descriptors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mcat_core::{
    DataSourceLabel, DataTarget, DataTypeLabel, MetricDescriptor, SourceNamespace,
};
use mcat_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod backend;
mod bkdata;
mod custom_ts;
mod log_search;

pub use backend::{
    Endpoint, FixtureRegistryBackend, HttpRegistryBackend, Registry, RegistryBackend,
    RegistryUrls, BKDATA_PAGE_SIZE,
};
pub use bkdata::{BkdataAdapter, BkdataField, BkdataResultTable};
pub use custom_ts::{CustomTimeSeriesAdapter, MetricInfo, TagInfo, TimeSeriesGroup};
pub use log_search::{LogIndex, LogIndexField, LogIndexSet, LogSearchAdapter};

pub const CRATE_NAME: &str = "mcat-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{endpoint} is unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },
    #[error("{endpoint} returned an unexpected payload: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0} requires a business scope")]
    ScopeRequired(SourceType),
    #[error("{0}")]
    Message(String),
}

/// The ten catalog source types. Each one owns the catalog rows of its
/// namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "BKMONITOR")]
    BkMonitor,
    #[serde(rename = "BKMONITORK8S")]
    BkMonitorK8s,
    #[serde(rename = "CUSTOMEVENT")]
    CustomEvent,
    #[serde(rename = "CUSTOMTIMESERIES")]
    CustomTimeSeries,
    #[serde(rename = "BKFTAALERT")]
    BkFtaAlert,
    #[serde(rename = "BKDATA")]
    BkData,
    #[serde(rename = "LOGTIMESERIES")]
    LogTimeSeries,
    #[serde(rename = "BKMONITORALERT")]
    BkMonitorAlert,
    #[serde(rename = "BASEALARM")]
    BaseAlarm,
    #[serde(rename = "BKMONITORLOG")]
    BkMonitorLog,
}

/// Which business ids a source type is refreshed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusinessScope {
    /// One unscoped run covering every business.
    AllBusinesses,
    /// One run per positive business id.
    PerBusiness,
    /// One run per business, plus one for the global business 0.
    PerBusinessWithGlobal,
}

const fn ns(source: DataSourceLabel, kind: DataTypeLabel) -> SourceNamespace {
    SourceNamespace::new(source, kind)
}

impl SourceType {
    pub const ALL: [SourceType; 10] = [
        SourceType::BkMonitor,
        SourceType::BkMonitorK8s,
        SourceType::CustomEvent,
        SourceType::CustomTimeSeries,
        SourceType::BkFtaAlert,
        SourceType::BkData,
        SourceType::LogTimeSeries,
        SourceType::BkMonitorAlert,
        SourceType::BaseAlarm,
        SourceType::BkMonitorLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BkMonitor => "BKMONITOR",
            Self::BkMonitorK8s => "BKMONITORK8S",
            Self::CustomEvent => "CUSTOMEVENT",
            Self::CustomTimeSeries => "CUSTOMTIMESERIES",
            Self::BkFtaAlert => "BKFTAALERT",
            Self::BkData => "BKDATA",
            Self::LogTimeSeries => "LOGTIMESERIES",
            Self::BkMonitorAlert => "BKMONITORALERT",
            Self::BaseAlarm => "BASEALARM",
            Self::BkMonitorLog => "BKMONITORLOG",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let upper = value.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|t| t.as_str() == upper)
    }

    pub fn namespaces(&self) -> &'static [SourceNamespace] {
        use DataSourceLabel::*;
        use DataTypeLabel::*;
        match self {
            Self::BkMonitor | Self::BkMonitorK8s => {
                const NS: &[SourceNamespace] = &[ns(BkMonitor, TimeSeries)];
                NS
            }
            Self::CustomEvent => {
                const NS: &[SourceNamespace] = &[ns(Custom, Event)];
                NS
            }
            Self::CustomTimeSeries => {
                const NS: &[SourceNamespace] = &[ns(Custom, TimeSeries)];
                NS
            }
            Self::BkFtaAlert => {
                const NS: &[SourceNamespace] = &[ns(BkFta, Event), ns(BkFta, Alert)];
                NS
            }
            Self::BkData => {
                const NS: &[SourceNamespace] = &[ns(BkData, TimeSeries)];
                NS
            }
            Self::LogTimeSeries => {
                const NS: &[SourceNamespace] =
                    &[ns(BkLogSearch, TimeSeries), ns(BkLogSearch, Log)];
                NS
            }
            Self::BkMonitorAlert => {
                const NS: &[SourceNamespace] = &[ns(BkMonitor, Alert)];
                NS
            }
            Self::BaseAlarm => {
                const NS: &[SourceNamespace] = &[ns(BkMonitor, Event)];
                NS
            }
            Self::BkMonitorLog => {
                const NS: &[SourceNamespace] = &[ns(BkMonitor, Log)];
                NS
            }
        }
    }

    pub fn business_scope(&self) -> BusinessScope {
        match self {
            Self::BaseAlarm | Self::BkMonitorLog => BusinessScope::AllBusinesses,
            Self::BkData | Self::LogTimeSeries | Self::BkMonitorAlert => BusinessScope::PerBusiness,
            Self::BkMonitor
            | Self::BkMonitorK8s
            | Self::CustomEvent
            | Self::CustomTimeSeries
            | Self::BkFtaAlert => BusinessScope::PerBusinessWithGlobal,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run transient lookups. Built by [`SourceAdapter::prepare`] at the
/// start of one run and dropped with it; never shared between runs.
#[derive(Debug, Clone)]
pub struct AdapterRunState {
    pub run_id: Uuid,
    pub bk_biz_id: Option<i64>,
    pub label_names: HashMap<String, String>,
    pub cluster_names: HashMap<String, String>,
}

impl AdapterRunState {
    pub fn new(run_id: Uuid, bk_biz_id: Option<i64>) -> Self {
        Self {
            run_id,
            bk_biz_id,
            label_names: HashMap::new(),
            cluster_names: HashMap::new(),
        }
    }

    /// Display name of a result-table label, falling back to the label id.
    pub fn label_name(&self, label_id: &str) -> String {
        self.label_names
            .get(label_id)
            .cloned()
            .unwrap_or_else(|| label_id.to_string())
    }

    pub fn cluster_name(&self, cluster_id: Option<i64>) -> String {
        cluster_id
            .and_then(|id| self.cluster_names.get(&id.to_string()).cloned())
            .unwrap_or_default()
    }
}

/// Where a raw table's rows live in the catalog. Rows matching the anchor of
/// a table that failed to enumerate are kept instead of deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAnchor {
    pub result_table_id: Option<String>,
    pub related_id: Option<String>,
}

impl TableAnchor {
    pub fn covers(&self, result_table_id: &str, related_id: &str) -> bool {
        self.related_id.as_deref().is_some_and(|r| r == related_id)
            || self
                .result_table_id
                .as_deref()
                .is_some_and(|t| t == result_table_id)
    }
}

/// One table as returned by an external registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawTable {
    TimeSeriesGroup(TimeSeriesGroup),
    BkdataResultTable(BkdataResultTable),
    LogIndexSet(LogIndexSet),
}

impl RawTable {
    pub fn table_id(&self) -> String {
        match self {
            Self::TimeSeriesGroup(t) => t.table_id.clone(),
            Self::BkdataResultTable(t) => t.result_table_id.clone(),
            Self::LogIndexSet(t) => format!("index_set:{}", t.index_set_id),
        }
    }

    pub fn anchor(&self) -> TableAnchor {
        match self {
            Self::TimeSeriesGroup(t) => TableAnchor {
                result_table_id: None,
                related_id: Some(t.time_series_group_id.to_string()),
            },
            Self::BkdataResultTable(t) => TableAnchor {
                result_table_id: Some(t.result_table_id.clone()),
                related_id: None,
            },
            Self::LogIndexSet(t) => TableAnchor {
                result_table_id: None,
                related_id: Some(t.index_set_id.to_string()),
            },
        }
    }
}

/// Enumerates one external metric registry. The reconciliation engine is
/// agnostic to which implementation it drives.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    fn namespaces(&self) -> &'static [SourceNamespace] {
        self.source_type().namespaces()
    }

    /// Warm run-scoped lookups. Lookup failures degrade to empty maps.
    async fn prepare(&self, _state: &mut AdapterRunState) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn list_tables(&self, state: &AdapterRunState) -> Result<Vec<RawTable>, AdapterError>;

    async fn list_metrics(
        &self,
        state: &AdapterRunState,
        table: &RawTable,
    ) -> Result<Vec<MetricDescriptor>, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    #[serde(default)]
    result_table_label: Vec<LabelRecord>,
}

#[derive(Debug, Deserialize)]
struct LabelRecord {
    label_id: String,
    label_name: String,
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    endpoint: &Endpoint,
    value: serde_json::Value,
) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|source| AdapterError::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// Fill `state.label_names` from the metadata service.
pub(crate) async fn load_label_names(backend: &dyn RegistryBackend, state: &mut AdapterRunState) {
    let endpoint = Endpoint::ResultTableLabels;
    let labels = match backend.fetch(state.run_id, &endpoint).await {
        Ok(value) => decode::<LabelResponse>(&endpoint, value),
        Err(err) => Err(err),
    };
    match labels {
        Ok(labels) => {
            state.label_names = labels
                .result_table_label
                .into_iter()
                .map(|l| (l.label_id, l.label_name))
                .collect();
        }
        Err(err) => {
            warn!(error = %err, "result table labels unavailable; falling back to label ids");
            state.label_names.clear();
        }
    }
}

const HOST_LABELS: &[&str] = &["os", "host_process", "host_device", "hardware"];
const SERVICE_LABELS: &[&str] = &[
    "service_module",
    "component",
    "service_process",
    "uptimecheck",
];

/// Target classification of a result-table label for one source.
pub fn data_target_for(label: &str, source: DataSourceLabel) -> DataTarget {
    if source != DataSourceLabel::BkMonitor {
        return DataTarget::NoneTarget;
    }
    if HOST_LABELS.contains(&label) {
        DataTarget::HostTarget
    } else if SERVICE_LABELS.contains(&label) {
        DataTarget::ServiceTarget
    } else {
        DataTarget::NoneTarget
    }
}

/// Knobs for building adapters from the registry.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    /// Business owned by the computation platform itself; never enumerated.
    pub bkdata_platform_biz_id: Option<i64>,
}

/// Adapter implementation registered for `source_type`, if any.
pub fn adapter_for_source(
    source_type: SourceType,
    backend: Arc<dyn RegistryBackend>,
    options: &AdapterOptions,
) -> Option<Box<dyn SourceAdapter>> {
    match source_type {
        SourceType::CustomTimeSeries => Some(Box::new(CustomTimeSeriesAdapter::new(backend))),
        SourceType::BkData => Some(Box::new(
            BkdataAdapter::new(backend).with_platform_biz_id(options.bkdata_platform_biz_id),
        )),
        SourceType::LogTimeSeries => Some(Box::new(LogSearchAdapter::new(backend))),
        _ => None,
    }
}

pub fn implemented_source_types() -> Vec<SourceType> {
    vec![
        SourceType::CustomTimeSeries,
        SourceType::BkData,
        SourceType::LogTimeSeries,
    ]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_types_parse_case_insensitively() {
        assert_eq!(SourceType::parse("bkdata"), Some(SourceType::BkData));
        assert_eq!(
            SourceType::parse("CUSTOMTIMESERIES"),
            Some(SourceType::CustomTimeSeries)
        );
        assert_eq!(SourceType::parse("nope"), None);
        for t in SourceType::ALL {
            assert_eq!(SourceType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn implemented_source_types_have_disjoint_namespaces() {
        let mut seen = Vec::new();
        for t in implemented_source_types() {
            for ns in t.namespaces() {
                assert!(!seen.contains(ns), "{ns} owned twice");
                seen.push(*ns);
            }
        }
    }

    #[test]
    fn registry_builds_only_implemented_adapters() {
        let backend = test_support::fixture_backend();
        let options = AdapterOptions::default();
        for t in SourceType::ALL {
            let adapter = adapter_for_source(t, backend.clone(), &options);
            assert_eq!(adapter.is_some(), implemented_source_types().contains(&t), "{t}");
            if let Some(adapter) = adapter {
                assert_eq!(adapter.source_type(), t);
            }
        }
    }

    #[test]
    fn anchors_cover_rows_by_related_or_table_id() {
        let anchor = TableAnchor {
            result_table_id: None,
            related_id: Some("7".into()),
        };
        assert!(anchor.covers("anything", "7"));
        assert!(!anchor.covers("anything", "8"));

        let anchor = TableAnchor {
            result_table_id: Some("2_rt".into()),
            related_id: None,
        };
        assert!(anchor.covers("2_rt", ""));
    }

    #[test]
    fn data_target_only_maps_collector_labels() {
        assert_eq!(data_target_for("os", DataSourceLabel::BkMonitor), DataTarget::HostTarget);
        assert_eq!(
            data_target_for("component", DataSourceLabel::BkMonitor),
            DataTarget::ServiceTarget
        );
        assert_eq!(data_target_for("os", DataSourceLabel::Custom), DataTarget::NoneTarget);
    }

    #[test]
    fn run_state_falls_back_to_ids() {
        let mut state = AdapterRunState::new(Uuid::new_v4(), Some(2));
        state.label_names.insert("os".into(), "Operating System".into());
        assert_eq!(state.label_name("os"), "Operating System");
        assert_eq!(state.label_name("other_rt"), "other_rt");
        assert_eq!(state.cluster_name(None), "");
    }
}
