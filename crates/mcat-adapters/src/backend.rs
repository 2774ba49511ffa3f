use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mcat_storage::{unwrap_envelope, RegistryClient};
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::AdapterError;

/// Rows per `list_result_table` page.
pub const BKDATA_PAGE_SIZE: usize = 5000;

/// External service an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registry {
    Metadata,
    Bkdata,
    LogSearch,
}

impl Registry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Bkdata => "bkdata",
            Self::LogSearch => "log_search",
        }
    }
}

/// One registry call the adapters make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    ResultTableLabels,
    TimeSeriesGroups { bk_biz_id: Option<i64> },
    StorageClusters,
    BkdataResultTables { bk_biz_id: i64, page: usize },
    LogIndexSets { bk_biz_id: i64 },
    LogIndexFields { bk_biz_id: i64, index_set_id: i64 },
}

impl Endpoint {
    pub fn registry(&self) -> Registry {
        match self {
            Self::ResultTableLabels | Self::TimeSeriesGroups { .. } | Self::StorageClusters => {
                Registry::Metadata
            }
            Self::BkdataResultTables { .. } => Registry::Bkdata,
            Self::LogIndexSets { .. } | Self::LogIndexFields { .. } => Registry::LogSearch,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ResultTableLabels => "get_label",
            Self::TimeSeriesGroups { .. } => "query_time_series_group",
            Self::StorageClusters => "query_cluster_info",
            Self::BkdataResultTables { .. } => "list_result_table",
            Self::LogIndexSets { .. } => "search_index_set",
            Self::LogIndexFields { .. } => "search_index_fields",
        }
    }

    pub fn payload(&self) -> JsonValue {
        match self {
            Self::ResultTableLabels => json!({ "include_admin_only": true }),
            Self::TimeSeriesGroups { bk_biz_id } => match bk_biz_id {
                Some(id) => json!({ "bk_biz_id": id }),
                None => json!({}),
            },
            Self::StorageClusters => json!({ "cluster_type": "elasticsearch" }),
            Self::BkdataResultTables { bk_biz_id, page } => json!({
                "bk_biz_id": bk_biz_id,
                "storages": ["tspider", "mysql"],
                "page": page,
                "page_size": BKDATA_PAGE_SIZE,
            }),
            Self::LogIndexSets { bk_biz_id } => json!({ "bk_biz_id": bk_biz_id }),
            Self::LogIndexFields {
                bk_biz_id,
                index_set_id,
            } => json!({ "bk_biz_id": bk_biz_id, "index_set_id": index_set_id }),
        }
    }

    /// Fixture files tried in order, relative to the fixtures root. Pages
    /// after the first have their own `_page_<n>` files and no fallback.
    pub fn fixture_candidates(&self) -> Vec<PathBuf> {
        let dir = PathBuf::from(self.registry().as_str());
        let name = self.name();
        let scoped = match self {
            Self::TimeSeriesGroups {
                bk_biz_id: Some(id),
            }
            | Self::BkdataResultTables {
                bk_biz_id: id,
                page: 0 | 1,
            }
            | Self::LogIndexSets { bk_biz_id: id } => Some(format!("biz_{id}.json")),
            Self::BkdataResultTables { bk_biz_id, page } => {
                Some(format!("biz_{bk_biz_id}_page_{page}.json"))
            }
            Self::LogIndexFields { index_set_id, .. } => Some(format!("{index_set_id}.json")),
            _ => None,
        };

        let mut candidates = Vec::new();
        if let Some(file) = scoped {
            candidates.push(dir.join(name).join(file));
        }
        let unpaged = match self {
            Self::LogIndexFields { .. } => false,
            Self::BkdataResultTables { page, .. } => *page <= 1,
            _ => true,
        };
        if unpaged {
            candidates.push(dir.join(format!("{name}.json")));
        }
        candidates
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry().as_str(), self.name())
    }
}

/// Transport for registry calls. Adapters never talk to HTTP or disk
/// directly.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn fetch(&self, run_id: Uuid, endpoint: &Endpoint) -> Result<JsonValue, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct RegistryUrls {
    pub metadata: String,
    pub bkdata: String,
    pub log_search: String,
}

impl RegistryUrls {
    fn base(&self, registry: Registry) -> &str {
        match registry {
            Registry::Metadata => &self.metadata,
            Registry::Bkdata => &self.bkdata,
            Registry::LogSearch => &self.log_search,
        }
    }
}

pub struct HttpRegistryBackend {
    client: Arc<RegistryClient>,
    urls: RegistryUrls,
}

impl HttpRegistryBackend {
    pub fn new(client: Arc<RegistryClient>, urls: RegistryUrls) -> Self {
        Self { client, urls }
    }

    pub fn url_for(&self, endpoint: &Endpoint) -> String {
        format!(
            "{}/{}/",
            self.urls.base(endpoint.registry()).trim_end_matches('/'),
            endpoint.name()
        )
    }
}

#[async_trait]
impl RegistryBackend for HttpRegistryBackend {
    async fn fetch(&self, run_id: Uuid, endpoint: &Endpoint) -> Result<JsonValue, AdapterError> {
        let url = self.url_for(endpoint);
        let payload = endpoint.payload();
        let value = self
            .client
            .request_json(run_id, endpoint.registry().as_str(), &url, Some(&payload))
            .await?;
        Ok(value)
    }
}

/// Serves registry responses from JSON files, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureRegistryBackend {
    root: PathBuf,
}

impl FixtureRegistryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RegistryBackend for FixtureRegistryBackend {
    async fn fetch(&self, _run_id: Uuid, endpoint: &Endpoint) -> Result<JsonValue, AdapterError> {
        for candidate in endpoint.fixture_candidates() {
            let path = self.root.join(&candidate);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(AdapterError::Unavailable {
                        endpoint: endpoint.to_string(),
                        reason: format!("{}: {err}", path.display()),
                    })
                }
            };
            debug!(path = %path.display(), "serving registry fixture");
            let value: JsonValue =
                serde_json::from_slice(&bytes).map_err(|source| AdapterError::Decode {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            return Ok(unwrap_envelope(&path.display().to_string(), value)?);
        }

        Err(AdapterError::Unavailable {
            endpoint: endpoint.to_string(),
            reason: format!("no fixture under {}", self.root.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_endpoints_prefer_business_fixtures() {
        let candidates = Endpoint::LogIndexSets { bk_biz_id: 2 }.fixture_candidates();
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("log_search/search_index_set/biz_2.json"),
                PathBuf::from("log_search/search_index_set.json"),
            ]
        );

        let fields = Endpoint::LogIndexFields {
            bk_biz_id: 2,
            index_set_id: 9,
        }
        .fixture_candidates();
        assert_eq!(
            fields,
            vec![PathBuf::from("log_search/search_index_fields/9.json")]
        );

        let second_page = Endpoint::BkdataResultTables {
            bk_biz_id: 2,
            page: 2,
        };
        assert_eq!(
            second_page.fixture_candidates(),
            vec![PathBuf::from("bkdata/list_result_table/biz_2_page_2.json")]
        );
        assert_eq!(second_page.payload()["page"], 2);
        assert_eq!(second_page.payload()["page_size"], BKDATA_PAGE_SIZE);
    }

    #[test]
    fn http_urls_join_base_and_endpoint_name() {
        let client = Arc::new(
            RegistryClient::new(mcat_storage::HttpClientConfig::default()).expect("client"),
        );
        let backend = HttpRegistryBackend::new(
            client,
            RegistryUrls {
                metadata: "http://meta.local/api/".into(),
                bkdata: "http://bkdata.local".into(),
                log_search: "http://log.local".into(),
            },
        );
        assert_eq!(
            backend.url_for(&Endpoint::ResultTableLabels),
            "http://meta.local/api/get_label/"
        );
        assert_eq!(
            backend.url_for(&Endpoint::BkdataResultTables {
                bk_biz_id: 2,
                page: 1
            }),
            "http://bkdata.local/list_result_table/"
        );
    }

    #[tokio::test]
    async fn missing_fixture_is_unavailable_and_bad_json_is_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FixtureRegistryBackend::new(dir.path());
        let err = backend
            .fetch(Uuid::new_v4(), &Endpoint::StorageClusters)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { .. }));

        std::fs::create_dir_all(dir.path().join("metadata")).expect("mkdir");
        std::fs::write(dir.path().join("metadata/query_cluster_info.json"), b"{nope")
            .expect("write");
        let err = backend
            .fetch(Uuid::new_v4(), &Endpoint::StorageClusters)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Decode { .. }));
    }
}
