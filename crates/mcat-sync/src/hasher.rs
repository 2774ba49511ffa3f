use std::collections::HashMap;

use mcat_core::{MetricDescriptor, SourceNamespace};
use mcat_storage::{StoreError, UsageFrequencySource};
use sha2::{Digest, Sha256};

/// Content fingerprint of a descriptor.
///
/// The digest covers every descriptor field, including `use_frequency`, and
/// nothing derived from it: readable names, timestamps and row ids never
/// reach the hasher. Collections whose order carries no meaning are sorted
/// first, and JSON object keys serialize in sorted order, so equal
/// descriptors hash equally however they were built. Output is 64 hex
/// characters and so never collides with the curated-row sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn fingerprint(&self, descriptor: &MetricDescriptor) -> String {
        let mut canonical = descriptor.clone();
        canonical.dimensions.sort_by(|a, b| a.id.cmp(&b.id));
        canonical.default_dimensions.sort();
        canonical.collect_config_ids.sort_unstable();

        // Serializing a plain struct of strings, numbers and JSON values
        // cannot fail; fall back to Debug output rather than panic.
        let payload = serde_json::to_vec(&canonical)
            .unwrap_or_else(|_| format!("{canonical:?}").into_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hex::encode(hasher.finalize())
    }
}

/// Reference counts of metrics in alert query configs, keyed by
/// `<data_source_label>.<result_table_id>.<metric_field>`.
#[derive(Debug, Clone, Default)]
pub struct UsageFrequencyIndex {
    counts: HashMap<String, u64>,
}

impl UsageFrequencyIndex {
    pub async fn build(
        source: &dyn UsageFrequencySource,
        namespaces: &[SourceNamespace],
    ) -> Result<Self, StoreError> {
        let counts = source.reference_counts(namespaces).await?;
        Ok(Self::from_counts(counts))
    }

    pub fn from_counts(counts: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut index = Self::default();
        for (key, count) in counts {
            *index.counts.entry(key).or_default() += count;
        }
        index
    }

    pub fn frequency(&self, descriptor: &MetricDescriptor) -> u64 {
        self.counts
            .get(&descriptor.usage_key())
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
