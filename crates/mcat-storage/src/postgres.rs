use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcat_core::{
    CacheRow, CacheRowDraft, DataSourceLabel, DataTarget, DataTypeLabel, IdentityKey,
    MetricDescriptor, PoolEntry, SourceNamespace,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::{
    CacheColumn, CacheStore, FieldStore, FieldTag, ResultTableField, StoreError,
    UsageFrequencySource, MAX_CREATE_BATCH,
};

const FULL_COLUMNS: &str = "id, bk_biz_id, data_source_label, data_type_label, result_table_id, \
     result_table_name, result_table_label, result_table_label_name, metric_field, \
     metric_field_name, related_id, related_name, data_label, category_display, unit, \
     unit_conversion, description, data_target, dimensions, default_dimensions, \
     collect_config_ids, extend_fields, use_frequency, readable_name, metric_md5, last_update";

/// Postgres-backed catalog, usage-frequency source and field store.
#[derive(Debug, Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_namespace_filter(
    qb: &mut QueryBuilder<'_, Postgres>,
    namespaces: &[SourceNamespace],
) {
    qb.push("(");
    let mut any = qb.separated(" OR ");
    for ns in namespaces {
        any.push("(data_source_label = ")
            .push_bind_unseparated(ns.data_source_label.as_str())
            .push_unseparated(" AND data_type_label = ")
            .push_bind_unseparated(ns.data_type_label.as_str())
            .push_unseparated(")");
    }
    qb.push(")");
}

fn parse_namespace(id: i64, source: &str, kind: &str) -> Result<SourceNamespace, StoreError> {
    let data_source_label = DataSourceLabel::parse(source).ok_or_else(|| StoreError::CorruptRow {
        id,
        details: format!("unknown data_source_label {source}"),
    })?;
    let data_type_label = DataTypeLabel::parse(kind).ok_or_else(|| StoreError::CorruptRow {
        id,
        details: format!("unknown data_type_label {kind}"),
    })?;
    Ok(SourceNamespace::new(data_source_label, data_type_label))
}

fn pool_entry_from_row(row: &PgRow) -> Result<PoolEntry, StoreError> {
    let id: i64 = row.try_get("id")?;
    let source: String = row.try_get("data_source_label")?;
    let kind: String = row.try_get("data_type_label")?;
    Ok(PoolEntry {
        id,
        namespace: parse_namespace(id, &source, &kind)?,
        identity: IdentityKey {
            bk_biz_id: row.try_get("bk_biz_id")?,
            result_table_id: row.try_get("result_table_id")?,
            metric_field: row.try_get("metric_field")?,
            related_id: row.try_get("related_id")?,
        },
        fingerprint: row.try_get("metric_md5")?,
    })
}

fn cache_row_from_row(row: &PgRow) -> Result<CacheRow, StoreError> {
    let id: i64 = row.try_get("id")?;
    let source: String = row.try_get("data_source_label")?;
    let kind: String = row.try_get("data_type_label")?;
    let namespace = parse_namespace(id, &source, &kind)?;
    let target: String = row.try_get("data_target")?;
    let use_frequency: i64 = row.try_get("use_frequency")?;

    let mut descriptor = MetricDescriptor::new(
        namespace,
        row.try_get("bk_biz_id")?,
        row.try_get::<String, _>("result_table_id")?,
        row.try_get::<String, _>("metric_field")?,
    );
    descriptor.result_table_name = row.try_get("result_table_name")?;
    descriptor.result_table_label = row.try_get("result_table_label")?;
    descriptor.result_table_label_name = row.try_get("result_table_label_name")?;
    descriptor.metric_field_name = row.try_get("metric_field_name")?;
    descriptor.related_id = row.try_get("related_id")?;
    descriptor.related_name = row.try_get("related_name")?;
    descriptor.data_label = row.try_get("data_label")?;
    descriptor.category_display = row.try_get("category_display")?;
    descriptor.unit = row.try_get("unit")?;
    descriptor.unit_conversion = row.try_get("unit_conversion")?;
    descriptor.description = row.try_get("description")?;
    descriptor.data_target = DataTarget::parse(&target).unwrap_or_default();
    descriptor.dimensions = serde_json::from_value(row.try_get::<JsonValue, _>("dimensions")?)?;
    descriptor.default_dimensions =
        serde_json::from_value(row.try_get::<JsonValue, _>("default_dimensions")?)?;
    descriptor.collect_config_ids =
        serde_json::from_value(row.try_get::<JsonValue, _>("collect_config_ids")?)?;
    descriptor.extend_fields =
        serde_json::from_value(row.try_get::<JsonValue, _>("extend_fields")?)?;
    descriptor.use_frequency = u64::try_from(use_frequency).unwrap_or_default();

    Ok(CacheRow {
        id,
        descriptor,
        fingerprint: row.try_get("metric_md5")?,
        readable_name: row.try_get("readable_name")?,
        last_update: row.try_get("last_update")?,
    })
}

/// Column values with the JSON columns already encoded.
struct EncodedRow {
    descriptor: MetricDescriptor,
    fingerprint: String,
    readable_name: String,
    last_update: DateTime<Utc>,
    dimensions: JsonValue,
    default_dimensions: JsonValue,
    collect_config_ids: JsonValue,
    extend_fields: JsonValue,
}

impl EncodedRow {
    fn encode(
        descriptor: MetricDescriptor,
        fingerprint: String,
        readable_name: String,
        last_update: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            dimensions: serde_json::to_value(&descriptor.dimensions)?,
            default_dimensions: serde_json::to_value(&descriptor.default_dimensions)?,
            collect_config_ids: serde_json::to_value(&descriptor.collect_config_ids)?,
            extend_fields: serde_json::to_value(&descriptor.extend_fields)?,
            descriptor,
            fingerprint,
            readable_name,
            last_update,
        })
    }

    fn use_frequency(&self) -> i64 {
        i64::try_from(self.descriptor.use_frequency).unwrap_or(i64::MAX)
    }
}

fn bind_column<'qb, 'args>(
    set: &mut Separated<'qb, 'args, Postgres, &'static str>,
    column: CacheColumn,
    row: &EncodedRow,
) {
    let d = &row.descriptor;
    set.push(format!("{} = ", column.column_name()));
    match column {
        CacheColumn::ResultTableName => set.push_bind_unseparated(d.result_table_name.clone()),
        CacheColumn::ResultTableLabel => set.push_bind_unseparated(d.result_table_label.clone()),
        CacheColumn::ResultTableLabelName => {
            set.push_bind_unseparated(d.result_table_label_name.clone())
        }
        CacheColumn::MetricFieldName => set.push_bind_unseparated(d.metric_field_name.clone()),
        CacheColumn::RelatedName => set.push_bind_unseparated(d.related_name.clone()),
        CacheColumn::DataLabel => set.push_bind_unseparated(d.data_label.clone()),
        CacheColumn::CategoryDisplay => set.push_bind_unseparated(d.category_display.clone()),
        CacheColumn::Unit => set.push_bind_unseparated(d.unit.clone()),
        CacheColumn::UnitConversion => set.push_bind_unseparated(d.unit_conversion),
        CacheColumn::Description => set.push_bind_unseparated(d.description.clone()),
        CacheColumn::DataTarget => set.push_bind_unseparated(d.data_target.as_str()),
        CacheColumn::Dimensions => set.push_bind_unseparated(row.dimensions.clone()),
        CacheColumn::DefaultDimensions => {
            set.push_bind_unseparated(row.default_dimensions.clone())
        }
        CacheColumn::CollectConfigIds => {
            set.push_bind_unseparated(row.collect_config_ids.clone())
        }
        CacheColumn::ExtendFields => set.push_bind_unseparated(row.extend_fields.clone()),
        CacheColumn::UseFrequency => set.push_bind_unseparated(row.use_frequency()),
        CacheColumn::ReadableName => set.push_bind_unseparated(row.readable_name.clone()),
        CacheColumn::Fingerprint => set.push_bind_unseparated(row.fingerprint.clone()),
        CacheColumn::LastUpdate => set.push_bind_unseparated(row.last_update),
    };
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn query_pool(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<PoolEntry>, StoreError> {
        if namespaces.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, bk_biz_id, data_source_label, data_type_label, result_table_id, \
             metric_field, related_id, metric_md5 FROM metric_list_cache WHERE ",
        );
        push_namespace_filter(&mut qb, namespaces);
        if let Some(biz) = bk_biz_id {
            qb.push(" AND bk_biz_id = ").push_bind(biz);
        }
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(pool_entry_from_row).collect()
    }

    async fn fetch_rows(
        &self,
        namespaces: &[SourceNamespace],
        bk_biz_id: Option<i64>,
    ) -> Result<Vec<CacheRow>, StoreError> {
        if namespaces.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {FULL_COLUMNS} FROM metric_list_cache WHERE "
        ));
        push_namespace_filter(&mut qb, namespaces);
        if let Some(biz) = bk_biz_id {
            qb.push(" AND bk_biz_id = ").push_bind(biz);
        }
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(cache_row_from_row).collect()
    }

    async fn bulk_create(
        &self,
        rows: Vec<CacheRowDraft>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let encoded = rows
            .into_iter()
            .map(|r| EncodedRow::encode(r.descriptor, r.fingerprint, r.readable_name, r.last_update))
            .collect::<Result<Vec<_>, _>>()?;

        let mut created = 0;
        for chunk in encoded.chunks(batch_size.clamp(1, MAX_CREATE_BATCH)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO metric_list_cache (bk_biz_id, data_source_label, data_type_label, \
                 result_table_id, result_table_name, result_table_label, result_table_label_name, \
                 metric_field, metric_field_name, related_id, related_name, data_label, \
                 category_display, unit, unit_conversion, description, data_target, dimensions, \
                 default_dimensions, collect_config_ids, extend_fields, use_frequency, \
                 readable_name, metric_md5, last_update) ",
            );
            qb.push_values(chunk, |mut b, row| {
                let d = &row.descriptor;
                b.push_bind(d.bk_biz_id)
                    .push_bind(d.data_source_label.as_str())
                    .push_bind(d.data_type_label.as_str())
                    .push_bind(d.result_table_id.clone())
                    .push_bind(d.result_table_name.clone())
                    .push_bind(d.result_table_label.clone())
                    .push_bind(d.result_table_label_name.clone())
                    .push_bind(d.metric_field.clone())
                    .push_bind(d.metric_field_name.clone())
                    .push_bind(d.related_id.clone())
                    .push_bind(d.related_name.clone())
                    .push_bind(d.data_label.clone())
                    .push_bind(d.category_display.clone())
                    .push_bind(d.unit.clone())
                    .push_bind(d.unit_conversion)
                    .push_bind(d.description.clone())
                    .push_bind(d.data_target.as_str())
                    .push_bind(row.dimensions.clone())
                    .push_bind(row.default_dimensions.clone())
                    .push_bind(row.collect_config_ids.clone())
                    .push_bind(row.extend_fields.clone())
                    .push_bind(row.use_frequency())
                    .push_bind(row.readable_name.clone())
                    .push_bind(row.fingerprint.clone())
                    .push_bind(row.last_update);
            });
            let result = qb.build().execute(&self.pool).await?;
            created += result.rows_affected() as usize;
            debug!(batch = chunk.len(), "inserted metric cache batch");
        }
        Ok(created)
    }

    async fn bulk_update(
        &self,
        rows: Vec<CacheRow>,
        columns: &[CacheColumn],
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        if columns.is_empty() {
            return Ok(0);
        }
        let encoded = rows
            .into_iter()
            .map(|r| {
                let id = r.id;
                EncodedRow::encode(r.descriptor, r.fingerprint, r.readable_name, r.last_update)
                    .map(|e| (id, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut updated = 0;
        for chunk in encoded.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for (id, row) in chunk {
                let mut qb = QueryBuilder::<Postgres>::new("UPDATE metric_list_cache SET ");
                {
                    let mut set = qb.separated(", ");
                    for column in columns {
                        bind_column(&mut set, *column, row);
                    }
                }
                qb.push(" WHERE id = ").push_bind(*id);
                let result = qb.build().execute(&mut *tx).await?;
                updated += result.rows_affected() as usize;
            }
            tx.commit().await?;
            debug!(batch = chunk.len(), "updated metric cache batch");
        }
        Ok(updated)
    }

    async fn delete(&self, ids: &[i64], batch_size: usize) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for chunk in ids.chunks(batch_size.max(1)) {
            let result = sqlx::query("DELETE FROM metric_list_cache WHERE id = ANY($1)")
                .bind(chunk.to_vec())
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected() as usize;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl UsageFrequencySource for PgCacheStore {
    async fn reference_counts(
        &self,
        namespaces: &[SourceNamespace],
    ) -> Result<Vec<(String, u64)>, StoreError> {
        if namespaces.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT metric_id, COUNT(*) AS use_frequency FROM query_config WHERE ",
        );
        push_namespace_filter(&mut qb, namespaces);
        qb.push(" GROUP BY metric_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let metric_id: String = row.try_get("metric_id")?;
                let count: i64 = row.try_get("use_frequency")?;
                Ok((metric_id, u64::try_from(count).unwrap_or_default()))
            })
            .collect()
    }
}

#[async_trait]
impl FieldStore for PgCacheStore {
    async fn list_fields(&self, table_id: &str) -> Result<Vec<ResultTableField>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT table_id, field_name, tag, field_type, description, is_disabled
              FROM result_table_field
             WHERE table_id = $1
             ORDER BY field_name
            "#,
        )
        .bind(table_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let tag: String = row.try_get("tag")?;
            out.push(ResultTableField {
                table_id: row.try_get("table_id")?,
                field_name: row.try_get("field_name")?,
                tag: FieldTag::parse(&tag)
                    .ok_or_else(|| StoreError::Message(format!("unknown field tag {tag}")))?,
                field_type: row.try_get("field_type")?,
                description: row.try_get("description")?,
                is_disabled: row.try_get("is_disabled")?,
            });
        }
        Ok(out)
    }

    async fn create_fields(
        &self,
        fields: Vec<ResultTableField>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut created = 0;
        for chunk in fields.chunks(batch_size.max(1)) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO result_table_field \
                 (table_id, field_name, tag, field_type, description, is_disabled) ",
            );
            qb.push_values(chunk, |mut b, f| {
                b.push_bind(f.table_id.clone())
                    .push_bind(f.field_name.clone())
                    .push_bind(f.tag.as_str())
                    .push_bind(f.field_type.clone())
                    .push_bind(f.description.clone())
                    .push_bind(f.is_disabled);
            });
            created += qb.build().execute(&self.pool).await?.rows_affected() as usize;
        }
        Ok(created)
    }

    async fn update_fields(
        &self,
        fields: Vec<ResultTableField>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut updated = 0;
        for chunk in fields.chunks(batch_size.max(1)) {
            let mut tx = self.pool.begin().await?;
            for f in chunk {
                let result = sqlx::query(
                    r#"
                    UPDATE result_table_field
                       SET is_disabled = $3,
                           description = $4
                     WHERE table_id = $1
                       AND field_name = $2
                    "#,
                )
                .bind(&f.table_id)
                .bind(&f.field_name)
                .bind(f.is_disabled)
                .bind(&f.description)
                .execute(&mut *tx)
                .await?;
                updated += result.rows_affected() as usize;
            }
            tx.commit().await?;
        }
        Ok(updated)
    }
}
