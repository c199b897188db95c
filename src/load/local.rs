// src/load/local.rs

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray},
    record_batch::RecordBatch,
    util::display::array_value_to_string,
};
use async_trait::async_trait;
use csv::ReaderBuilder;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{LoadJob, LoadSummary, TableId, Warehouse, WriteDisposition};
use crate::{
    error::LoadError,
    schema::{build_arrow_schema, Field, FieldMode, FieldType, TargetSchema},
    storage::ObjectStore,
};

const UTF8_BOM: char = '\u{feff}';

/// One parsed data row and the source line it started on.
type Row = (u64, Vec<Option<String>>);

/// File-backed warehouse: each table is one Parquet file at
/// `<root>/<dataset>/<table>.parquet`, replaced atomically on every load.
pub struct LocalWarehouse {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn table_path(&self, table: &TableId) -> PathBuf {
        let dataset = match &table.project {
            Some(project) => self.root.join(project).join(&table.dataset),
            None => self.root.join(&table.dataset),
        };
        dataset.join(format!("{}.parquet", table.table))
    }

    /// All rows of `table` rendered as strings, `None` for NULL. Missing table → empty.
    pub fn read_table(&self, table: &TableId) -> Result<Vec<Vec<Option<String>>>> {
        let mut rows = Vec::new();
        for batch in read_batches(&self.table_path(table))? {
            for i in 0..batch.num_rows() {
                let row = batch
                    .columns()
                    .iter()
                    .map(|col| {
                        if col.is_null(i) {
                            Ok(None)
                        } else {
                            array_value_to_string(col.as_ref(), i).map(Some)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .context("rendering table value")?;
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Arrow schema of the stored table, if it exists.
    pub fn table_schema(&self, table: &TableId) -> Result<Option<arrow::datatypes::SchemaRef>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        Ok(Some(builder.schema().clone()))
    }
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(1024)
        .build()?;
    let mut batches = Vec::new();
    while let Some(batch) = reader.next().transpose()? {
        batches.push(batch);
    }
    Ok(batches)
}

fn malformed(err: csv::Error) -> LoadError {
    LoadError::MalformedRow {
        line: err.position().map(|p| p.line()).unwrap_or(0),
        reason: err.to_string(),
    }
}

/// Parse and validate one CSV object. Nothing is written here.
fn parse_rows(data: &[u8], job: &LoadJob, rows: &mut Vec<Row>) -> Result<(), LoadError> {
    let schema = &job.schema;
    let expected = schema.names();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let mut seen = 0u64;
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(malformed)?;
        seen += 1;
        let line = record
            .position()
            .map(|p| p.line())
            .unwrap_or(idx as u64 + 1);

        if (idx as u64) < job.skip_leading_rows {
            // The first skipped row is the header and must name the schema's fields.
            if idx == 0 {
                let found: Vec<String> = record
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        if i == 0 {
                            v.trim_start_matches(UTF8_BOM).to_string()
                        } else {
                            v.to_string()
                        }
                    })
                    .collect();
                if found != expected {
                    return Err(LoadError::SchemaMismatch {
                        expected: expected.clone(),
                        found,
                    });
                }
            }
            continue;
        }

        if record.len() != schema.len() {
            return Err(LoadError::MalformedRow {
                line,
                reason: format!("expected {} fields, found {}", schema.len(), record.len()),
            });
        }
        if !job.allow_quoted_newlines && record.iter().any(|v| v.contains('\n') || v.contains('\r'))
        {
            return Err(LoadError::MalformedRow {
                line,
                reason: "quoted newline in field and allow_quoted_newlines is off".into(),
            });
        }

        let mut values = Vec::with_capacity(schema.len());
        for (value, field) in record.iter().zip(schema.fields()) {
            if value.is_empty() {
                if field.mode == FieldMode::Required {
                    return Err(LoadError::NullInRequired {
                        line,
                        field: field.name.clone(),
                    });
                }
                values.push(None);
            } else {
                values.push(Some(value.to_string()));
            }
        }
        rows.push((line, values));
    }

    if seen < job.skip_leading_rows {
        return Err(LoadError::SchemaMismatch {
            expected,
            found: Vec::new(),
        });
    }
    Ok(())
}

fn coercion(line: u64, field: &Field, value: &str) -> LoadError {
    LoadError::Coercion {
        line,
        field: field.name.clone(),
        ty: field.ty.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Turn validated rows into one Arrow column per schema field, coercing by type.
fn build_columns(schema: &TargetSchema, rows: &[Row]) -> Result<Vec<ArrayRef>, LoadError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());

    for (idx, field) in schema.fields().iter().enumerate() {
        let cells = rows.iter().map(|(line, values)| (*line, values[idx].as_deref()));

        let column: ArrayRef = match field.ty {
            FieldType::String => Arc::new(cells.map(|(_, v)| v).collect::<StringArray>()),
            FieldType::Integer => Arc::new(
                cells
                    .map(|(line, v)| match v {
                        None => Ok(None),
                        Some(s) => s
                            .trim()
                            .parse::<i64>()
                            .map(Some)
                            .map_err(|_| coercion(line, field, s)),
                    })
                    .collect::<Result<Int64Array, _>>()?,
            ),
            FieldType::Float => Arc::new(
                cells
                    .map(|(line, v)| match v {
                        None => Ok(None),
                        Some(s) => s
                            .trim()
                            .parse::<f64>()
                            .map(Some)
                            .map_err(|_| coercion(line, field, s)),
                    })
                    .collect::<Result<Float64Array, _>>()?,
            ),
            FieldType::Boolean => Arc::new(
                cells
                    .map(|(line, v)| match v {
                        None => Ok(None),
                        Some(s) => parse_bool(s.trim())
                            .map(Some)
                            .ok_or_else(|| coercion(line, field, s)),
                    })
                    .collect::<Result<BooleanArray, _>>()?,
            ),
        };
        columns.push(column);
    }
    Ok(columns)
}

/// Write `batches` to a temp file beside `path`, then rename over it.
fn replace_table_file(path: &Path, schema: arrow::datatypes::SchemaRef, batches: &[RecordBatch]) -> Result<u64> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("table path {} has no parent", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp table file in {}", dir.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), schema, Some(props))
        .context("creating parquet writer")?;

    let mut rows = 0u64;
    for batch in batches {
        writer.write(batch).context("writing batch to parquet")?;
        rows += batch.num_rows() as u64;
    }
    writer.close().context("closing parquet writer")?;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(rows)
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    async fn load(&self, job: &LoadJob) -> Result<LoadSummary, LoadError> {
        // 1) fetch and validate every source object before touching the table
        let mut rows: Vec<Row> = Vec::new();
        for uri in &job.source_uris {
            let data = self
                .store
                .get(uri)
                .await
                .map_err(|source| LoadError::SourceUnavailable {
                    uri: uri.to_string(),
                    source,
                })?;
            parse_rows(&data, job, &mut rows)?;
            debug!(object = %uri, rows = rows.len(), "parsed load source");
        }

        let arrow_schema = build_arrow_schema(&job.schema);
        let columns = build_columns(&job.schema, &rows)?;
        let incoming = RecordBatch::try_new(arrow_schema.clone(), columns)
            .map_err(|e| LoadError::Unavailable(e.into()))?;

        // 2) combine with what is already there, per disposition
        let path = self.table_path(&job.destination);
        let mut batches = match job.write_disposition {
            WriteDisposition::WriteTruncate => Vec::new(),
            WriteDisposition::WriteEmpty => {
                let existing = read_batches(&path).map_err(LoadError::Unavailable)?;
                if existing.iter().any(|b| b.num_rows() > 0) {
                    return Err(LoadError::TableNotEmpty(job.destination.to_string()));
                }
                Vec::new()
            }
            WriteDisposition::WriteAppend => {
                let existing = read_batches(&path).map_err(LoadError::Unavailable)?;
                if let Some(batch) = existing.first() {
                    if batch.schema().fields() != arrow_schema.fields() {
                        return Err(LoadError::SchemaMismatch {
                            expected: job.schema.names(),
                            found: batch
                                .schema()
                                .fields()
                                .iter()
                                .map(|f| f.name().clone())
                                .collect(),
                        });
                    }
                }
                existing
            }
        };
        if incoming.num_rows() > 0 {
            batches.push(incoming);
        }

        // 3) atomic replace on the blocking pool
        let table_rows = tokio::task::spawn_blocking({
            let path = path.clone();
            move || replace_table_file(&path, arrow_schema, &batches)
        })
        .await
        .map_err(|e| LoadError::Unavailable(e.into()))?
        .map_err(LoadError::Unavailable)?;

        info!(
            table = %job.destination,
            path = %path.display(),
            loaded = rows.len(),
            table_rows,
            "replaced local table"
        );
        Ok(LoadSummary {
            table: job.destination.clone(),
            rows_loaded: Some(rows.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::series_summary,
        storage::{LocalStore, ObjectUri},
    };
    use tempfile::tempdir;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<LocalStore>,
        warehouse: LocalWarehouse,
        source: ObjectUri,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path().join("objects")));
        let warehouse = LocalWarehouse::new(tmp.path().join("warehouse"), store.clone());
        Fixture {
            _tmp: tmp,
            store,
            warehouse,
            source: ObjectUri::new("bucket", "data/out.csv"),
        }
    }

    fn series_csv(rows: &[&str]) -> String {
        let mut out = series_summary::csv_headers().join(",");
        out.push('\n');
        for row in rows {
            out.push_str(row);
            out.push('\n');
        }
        out
    }

    fn row_of(prefix: &str) -> String {
        (0..20)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn job(f: &Fixture) -> LoadJob {
        LoadJob::csv(
            f.source.clone(),
            "world_bank_wdi.series_summary".parse().unwrap(),
            series_summary::schema().clone(),
        )
    }

    #[tokio::test]
    async fn loads_all_data_rows_as_strings() -> anyhow::Result<()> {
        let f = fixture();
        let (a, b, c) = (row_of("a"), row_of("b"), row_of("c"));
        let csv = series_csv(&[&a, &b, &c]);
        f.store.put(&f.source, csv.into_bytes()).await?;

        let summary = f.warehouse.load(&job(&f)).await?;
        assert_eq!(summary.rows_loaded, Some(3));

        let job = job(&f);
        let rows = f.warehouse.read_table(&job.destination)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0].as_deref(), Some("a0"));
        assert_eq!(rows[2][19].as_deref(), Some("c19"));

        let schema = f.warehouse.table_schema(&job.destination)?.unwrap();
        assert_eq!(schema.fields().len(), 20);
        assert!(schema
            .fields()
            .iter()
            .all(|fld| fld.data_type() == &arrow::datatypes::DataType::Utf8));
        Ok(())
    }

    #[tokio::test]
    async fn quoted_newlines_and_empty_values() -> anyhow::Result<()> {
        let f = fixture();
        let mut cells: Vec<String> = (0..20).map(|i| format!("v{}", i)).collect();
        cells[3] = "\"multi\nline\"".into();
        cells[5] = String::new();
        let row = cells.join(",");
        f.store.put(&f.source, series_csv(&[&row]).into_bytes()).await?;

        f.warehouse.load(&job(&f)).await?;
        let rows = f.warehouse.read_table(&job(&f).destination)?;
        assert_eq!(rows[0][3].as_deref(), Some("multi\nline"));
        assert_eq!(rows[0][5], None);

        let mut strict = job(&f);
        strict.allow_quoted_newlines = false;
        let err = f.warehouse.load(&strict).await.unwrap_err();
        assert!(matches!(err, LoadError::MalformedRow { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn missing_column_fails_and_keeps_previous_table() -> anyhow::Result<()> {
        let f = fixture();
        let good = row_of("g");
        f.store.put(&f.source, series_csv(&[&good]).into_bytes()).await?;
        f.warehouse.load(&job(&f)).await?;

        // drop the last column from header and row
        let mut headers = series_summary::csv_headers();
        headers.pop();
        let short_row = (0..19).map(|i| format!("s{}", i)).collect::<Vec<_>>().join(",");
        let bad = format!("{}\n{}\n", headers.join(","), short_row);
        f.store.put(&f.source, bad.into_bytes()).await?;

        let err = f.warehouse.load(&job(&f)).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));

        let rows = f.warehouse.read_table(&job(&f).destination)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_deref(), Some("g0"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_object_fails_and_keeps_previous_table() -> anyhow::Result<()> {
        let f = fixture();
        let good = row_of("g");
        f.store.put(&f.source, series_csv(&[&good]).into_bytes()).await?;
        f.warehouse.load(&job(&f)).await?;

        f.store.put(&f.source, Vec::new()).await?;
        let err = f.warehouse.load(&job(&f)).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { ref found, .. } if found.is_empty()));

        let rows = f.warehouse.read_table(&job(&f).destination)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_deref(), Some("g0"));
        Ok(())
    }

    #[tokio::test]
    async fn header_only_object_truncates_to_empty() -> anyhow::Result<()> {
        let f = fixture();
        let good = row_of("g");
        f.store.put(&f.source, series_csv(&[&good]).into_bytes()).await?;
        f.warehouse.load(&job(&f)).await?;

        f.store.put(&f.source, series_csv(&[]).into_bytes()).await?;
        let summary = f.warehouse.load(&job(&f)).await?;
        assert_eq!(summary.rows_loaded, Some(0));
        assert!(f.warehouse.read_table(&job(&f).destination)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn short_data_row_is_malformed() -> anyhow::Result<()> {
        let f = fixture();
        let short = (0..19).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        f.store.put(&f.source, series_csv(&[&short]).into_bytes()).await?;
        let err = f.warehouse.load(&job(&f)).await.unwrap_err();
        assert!(matches!(err, LoadError::MalformedRow { line: 2, .. }));
        assert!(!f.warehouse.table_path(&job(&f).destination).exists());
        Ok(())
    }

    #[tokio::test]
    async fn truncate_replace_is_idempotent() -> anyhow::Result<()> {
        let f = fixture();
        let (a, b) = (row_of("a"), row_of("b"));
        f.store.put(&f.source, series_csv(&[&a, &b]).into_bytes()).await?;

        f.warehouse.load(&job(&f)).await?;
        let first = f.warehouse.read_table(&job(&f).destination)?;
        f.warehouse.load(&job(&f)).await?;
        let second = f.warehouse.read_table(&job(&f).destination)?;

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn append_and_write_empty_dispositions() -> anyhow::Result<()> {
        let f = fixture();
        let a = row_of("a");
        f.store.put(&f.source, series_csv(&[&a]).into_bytes()).await?;

        let mut append = job(&f);
        append.write_disposition = WriteDisposition::WriteAppend;
        f.warehouse.load(&append).await?;
        f.warehouse.load(&append).await?;
        assert_eq!(f.warehouse.read_table(&append.destination)?.len(), 2);

        let mut empty_only = job(&f);
        empty_only.write_disposition = WriteDisposition::WriteEmpty;
        let err = f.warehouse.load(&empty_only).await.unwrap_err();
        assert!(matches!(err, LoadError::TableNotEmpty(_)));
        Ok(())
    }

    #[tokio::test]
    async fn coerces_typed_fields_and_enforces_required() -> anyhow::Result<()> {
        let f = fixture();
        let schema = TargetSchema::new(vec![
            Field {
                name: "code".into(),
                ty: FieldType::String,
                description: String::new(),
                mode: FieldMode::Required,
            },
            Field {
                name: "year".into(),
                ty: FieldType::Integer,
                description: String::new(),
                mode: FieldMode::Nullable,
            },
            Field {
                name: "value".into(),
                ty: FieldType::Float,
                description: String::new(),
                mode: FieldMode::Nullable,
            },
            Field {
                name: "flag".into(),
                ty: FieldType::Boolean,
                description: String::new(),
                mode: FieldMode::Nullable,
            },
        ])?;
        let mut job = LoadJob::csv(f.source.clone(), "wdi.values".parse()?, schema);

        f.store
            .put(&f.source, b"code,year,value,flag\nA,2020,1.5,true\nB,,,\n".to_vec())
            .await?;
        f.warehouse.load(&job).await?;
        let rows = f.warehouse.read_table(&job.destination)?;
        assert_eq!(rows[0][1].as_deref(), Some("2020"));
        assert_eq!(rows[0][3].as_deref(), Some("true"));
        assert_eq!(rows[1][1], None);

        f.store
            .put(&f.source, b"code,year,value,flag\nA,twenty,1.5,true\n".to_vec())
            .await?;
        let err = f.warehouse.load(&job).await.unwrap_err();
        assert!(matches!(err, LoadError::Coercion { ref field, .. } if field == "year"));

        f.store
            .put(&f.source, b"code,year,value,flag\n,2020,1.5,true\n".to_vec())
            .await?;
        let err = f.warehouse.load(&job).await.unwrap_err();
        assert!(matches!(err, LoadError::NullInRequired { ref field, .. } if field == "code"));

        job.skip_leading_rows = 0;
        f.store.put(&f.source, b"C,1,2.0,no\n".to_vec()).await?;
        f.warehouse.load(&job).await?;
        assert_eq!(f.warehouse.read_table(&job.destination)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_object_is_a_load_failure() {
        let f = fixture();
        let err = f.warehouse.load(&job(&f)).await.unwrap_err();
        assert!(matches!(err, LoadError::SourceUnavailable { .. }));
    }
}
