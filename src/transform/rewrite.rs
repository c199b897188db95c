// src/transform/rewrite.rs

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, info, instrument};

use super::{TransformOutput, TransformSpec, TransformStep};
use crate::{
    error::{ConfigError, TransformError},
    pipeline::RunContext,
    schema::RenameMap,
    storage::{fetch_to_file, ObjectStore, ObjectUri, SourceLocation},
};

const UTF8_BOM: char = '\u{feff}';

/// In-process transform: fetch, drop a column, rename, reorder, upload.
///
/// This is also what the transform container image runs.
pub struct CsvTransform {
    task_id: String,
    spec: TransformSpec,
    target: ObjectUri,
    store: Arc<dyn ObjectStore>,
}

impl CsvTransform {
    pub fn new(
        task_id: impl Into<String>,
        spec: TransformSpec,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        let target = spec.target_uri()?;
        Ok(Self {
            task_id: task_id.into(),
            spec,
            target,
            store,
        })
    }

    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    #[instrument(level = "info", skip(self), fields(pipeline = %self.spec.pipeline_name))]
    pub async fn execute(&self) -> Result<TransformOutput, TransformError> {
        let start = Instant::now();
        let spec = &self.spec;

        // ─── 1) fetch source into staging ────────────────────────────────
        let source = SourceLocation::parse(&spec.source_url)?;
        fetch_to_file(self.store.as_ref(), &source, &spec.source_file)
            .await
            .map_err(|source| TransformError::SourceUnreachable {
                url: spec.source_url.clone(),
                source,
            })?;

        // ─── 2) rewrite columns on the blocking pool ─────────────────────
        let rows = tokio::task::spawn_blocking({
            let spec = spec.clone();
            move || rewrite_file(&spec)
        })
        .await
        .map_err(|e| {
            TransformError::io(
                &spec.target_file,
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })??;

        // ─── 3) upload the cleaned file ──────────────────────────────────
        let target = self.target.clone();
        let data = tokio::fs::read(&spec.target_file)
            .await
            .map_err(|e| TransformError::io(&spec.target_file, e))?;
        self.store
            .put(&target, data)
            .await
            .map_err(|source| TransformError::Upload {
                uri: target.to_string(),
                source,
            })?;

        info!(
            rows,
            object = %target,
            elapsed = ?start.elapsed(),
            "transform complete"
        );
        Ok(TransformOutput {
            object: target,
            rows: Some(rows),
        })
    }
}

#[async_trait]
impl TransformStep for CsvTransform {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn output_headers(&self) -> &[String] {
        &self.spec.csv_headers
    }

    fn output_object(&self) -> &ObjectUri {
        &self.target
    }

    async fn run(&self, ctx: &RunContext) -> Result<TransformOutput, TransformError> {
        debug!(run_id = %ctx.run_id, task = %self.task_id, "running in-process transform");
        self.execute().await
    }
}

fn rewrite_file(spec: &TransformSpec) -> Result<u64, TransformError> {
    if let Some(parent) = spec.target_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TransformError::io(parent, e))?;
    }
    let input = File::open(&spec.source_file).map_err(|e| TransformError::io(&spec.source_file, e))?;
    let output =
        File::create(&spec.target_file).map_err(|e| TransformError::io(&spec.target_file, e))?;

    rewrite_columns(
        BufReader::new(input),
        BufWriter::new(output),
        &spec.column_to_remove,
        &spec.rename_mappings,
        &spec.csv_headers,
    )
}

/// Blank header cells get the positional name `Unnamed: <index>`; a leading
/// byte-order mark is dropped.
fn normalize_header(record: &StringRecord) -> Vec<String> {
    record
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            let name = if idx == 0 {
                raw.trim_start_matches(UTF8_BOM)
            } else {
                raw
            };
            if name.trim().is_empty() {
                format!("Unnamed: {}", idx)
            } else {
                name.to_string()
            }
        })
        .collect()
}

fn malformed(err: csv::Error) -> TransformError {
    TransformError::MalformedRow {
        line: err.position().map(|p| p.line()).unwrap_or(0),
        reason: err.to_string(),
    }
}

/// Stream `input` to `output`, dropping `column_to_remove`, renaming the rest
/// through `rename` and writing them in `headers` order. Returns data rows written.
///
/// The remaining source header must be exactly the rename map's key set.
pub fn rewrite_columns<R: Read, W: Write>(
    input: R,
    output: W,
    column_to_remove: &str,
    rename: &RenameMap,
    headers: &[String],
) -> Result<u64, TransformError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);
    let mut records = reader.records();

    let header = match records.next() {
        Some(record) => normalize_header(&record.map_err(malformed)?),
        None => return Err(TransformError::EmptySource),
    };

    // 1) header sanity
    let mut seen = HashSet::new();
    for name in &header {
        if !seen.insert(name.as_str()) {
            return Err(TransformError::DuplicateColumn(name.clone()));
        }
    }
    if !seen.contains(column_to_remove) {
        return Err(TransformError::MissingColumnToRemove(
            column_to_remove.to_string(),
        ));
    }

    // 2) kept columns must be exactly the rename domain
    for source in rename.sources() {
        if source == column_to_remove || !seen.contains(source) {
            return Err(TransformError::MissingRenameSource(source.to_string()));
        }
    }
    if let Some(extra) = header
        .iter()
        .find(|name| name.as_str() != column_to_remove && !rename.contains_source(name))
    {
        return Err(TransformError::UnmappedColumn(extra.clone()));
    }

    // 3) output position → source index
    let projection = headers
        .iter()
        .map(|target| {
            rename
                .source_for(target)
                .and_then(|source| header.iter().position(|h| h == source))
                .ok_or_else(|| {
                    TransformError::InvalidSpec(ConfigError::HeaderMismatch(format!(
                        "CSV header `{}` is not a rename target",
                        target
                    )))
                })
        })
        .collect::<Result<Vec<usize>, _>>()?;

    // 4) stream rows
    let mut writer = WriterBuilder::new().from_writer(output);
    writer.write_record(headers).map_err(malformed)?;

    let mut rows = 0u64;
    for record in records {
        let record = record.map_err(malformed)?;
        if record.len() != header.len() {
            return Err(TransformError::MalformedRow {
                line: record.position().map(|p| p.line()).unwrap_or(0),
                reason: format!(
                    "expected {} fields, found {}",
                    header.len(),
                    record.len()
                ),
            });
        }
        writer
            .write_record(projection.iter().map(|&idx| &record[idx]))
            .map_err(malformed)?;
        rows += 1;
    }

    writer.flush().map_err(|e| TransformError::io("<output>", e))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::series_summary,
        storage::{LocalStore, ObjectUri},
        transform::tests::series_spec,
    };
    use chrono::Utc;
    use tempfile::tempdir;

    fn small_map() -> RenameMap {
        RenameMap::new(vec![
            ("Series Code".into(), "series_code".into()),
            ("Topic".into(), "topic".into()),
        ])
        .unwrap()
    }

    fn headers() -> Vec<String> {
        vec!["series_code".into(), "topic".into()]
    }

    fn run(input: &str, remove: &str) -> Result<(u64, String), TransformError> {
        let mut out = Vec::new();
        let rows = rewrite_columns(input.as_bytes(), &mut out, remove, &small_map(), &headers())?;
        Ok((rows, String::from_utf8(out).unwrap()))
    }

    #[test]
    fn drops_trailing_unnamed_column_and_reorders() {
        let input = "\u{feff}Topic,Series Code,\nHealth,SH.XPD,\n\"Econ, misc\",NY.GDP,\n";
        let (rows, out) = run(input, "Unnamed: 2").unwrap();
        assert_eq!(rows, 2);
        assert_eq!(
            out,
            "series_code,topic\nSH.XPD,Health\nNY.GDP,\"Econ, misc\"\n"
        );
    }

    #[test]
    fn keeps_quoted_newlines() {
        let input = "Series Code,Topic,\nA,\"line one\nline two\",\n";
        let (rows, out) = run(input, "Unnamed: 2").unwrap();
        assert_eq!(rows, 1);
        assert_eq!(out, "series_code,topic\nA,\"line one\nline two\"\n");
    }

    #[test]
    fn missing_column_to_remove_fails() {
        let err = run("Series Code,Topic\nA,B\n", "Unnamed: 2").unwrap_err();
        assert!(matches!(err, TransformError::MissingColumnToRemove(ref c) if c == "Unnamed: 2"));
    }

    #[test]
    fn missing_rename_key_fails() {
        let err = run("Series Code,Other,\nA,B,\n", "Unnamed: 2").unwrap_err();
        assert!(matches!(err, TransformError::MissingRenameSource(ref c) if c == "Topic"));
    }

    #[test]
    fn unmapped_extra_column_fails() {
        let err = run("Series Code,Topic,Extra,\nA,B,C,\n", "Unnamed: 3").unwrap_err();
        assert!(matches!(err, TransformError::UnmappedColumn(ref c) if c == "Extra"));
    }

    #[test]
    fn ragged_row_fails() {
        let err = run("Series Code,Topic,\nA,B,\nA,B\n", "Unnamed: 2").unwrap_err();
        assert!(matches!(err, TransformError::MalformedRow { line: 3, .. }));
    }

    #[test]
    fn empty_source_fails() {
        assert!(matches!(
            run("", "Unnamed: 2").unwrap_err(),
            TransformError::EmptySource
        ));
    }

    #[test]
    fn full_series_header_is_rewritten() {
        let mut source_header: Vec<String> =
            series_summary::rename_map().sources().map(String::from).collect();
        source_header.push(String::new());
        let row = vec!["v"; 21].join(",");
        let input = format!("{}\n{}\n", source_header.join(","), row);

        let mut out = Vec::new();
        let rows = rewrite_columns(
            input.as_bytes(),
            &mut out,
            series_summary::COLUMN_TO_REMOVE,
            series_summary::rename_map(),
            &series_summary::csv_headers(),
        )
        .unwrap();
        assert_eq!(rows, 1);

        let out = String::from_utf8(out).unwrap();
        let first = out.lines().next().unwrap();
        assert_eq!(first, series_summary::csv_headers().join(","));
    }

    #[tokio::test]
    async fn execute_fetches_rewrites_and_uploads() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let store = Arc::new(LocalStore::new(tmp.path().join("objects")));

        let mut spec = series_spec();
        spec.source_file = tmp.path().join("files/data.csv");
        spec.target_file = tmp.path().join("files/data_output.csv");

        let mut header: Vec<String> =
            series_summary::rename_map().sources().map(String::from).collect();
        header.push(String::new());
        let body = format!(
            "{}\n{}\n{}\n",
            header.join(","),
            vec!["a"; 21].join(","),
            vec!["b"; 21].join(",")
        );
        let source: ObjectUri = spec.source_url.parse()?;
        store.put(&source, body.into_bytes()).await?;

        let step = CsvTransform::new("series_summary_transform_csv", spec.clone(), store.clone())?;
        let ctx = RunContext::manual(Utc::now());
        let out = step.run(&ctx).await?;

        assert_eq!(out.rows, Some(2));
        assert_eq!(out.object, spec.target_uri()?);
        let uploaded = String::from_utf8(store.get(&out.object).await?)?;
        assert_eq!(uploaded.lines().count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_source_is_a_transform_failure() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let store = Arc::new(LocalStore::new(tmp.path()));
        let mut spec = series_spec();
        spec.source_file = tmp.path().join("data.csv");
        spec.target_file = tmp.path().join("out.csv");

        let step = CsvTransform::new("t", spec, store)?;
        let err = step.execute().await.unwrap_err();
        assert!(matches!(err, TransformError::SourceUnreachable { .. }));
        assert!(!tmp.path().join("out.csv").exists());
        Ok(())
    }
}
